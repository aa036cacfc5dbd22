pub mod kite;
pub mod simulated;
pub mod websocket;

pub use kite::KiteClient;
pub use simulated::{SimulatedBrokerage, SimulatedFeed};
pub use websocket::WebSocketTransport;
