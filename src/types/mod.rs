pub mod intent;
pub mod price;

pub use intent::{Direction, ExecutionMode, OptionType, TradeIntent, DEFAULT_STRATEGY};
pub use price::Price;
