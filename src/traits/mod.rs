pub mod brokerage;
pub mod market_data;

// Re-export all traits
pub use brokerage::{BrokerageClient, Reauthenticator};
pub use market_data::{PushTransport, SnapshotSource};

pub use brokerage::{
    FillLedgerEntry, LedgerStatus, OptionContract, OptionContractQuery, OrderLedgerEntry,
    OrderRequest, OrderSide, Quote,
};
pub use market_data::{FeedMessage, PriceUpdate};

#[cfg(test)]
pub use brokerage::MockBrokerageClient;
