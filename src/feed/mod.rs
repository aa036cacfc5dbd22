pub mod manager;
pub mod price_series;

pub use manager::{
    FeedConfig, FeedConnection, FeedHealth, FeedMode, MarketDataFeedManager, PriceCallback,
};
pub use price_series::{PriceSample, PriceSeries};
