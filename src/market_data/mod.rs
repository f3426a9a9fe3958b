pub mod cvd;
pub mod depth_stream;
pub mod orderbook;
pub mod rolling;
pub mod trade_stream;

// Re-export the per-symbol building blocks (e.g. `use crate::market_data::TradeAggregator`).
pub use cvd::CvdCalculator;
pub use orderbook::{BookSynchroniser, OrderBook};
pub use trade_stream::{Trade, TradeAggregator};
