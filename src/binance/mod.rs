pub mod client;

pub use client::{BinanceTestnetClient, SymbolFilters};
