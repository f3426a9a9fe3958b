// =============================================================================
// Futures Intelligence Module
// =============================================================================
//
// Slow-moving derivatives data polled over REST, per symbol:
//
//   1. Open Interest — participation level, published with a rolling 60 s
//      change baseline.
//   2. Funding Rate  — periodic long/short payment anchoring the perp to
//      spot, published with a countdown and trend.
//
// Both pollers write into shared per-symbol state that the metrics assembler
// reads on its tick.

pub mod funding_rate;
pub mod open_interest;

pub use funding_rate::{FundingBlock, FundingTracker};
pub use open_interest::{OiBlock, OpenInterestMonitor};
