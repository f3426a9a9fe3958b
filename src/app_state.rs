// =============================================================================
// Central Application State — FlowDeck orderflow engine
// =============================================================================
//
// The single source of truth for the process.  Each tracked symbol owns a
// pipeline of independent components; every component has exactly one writer
// task and any number of snapshot readers.
//
// Thread safety:
//   - parking_lot::RwLock around each per-symbol component.
//   - Arc wrappers for the hub and execution engine, which manage their own
//     interior mutability.
//   - The pipeline map itself is immutable after startup.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::execution::ExecutionEngine;
use crate::futures_intel::{FundingTracker, OpenInterestMonitor};
use crate::hub::SubscriptionHub;
use crate::market_data::{BookSynchroniser, CvdCalculator, TradeAggregator};
use crate::metrics::LegacyCalculator;
use crate::types::FeedState;

// =============================================================================
// SymbolPipeline
// =============================================================================

/// Every per-symbol component, each behind its own lock so the four writer
/// tasks (depth, trades, OI poll, funding poll) never contend with each other.
pub struct SymbolPipeline {
    pub symbol: String,
    pub book: Arc<RwLock<BookSynchroniser>>,
    pub trades: Arc<RwLock<TradeAggregator>>,
    pub cvd: Arc<RwLock<CvdCalculator>>,
    pub legacy: Arc<RwLock<LegacyCalculator>>,
    pub open_interest: Arc<RwLock<OpenInterestMonitor>>,
    pub funding: Arc<RwLock<FundingTracker>>,
}

impl SymbolPipeline {
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self {
            book: Arc::new(RwLock::new(BookSynchroniser::new(symbol.clone()))),
            trades: Arc::new(RwLock::new(TradeAggregator::new(symbol.clone()))),
            cvd: Arc::new(RwLock::new(CvdCalculator::new())),
            legacy: Arc::new(RwLock::new(LegacyCalculator::new())),
            open_interest: Arc::new(RwLock::new(OpenInterestMonitor::new(symbol.clone()))),
            funding: Arc::new(RwLock::new(FundingTracker::new(symbol.clone()))),
            symbol,
        }
    }

    /// Current publication state of this symbol's feed.
    pub fn feed_state(&self) -> FeedState {
        if self.book.read().is_synced() {
            FeedState::Live
        } else {
            FeedState::Stale
        }
    }
}

// =============================================================================
// Event log
// =============================================================================

/// A recorded operational event for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Bounded in-process event ring.  Overflow evicts the oldest entry and is
/// counted; crossing the halt threshold emits a one-time warning so a
/// runaway producer is visible without drowning the logs.
pub struct EventLog {
    entries: RwLock<VecDeque<EventRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    halt_threshold: u64,
    halt_warned: AtomicBool,
}

impl EventLog {
    pub fn new(capacity: usize, halt_threshold: u64) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
            halt_threshold,
            halt_warned: AtomicBool::new(false),
        }
    }

    pub fn push(&self, message: impl Into<String>) {
        self.push_with_code(message, None);
    }

    pub fn push_with_code(&self, message: impl Into<String>, code: Option<String>) {
        let record = EventRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut entries = self.entries.write();
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped >= self.halt_threshold && !self.halt_warned.swap(true, Ordering::Relaxed)
            {
                warn!(
                    dropped,
                    threshold = self.halt_threshold,
                    "event log drop threshold crossed — entries are being lost"
                );
            }
        }
    }

    pub fn recent(&self) -> Vec<EventRecord> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared process state, wrapped in `Arc` at startup.
pub struct AppState {
    pub config: Config,
    pub pipelines: HashMap<String, Arc<SymbolPipeline>>,
    pub hub: Arc<SubscriptionHub>,
    pub execution: Arc<ExecutionEngine>,
    pub events: EventLog,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let pipelines = config
            .symbols
            .iter()
            .map(|symbol| (symbol.clone(), Arc::new(SymbolPipeline::new(symbol.clone()))))
            .collect();

        let execution = Arc::new(ExecutionEngine::new(
            config.max_leverage,
            config.symbols.first().cloned().unwrap_or_default(),
        ));

        let events = EventLog::new(config.logger_queue_limit, config.logger_drop_halt_threshold);

        Self {
            pipelines,
            hub: Arc::new(SubscriptionHub::new()),
            execution,
            events,
            start_time: std::time::Instant::now(),
            config,
        }
    }

    pub fn pipeline(&self, symbol: &str) -> Option<Arc<SymbolPipeline>> {
        self.pipelines.get(symbol).cloned()
    }

    /// Health payload for `GET /api/health`.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let feeds = self
            .pipelines
            .values()
            .map(|p| (p.symbol.clone(), p.feed_state()))
            .collect();

        HealthSnapshot {
            status: "ok",
            server_time: Utc::now().timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            subscribers: self.hub.subscriber_count(),
            feeds,
            dropped_events: self.events.dropped_count(),
        }
    }
}

/// Payload of `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub server_time: i64,
    pub uptime_s: u64,
    pub subscribers: usize,
    pub feeds: HashMap<String, FeedState>,
    pub dropped_events: u64,
}
