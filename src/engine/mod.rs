// 8.0: the spine service. coordinates pack builds, the ledger gate, freshness-gated reads,
// attribution, metrics and rolling aggregates. deterministic apart from the injected clock
// and feeds.

mod analytics;
mod core;
mod packs;
mod results;

pub use core::Spine;
pub use results::{BuildOutcome, DailyJobReport, SpineError};
