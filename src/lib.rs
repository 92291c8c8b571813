// spine-core: pricing-pack truth spine for portfolio analytics.
// ledger-first architecture: nothing reaches a reader until it reconciles against the ledger.
// all computation is deterministic; the clock and every data feed are injected.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: PackId, Currency, Price, FxRate, Amount, Bps, Timestamp
//   2.x  pack.rs: pricing pack, status lifecycle, content hash
//   2.1x snapshot.rs: pack draft from positions + price/fx observations
//   2.2x store.rs: versioned pack store, supersede chain, build locks
//   3.x  gate.rs: freshness gate, degraded fallback to last known-good
//   4.x  reconcile.rs: pack vs ledger NAV within tolerance
//   5.x  attribution.rs: local / fx / interaction return decomposition
//   6.x  metrics.rs: TWR, MWR, volatility, sharpe, drawdown, history
//   7.x  rolling.rs: rolling-window aggregates with staleness health
//   8.x  engine/: spine service: builds, publish, analytics
//   9.x  providers.rs: feed traits + in-memory fixture feed
//   10.x context.rs: request context and clock
//   11.x events.rs: state transition events for audit
//   12.x config.rs: tolerances, schedules, env presets

// core valuation modules
pub mod pack;
pub mod snapshot;
pub mod store;
pub mod types;

// correctness gates
pub mod gate;
pub mod reconcile;

// analytics modules
pub mod attribution;
pub mod metrics;
pub mod rolling;

// integration modules
pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod providers;

// re exports for convenience
pub use attribution::*;
pub use engine::*;
pub use events::*;
pub use gate::*;
pub use metrics::*;
pub use pack::*;
pub use reconcile::*;
pub use rolling::*;
pub use snapshot::*;
pub use store::*;
pub use types::*;
pub use config::{ConfigError, EngineParams, Environment, SpineConfig};
pub use context::{Clock, ManualClock, RequestContext, SystemClock};
pub use providers::{
    CashflowSource, FeedError, Feeds, FixtureFeed, FxObservation, FxRateStore, LedgerSource, PositionSource,
    PriceObservation, PriceSource, RawPosition,
};
