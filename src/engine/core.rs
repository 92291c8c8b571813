// 8.0 engine/core.rs: the spine service. owns the pack store, metrics history and
// aggregates; built once and shared by Arc. every method takes &self.

use super::results::SpineError;
use crate::attribution::CurrencyAttributionEngine;
use crate::config::SpineConfig;
use crate::context::{Clock, RequestContext};
use crate::events::{Event, EventCollector, EventEmitter, EventPayload};
use crate::gate::{FreshnessGate, LatestPack};
use crate::metrics::{MetricsEngine, MetricsHistory};
use crate::pack::PricingPack;
use crate::reconcile::ReconciliationEngine;
use crate::rolling::RollingAggregateStore;
use crate::store::{PackStore, StoreError};
use crate::types::{PackId, PolicyId, Timestamp};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info_span};

/** 8.1: spine struct. every long-lived piece of state hangs off this */
pub struct Spine {
    pub(super) config: SpineConfig,
    pub(super) store: Arc<PackStore>,
    pub(super) gate: FreshnessGate,
    pub(super) reconciler: ReconciliationEngine,
    pub(super) attribution: CurrencyAttributionEngine,
    pub(super) metrics: MetricsEngine,
    pub(super) history: Arc<MetricsHistory>,
    pub(super) aggregates: RollingAggregateStore,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) events: Mutex<EventCollector>,
}

impl fmt::Debug for Spine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spine")
            .field("packs", &self.store.len())
            .field("metrics_rows", &self.history.len())
            .finish()
    }
}

impl Spine {
    /// Validates the config and wires every component from it.
    pub fn new(config: SpineConfig, clock: Arc<dyn Clock>) -> Result<Self, SpineError> {
        config.validate()?;

        let store = Arc::new(PackStore::new());
        let history = Arc::new(MetricsHistory::new());
        let metrics = MetricsEngine::new(config.metrics.clone());

        Ok(Self {
            gate: FreshnessGate::new(Arc::clone(&store), config.gate.clone()),
            reconciler: ReconciliationEngine::new(config.reconciliation.clone()),
            attribution: CurrencyAttributionEngine::new(config.attribution.clone()),
            aggregates: RollingAggregateStore::new(Arc::clone(&history), metrics.clone(), config.rolling.clone()),
            events: Mutex::new(EventCollector::new(config.engine.max_events)),
            metrics,
            history,
            store,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &SpineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<PackStore> {
        &self.store
    }

    pub fn history(&self) -> &Arc<MetricsHistory> {
        &self.history
    }

    pub fn aggregates(&self) -> &RollingAggregateStore {
        &self.aggregates
    }

    pub fn pack(&self, id: PackId) -> Result<Arc<PricingPack>, SpineError> {
        self.store.get(id).ok_or(SpineError::Store(StoreError::PackNotFound(id)))
    }

    /// Freshness-gated read. See [`FreshnessGate::get_latest`].
    pub fn get_latest(&self, ctx: &RequestContext, policy: &PolicyId, require_fresh: bool) -> Result<LatestPack, SpineError> {
        let _span = info_span!("get_latest", request = %ctx.request_id, tenant = ctx.tenant.0, %policy).entered();
        Ok(self.gate.get_latest(policy, require_fresh)?)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).events().to_vec()
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).recent(count).to_vec()
    }

    pub(super) fn emit_event(&self, ctx: Option<&RequestContext>, payload: EventPayload) {
        let now = self.clock.now();
        let mut log = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let event = Event::new(log.next_id(), now, ctx.map(|c| c.request_id.clone()), payload);
        debug!(event = event.id.0, kind = event.payload.kind(), "event emitted");
        log.emit(event);
    }
}
