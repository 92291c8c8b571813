// 11.0: every state change produces an event. used for audit trails and for telling
// downstream consumers a pack moved. the EventPayload enum lists all event types.

use crate::pack::{ContentHash, PackStatus};
use crate::rolling::RollingWindow;
use crate::types::{Bps, PackId, PolicyId, PortfolioId, Timestamp};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    /// request that caused it, when there was one
    pub request_id: Option<String>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, request_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            request_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    // Pack lifecycle
    PackCreated(PackCreatedEvent),
    PackReused(PackReusedEvent),
    PackSuperseded(PackSupersededEvent),
    PackReady(PackStatusEvent),
    PackFailed(PackFailedEvent),

    // Reconciliation
    ReconciliationPassed(ReconciliationEvent),
    ReconciliationRejected(ReconciliationEvent),

    // Analytics
    AttributionComputed(AttributionComputedEvent),
    MetricsRecorded(MetricsRecordedEvent),
    AggregateRefreshed(AggregateRefreshedEvent),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::PackCreated(_) => "pack_created",
            EventPayload::PackReused(_) => "pack_reused",
            EventPayload::PackSuperseded(_) => "pack_superseded",
            EventPayload::PackReady(_) => "pack_ready",
            EventPayload::PackFailed(_) => "pack_failed",
            EventPayload::ReconciliationPassed(_) => "reconciliation_passed",
            EventPayload::ReconciliationRejected(_) => "reconciliation_rejected",
            EventPayload::AttributionComputed(_) => "attribution_computed",
            EventPayload::MetricsRecorded(_) => "metrics_recorded",
            EventPayload::AggregateRefreshed(_) => "aggregate_refreshed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackCreatedEvent {
    pub pack_id: PackId,
    pub as_of: NaiveDate,
    pub policy: PolicyId,
    pub content_hash: ContentHash,
    pub positions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackReusedEvent {
    pub pack_id: PackId,
    pub status: PackStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackSupersededEvent {
    pub old_pack: PackId,
    pub new_pack: PackId,
    pub as_of: NaiveDate,
    pub policy: PolicyId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackStatusEvent {
    pub pack_id: PackId,
    pub ledger_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackFailedEvent {
    pub pack_id: PackId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationEvent {
    pub pack_id: PackId,
    pub ledger_commit: String,
    pub error_bps: Bps,
    pub tolerance_bps: Bps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionComputedEvent {
    pub pack_id: PackId,
    pub prior_pack_id: PackId,
    pub portfolio_id: PortfolioId,
    pub total_return: Decimal,
    pub validation_error_bps: Bps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecordedEvent {
    pub portfolio_id: PortfolioId,
    pub as_of: NaiveDate,
    pub pack_id: PackId,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRefreshedEvent {
    pub window: RollingWindow,
    pub rows_written: usize,
}

pub trait EventEmitter {
    fn emit(&mut self, event: Event);
}

/// Bounded in-memory event log. Oldest events are dropped past `max_events`.
#[derive(Debug)]
pub struct EventCollector {
    events: Vec<Event>,
    next_id: u64,
    max_events: usize,
}

impl EventCollector {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            max_events,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn recent(&self, count: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(count);
        &self.events[start..]
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn next_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl EventEmitter for EventCollector {
    fn emit(&mut self, event: Event) {
        self.events.push(event);
        if self.events.len() > self.max_events {
            let drain_count = self.events.len() - self.max_events;
            self.events.drain(0..drain_count);
        }
    }
}
