// 8.0.2: result types and errors for spine operations.

use crate::attribution::AttributionError;
use crate::config::ConfigError;
use crate::gate::GateError;
use crate::metrics::MetricsError;
use crate::pack::{PackRef, PricingPack};
use crate::providers::FeedError;
use crate::reconcile::{ReconcileError, ReconciliationReport};
use crate::rolling::AggregateError;
use crate::snapshot::SnapshotError;
use crate::store::{CommitOutcome, StoreError};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub pack: Arc<PricingPack>,
    pub commit: CommitOutcome,
}

#[derive(Debug, Clone)]
pub struct DailyJobReport {
    pub pack: PackRef,
    pub commit: CommitOutcome,
    /// None when an identical ready pack was reused and nothing was reconciled
    pub reconciliation: Option<ReconciliationReport>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SpineError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Attribution error: {0}")]
    Attribution(#[from] AttributionError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SpineError {
    /// Worth trying again later. Correctness violations never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            SpineError::Gate(GateError::PackWarming { .. }) => true,
            SpineError::Store(StoreError::BuildInProgress { .. }) => true,
            SpineError::Feed(e) => e.is_retryable(),
            _ => false,
        }
    }
}
