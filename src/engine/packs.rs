//! Pack build, publish and the daily job.

use super::core::Spine;
use super::results::{BuildOutcome, DailyJobReport, SpineError};
use crate::context::RequestContext;
use crate::events::{
    EventPayload, PackCreatedEvent, PackFailedEvent, PackReusedEvent, PackStatusEvent, PackSupersededEvent,
    ReconciliationEvent,
};
use crate::pack::{PackStatus, ValuationPolicy};
use crate::providers::{Feeds, LedgerSource};
use crate::reconcile::{LedgerValuation, ReconcileError, ReconciliationReport};
use crate::snapshot::{SnapshotBuilder, SnapshotInputs};
use crate::store::{CommitOutcome, StoreError, WarmingGuard};
use crate::types::PackId;
use tracing::{info, info_span, warn};

impl Spine {
    /// Builds and commits a pack under the (date, policy) build lock.
    /// The pack comes back Warming unless identical content was already committed.
    pub fn build_pack(
        &self,
        ctx: &RequestContext,
        policy: &ValuationPolicy,
        inputs: &SnapshotInputs,
    ) -> Result<BuildOutcome, SpineError> {
        let as_of = inputs.as_of.unwrap_or(ctx.as_of);
        let _span = info_span!("build_pack", request = %ctx.request_id, %as_of, policy = %policy.id).entered();
        let _lease = self.store.locks().try_acquire(as_of, &policy.id, self.now())?;
        self.build_locked(ctx, policy, inputs)
    }

    // caller holds the build lock
    fn build_locked(
        &self,
        ctx: &RequestContext,
        policy: &ValuationPolicy,
        inputs: &SnapshotInputs,
    ) -> Result<BuildOutcome, SpineError> {
        let builder = SnapshotBuilder::new(policy.clone(), self.config.snapshot.clone());
        let draft = builder.build(inputs)?;
        let positions = draft.positions.len();
        let commit = self.store.commit_draft(draft, self.now())?;
        let pack = self.pack(commit.pack_id())?;

        match commit {
            CommitOutcome::Reused(id) => {
                self.emit_event(
                    Some(ctx),
                    EventPayload::PackReused(PackReusedEvent {
                        pack_id: id,
                        status: pack.status,
                    }),
                );
            }
            CommitOutcome::Created(_) | CommitOutcome::Superseded { .. } => {
                self.emit_event(
                    Some(ctx),
                    EventPayload::PackCreated(PackCreatedEvent {
                        pack_id: pack.id,
                        as_of: pack.as_of,
                        policy: pack.policy.clone(),
                        content_hash: pack.content_hash.clone(),
                        positions,
                    }),
                );
                if let CommitOutcome::Superseded { new, old } = commit {
                    self.emit_event(
                        Some(ctx),
                        EventPayload::PackSuperseded(PackSupersededEvent {
                            old_pack: old,
                            new_pack: new,
                            as_of: pack.as_of,
                            policy: pack.policy.clone(),
                        }),
                    );
                }
            }
        }

        Ok(BuildOutcome { pack, commit })
    }

    /// Reconciles a Warming pack against the ledger and moves it to Ready or Error.
    pub fn publish_pack(
        &self,
        ctx: &RequestContext,
        pack_id: PackId,
        ledger: &LedgerValuation,
    ) -> Result<ReconciliationReport, SpineError> {
        let _span = info_span!("publish_pack", request = %ctx.request_id, pack = %pack_id).entered();
        let pack = self.pack(pack_id)?;
        if pack.status != PackStatus::Warming {
            return Err(StoreError::InvalidTransition {
                id: pack_id,
                from: pack.status,
                to: PackStatus::Ready,
            }
            .into());
        }

        match self.reconciler.reconcile(&pack, ledger) {
            Ok(report) => {
                self.store
                    .mark_ready(pack_id, Some(report.error_fraction), Some(report.ledger_commit.clone()))?;
                self.emit_event(
                    Some(ctx),
                    EventPayload::ReconciliationPassed(ReconciliationEvent {
                        pack_id,
                        ledger_commit: report.ledger_commit.clone(),
                        error_bps: report.error_bps,
                        tolerance_bps: report.tolerance_bps,
                    }),
                );
                self.emit_event(
                    Some(ctx),
                    EventPayload::PackReady(PackStatusEvent {
                        pack_id,
                        ledger_commit: Some(report.ledger_commit.clone()),
                    }),
                );
                info!(pack = %pack_id, error_bps = %report.error_bps, "pack published");
                Ok(report)
            }
            Err(err) => {
                self.store.mark_error(pack_id, err.error_fraction())?;
                if let ReconcileError::Failed(failed) = &err {
                    self.emit_event(
                        Some(ctx),
                        EventPayload::ReconciliationRejected(ReconciliationEvent {
                            pack_id,
                            ledger_commit: failed.report.ledger_commit.clone(),
                            error_bps: failed.report.error_bps,
                            tolerance_bps: failed.report.tolerance_bps,
                        }),
                    );
                }
                self.fail_pack(ctx, pack_id, &err.to_string());
                Err(err.into())
            }
        }
    }

    /// Full pipeline for one date: collect inputs, build under the lock, reconcile, publish.
    ///
    /// Holds the build lock for the whole run. A pack left Warming by any early return is
    /// marked Error before the lock is released.
    pub fn run_daily_job(
        &self,
        ctx: &RequestContext,
        policy: &ValuationPolicy,
        feeds: Feeds<'_>,
        ledger: &dyn LedgerSource,
    ) -> Result<DailyJobReport, SpineError> {
        let _span = info_span!("daily_job", request = %ctx.request_id, tenant = ctx.tenant.0, as_of = %ctx.as_of, policy = %policy.id).entered();
        let _lease = self.store.locks().try_acquire(ctx.as_of, &policy.id, self.now())?;

        let inputs = SnapshotInputs::collect(
            ctx.as_of,
            self.config.snapshot.feed_lookback_days(),
            feeds.positions,
            feeds.prices,
            feeds.fx,
        )?;
        let BuildOutcome { pack, commit } = self.build_locked(ctx, policy, &inputs)?;

        if pack.status == PackStatus::Ready {
            info!(pack = %pack.id, "identical ready pack exists, nothing to publish");
            return Ok(DailyJobReport {
                pack: pack.reference(),
                commit,
                reconciliation: None,
            });
        }

        let guard = WarmingGuard::new(&self.store, pack.id);
        let valuation = match ledger.valuation(ctx.as_of) {
            Ok(v) => v,
            Err(err) => {
                warn!(pack = %pack.id, error = %err, "ledger unavailable, failing pack");
                self.store.mark_error(pack.id, None)?;
                self.fail_pack(ctx, pack.id, &err.to_string());
                return Err(err.into());
            }
        };

        let report = self.publish_pack(ctx, guard.pack_id(), &valuation)?;
        guard.disarm();

        Ok(DailyJobReport {
            pack: self.pack(pack.id)?.reference(),
            commit,
            reconciliation: Some(report),
        })
    }

    fn fail_pack(&self, ctx: &RequestContext, pack_id: PackId, reason: &str) {
        self.emit_event(
            Some(ctx),
            EventPayload::PackFailed(PackFailedEvent {
                pack_id,
                reason: reason.to_string(),
            }),
        );
    }
}
