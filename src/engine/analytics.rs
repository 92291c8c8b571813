//! Attribution, metrics and rolling aggregates on top of ready packs.

use super::core::Spine;
use super::results::SpineError;
use crate::attribution::PortfolioAttribution;
use crate::context::RequestContext;
use crate::events::{AggregateRefreshedEvent, AttributionComputedEvent, EventPayload, MetricsRecordedEvent};
use crate::gate::GateError;
use crate::metrics::{AppendOutcome, MetricsError, MetricsRecord};
use crate::providers::CashflowSource;
use crate::rolling::{AggregateRead, AggregateStatus, RefreshSummary, RollingWindow};
use crate::types::{PackId, PolicyId, PortfolioId};
use chrono::NaiveDate;
use tracing::{info, info_span};

impl Spine {
    /// Currency attribution for one portfolio between two ready packs.
    pub fn attribute(
        &self,
        ctx: &RequestContext,
        prior: PackId,
        current: PackId,
        portfolio_id: PortfolioId,
    ) -> Result<PortfolioAttribution, SpineError> {
        let _span = info_span!("attribute", request = %ctx.request_id, %prior, %current, portfolio = %portfolio_id).entered();
        let prior = self.pack(prior)?;
        let current = self.pack(current)?;
        let result = self.attribution.attribute_portfolio(&prior, &current, portfolio_id)?;

        self.emit_event(
            Some(ctx),
            EventPayload::AttributionComputed(AttributionComputedEvent {
                pack_id: result.pack_id,
                prior_pack_id: result.prior_pack_id,
                portfolio_id,
                total_return: result.total_return,
                validation_error_bps: result.validation_error_bps,
            }),
        );
        Ok(result)
    }

    /// Attribution from the previous ready pack to the freshness-gated latest one.
    pub fn attribute_latest(
        &self,
        ctx: &RequestContext,
        policy: &PolicyId,
        portfolio_id: PortfolioId,
    ) -> Result<PortfolioAttribution, SpineError> {
        let latest = self.get_latest(ctx, policy, true)?;
        let day_before = latest.pack.as_of.pred_opt().unwrap_or(NaiveDate::MIN);
        let prior = self
            .store
            .ready_chain(policy, NaiveDate::MIN, day_before)
            .pop()
            .ok_or_else(|| GateError::NoPack(policy.clone()))?;
        self.attribute(ctx, prior.id, latest.pack.id, portfolio_id)
    }

    /// Metrics over every ready pack in `[from, ctx.as_of]`, appended to the history.
    /// A pinned request must name a pack inside that chain.
    pub fn compute_metrics(
        &self,
        ctx: &RequestContext,
        policy: &PolicyId,
        portfolio_id: PortfolioId,
        from: NaiveDate,
        cashflows: &dyn CashflowSource,
    ) -> Result<MetricsRecord, SpineError> {
        let _span = info_span!("compute_metrics", request = %ctx.request_id, portfolio = %portfolio_id, %from, to = %ctx.as_of).entered();
        let mut chain = self.store.ready_chain(policy, from, ctx.as_of);
        if let Some(pinned) = ctx.pack_id {
            // pinned requests stop at the pack they were issued against
            let pos = chain
                .iter()
                .position(|p| p.id == pinned)
                .ok_or(MetricsError::PinnedPackOutsideChain {
                    pack_id: pinned,
                    from,
                    to: ctx.as_of,
                })?;
            chain.truncate(pos + 1);
        }
        let flows = cashflows.cashflows(portfolio_id, from, ctx.as_of)?;
        let record = self.metrics.compute(portfolio_id, &chain, &flows)?;
        let digest = record.digest()?;

        if self.history.append(record.clone())? == AppendOutcome::Appended {
            self.emit_event(
                Some(ctx),
                EventPayload::MetricsRecorded(MetricsRecordedEvent {
                    portfolio_id,
                    as_of: record.as_of,
                    pack_id: record.pack_id,
                    digest,
                }),
            );
        }
        Ok(record)
    }

    /// Refreshes one window now. `range` limits which as-of dates are recomputed; only a
    /// full refresh moves the window's last-refreshed time.
    pub fn refresh_aggregate(
        &self,
        ctx: &RequestContext,
        window: RollingWindow,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> RefreshSummary {
        let summary = self.aggregates.refresh(window, range, self.now());
        self.emit_event(
            Some(ctx),
            EventPayload::AggregateRefreshed(AggregateRefreshedEvent {
                window,
                rows_written: summary.rows_written,
            }),
        );
        summary
    }

    /// Scheduler tick: refreshes every window whose interval elapsed.
    pub fn run_due_aggregates(&self) -> Vec<RefreshSummary> {
        let summaries = self.aggregates.run_due(self.now());
        for summary in &summaries {
            self.emit_event(
                None,
                EventPayload::AggregateRefreshed(AggregateRefreshedEvent {
                    window: summary.window,
                    rows_written: summary.rows_written,
                }),
            );
        }
        if !summaries.is_empty() {
            info!(windows = summaries.len(), "scheduled aggregate refresh");
        }
        summaries
    }

    /// Aggregate read with fallback to direct computation when the view is degraded.
    pub fn aggregate(
        &self,
        window: RollingWindow,
        portfolio_id: PortfolioId,
        as_of: NaiveDate,
    ) -> Result<AggregateRead, SpineError> {
        Ok(self.aggregates.get_or_compute(window, portfolio_id, as_of, self.now())?)
    }

    pub fn aggregate_status(&self, window: RollingWindow) -> AggregateStatus {
        self.aggregates.status(window, self.now())
    }
}
