//! Pack lifecycle tests
//!
//! Drive the spine end to end through fixture feeds: build, reconcile, supersede,
//! freshness-gated reads, attribution and metrics.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spine_core::*;
use std::sync::Arc;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn usd() -> Currency {
    Currency::new("USD").unwrap()
}

fn cad() -> Currency {
    Currency::new("CAD").unwrap()
}

fn usd_policy() -> ValuationPolicy {
    ValuationPolicy::new(PolicyId::new("EOD-USD"), usd())
}

fn cad_policy() -> ValuationPolicy {
    ValuationPolicy::new(PolicyId::new("WM4PM-CAD"), cad())
}

fn spine() -> (Spine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
    let spine = Spine::new(SpineConfig::default(), clock.clone()).unwrap();
    (spine, clock)
}

fn ctx(as_of: NaiveDate) -> RequestContext {
    RequestContext::new(as_of, TenantId(7), format!("req-{as_of}"))
}

// 100 shares of AAPL in pf-1 at `price` USD
fn usd_day(feed: &mut FixtureFeed, as_of: NaiveDate, price: Decimal) {
    feed.add_position(
        as_of,
        RawPosition {
            portfolio_id: PortfolioId(1),
            symbol: "AAPL".to_string(),
            currency: usd(),
            quantity: dec!(100),
        },
    );
    feed.add_price("AAPL", usd(), as_of, Price::new_unchecked(price));
}

fn ledger(as_of: NaiveDate, value: Decimal) -> LedgerValuation {
    LedgerValuation::new(as_of, format!("commit-{as_of}")).with_position(PortfolioId(1), "AAPL", Amount::new(value))
}

fn run(spine: &Spine, feed: &FixtureFeed, as_of: NaiveDate) -> Result<DailyJobReport, SpineError> {
    spine.run_daily_job(&ctx(as_of), &usd_policy(), Feeds::from_source(feed), feed)
}

fn kinds(spine: &Spine) -> Vec<&'static str> {
    spine.events().iter().map(|e| e.payload.kind()).collect()
}

mod publish_tests {
    use super::*;

    #[test_log::test]
    fn daily_job_publishes_reconciled_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));

        let report = run(&spine, &feed, d(4)).unwrap();

        assert_eq!(report.pack.status, PackStatus::Ready);
        assert!(report.commit.is_new());
        let recon = report.reconciliation.unwrap();
        assert!(recon.accepted);
        assert_eq!(recon.error_bps, Bps::new(Decimal::ZERO));

        let pack = spine.pack(report.pack.id).unwrap();
        assert!(pack.is_fresh);
        assert_eq!(pack.ledger_commit.as_deref(), Some("commit-2024-03-04"));
        assert_eq!(kinds(&spine), vec!["pack_created", "reconciliation_passed", "pack_ready"]);
        assert!(spine.events().iter().all(|e| e.request_id.as_deref() == Some("req-2024-03-04")));
    }

    #[test]
    fn rerun_with_identical_inputs_reuses_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));

        let first = run(&spine, &feed, d(4)).unwrap();
        let second = run(&spine, &feed, d(4)).unwrap();

        assert_eq!(second.commit, CommitOutcome::Reused(first.pack.id));
        assert!(second.reconciliation.is_none());
        assert_eq!(spine.store().len(), 1);
    }

    #[test]
    fn exactly_one_bp_is_accepted() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        // pack nav 10001 vs ledger 10000
        usd_day(&mut feed, d(4), dec!(100.01));
        feed.add_ledger(ledger(d(4), dec!(10000)));

        let report = run(&spine, &feed, d(4)).unwrap();
        let recon = report.reconciliation.unwrap();
        assert_eq!(recon.error_bps, Bps::new(dec!(1)));
        assert_eq!(report.pack.status, PackStatus::Ready);
    }

    #[test_log::test]
    fn one_and_a_half_bp_fails_the_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100.015));
        feed.add_ledger(ledger(d(4), dec!(10000)));

        let err = run(&spine, &feed, d(4)).unwrap_err();
        match &err {
            SpineError::Reconcile(ReconcileError::Failed(failed)) => {
                assert_eq!(failed.report.error_bps, Bps::new(dec!(1.5)));
                assert_eq!(failed.report.ledger_commit, "commit-2024-03-04");
            }
            other => panic!("expected reconciliation failure, got {other:?}"),
        }
        assert!(!err.is_retryable());

        let pack = spine.store().latest(&usd_policy().id).unwrap();
        assert_eq!(pack.status, PackStatus::Error);
        assert_eq!(pack.reconciliation_error, Some(dec!(0.00015)));
        assert!(!pack.is_fresh);
        assert_eq!(kinds(&spine), vec!["pack_created", "reconciliation_rejected", "pack_failed"]);
    }

    #[test]
    fn ledger_outage_leaves_no_warming_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));
        feed.set_unavailable(Some("ledger"));

        let err = run(&spine, &feed, d(4)).unwrap_err();
        assert!(err.is_retryable());

        let pack = spine.store().latest(&usd_policy().id).unwrap();
        assert_eq!(pack.status, PackStatus::Error);
        assert!(!spine.store().locks().is_held(d(4), &usd_policy().id));

        // the next attempt builds a fresh pack over the failed one
        feed.set_unavailable(None);
        let report = run(&spine, &feed, d(4)).unwrap();
        assert_eq!(report.commit, CommitOutcome::Superseded { new: report.pack.id, old: pack.id });
        assert_eq!(report.pack.status, PackStatus::Ready);
    }

    #[test]
    fn incomplete_inputs_never_commit() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_position(
            d(4),
            RawPosition {
                portfolio_id: PortfolioId(1),
                symbol: "MSFT".to_string(),
                currency: usd(),
                quantity: dec!(5),
            },
        );

        let err = run(&spine, &feed, d(4)).unwrap_err();
        assert!(matches!(err, SpineError::Snapshot(SnapshotError::DataIncomplete { .. })));
        assert!(spine.store().is_empty());
    }

    #[test]
    fn publish_requires_warming_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));
        let report = run(&spine, &feed, d(4)).unwrap();

        let err = spine.publish_pack(&ctx(d(4)), report.pack.id, &ledger(d(4), dec!(10000))).unwrap_err();
        assert!(matches!(
            err,
            SpineError::Store(StoreError::InvalidTransition { from: PackStatus::Ready, .. })
        ));
    }
}

mod supersede_tests {
    use super::*;

    #[test]
    fn correction_supersedes_without_touching_original() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));
        let original = run(&spine, &feed, d(4)).unwrap();
        let original_pack = spine.pack(original.pack.id).unwrap();

        let mut inputs = SnapshotInputs::collect(d(4), 0, &feed, &feed, &feed).unwrap();
        inputs.prices[0].price = Price::new_unchecked(dec!(100.005));
        let built = spine.build_pack(&ctx(d(4)), &usd_policy(), &inputs).unwrap();
        assert_eq!(
            built.commit,
            CommitOutcome::Superseded {
                new: built.pack.id,
                old: original.pack.id
            }
        );
        assert_eq!(built.pack.supersedes, Some(original.pack.id));
        assert_eq!(built.pack.status, PackStatus::Warming);

        let old = spine.pack(original.pack.id).unwrap();
        assert_eq!(old.status, PackStatus::Ready);
        assert_eq!(old.content_hash, original_pack.content_hash);
        assert_eq!(old.positions, original_pack.positions);
        assert_eq!(old.superseded_by, Some(built.pack.id));
        assert!(!old.is_fresh);
        assert!(old.verify_content_hash());

        spine
            .publish_pack(&ctx(d(4)), built.pack.id, &ledger(d(4), dec!(10000.5)))
            .unwrap();
        assert_eq!(spine.store().lineage(built.pack.id).unwrap(), vec![built.pack.id, original.pack.id]);
        assert_eq!(spine.store().versions(d(4), &usd_policy().id).len(), 2);
        assert!(kinds(&spine).contains(&"pack_superseded"));
    }

    #[test]
    fn input_order_does_not_change_the_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_position(
            d(4),
            RawPosition {
                portfolio_id: PortfolioId(2),
                symbol: "MSFT".to_string(),
                currency: usd(),
                quantity: dec!(5),
            },
        );
        feed.add_price("MSFT", usd(), d(4), Price::new_unchecked(dec!(400)));

        let inputs = SnapshotInputs::collect(d(4), 0, &feed, &feed, &feed).unwrap();
        let mut shuffled = inputs.clone();
        shuffled.positions.reverse();
        shuffled.prices.reverse();

        let first = spine.build_pack(&ctx(d(4)), &usd_policy(), &inputs).unwrap();
        let second = spine.build_pack(&ctx(d(4)), &usd_policy(), &shuffled).unwrap();
        assert_eq!(second.commit, CommitOutcome::Reused(first.pack.id));
    }
}

mod gate_tests {
    use super::*;

    #[test]
    fn warming_pack_is_never_served_fresh() {
        let (spine, clock) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        let inputs = SnapshotInputs::collect(d(4), 0, &feed, &feed, &feed).unwrap();
        let built = spine.build_pack(&ctx(d(4)), &usd_policy(), &inputs).unwrap();

        clock.advance(5 * MINUTE_MS);
        let err = spine.get_latest(&ctx(d(4)), &usd_policy().id, true).unwrap_err();
        match err {
            SpineError::Gate(GateError::PackWarming {
                pack_id,
                estimated_ready_at,
                ..
            }) => {
                assert_eq!(pack_id, built.pack.id);
                assert_eq!(estimated_ready_at, built.pack.created_at.plus_millis(15 * MINUTE_MS));
            }
            other => panic!("expected warming rejection, got {other:?}"),
        }

        let best_effort = spine.get_latest(&ctx(d(4)), &usd_policy().id, false).unwrap();
        assert_eq!(best_effort.pack.id, built.pack.id);
        assert_eq!(
            best_effort.staleness,
            Staleness::BestEffort {
                status: PackStatus::Warming
            }
        );
    }

    #[test_log::test]
    fn failed_day_degrades_to_last_known_good() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));
        usd_day(&mut feed, d(5), dec!(102));
        feed.add_ledger(ledger(d(5), dec!(10100)));

        let good = run(&spine, &feed, d(4)).unwrap();
        let failed = run(&spine, &feed, d(5)).unwrap_err();
        assert!(matches!(failed, SpineError::Reconcile(_)));

        let latest = spine.get_latest(&ctx(d(5)), &usd_policy().id, true).unwrap();
        assert_eq!(latest.pack.id, good.pack.id);
        assert!(latest.is_degraded());
        let failed_id = spine.store().latest(&usd_policy().id).unwrap().id;
        assert_eq!(latest.staleness, Staleness::Degraded { failed_pack: failed_id });
    }

    #[test]
    fn first_pack_failing_leaves_nothing_to_serve() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(9000)));
        run(&spine, &feed, d(4)).unwrap_err();

        let err = spine.get_latest(&ctx(d(4)), &usd_policy().id, true).unwrap_err();
        assert!(matches!(err, SpineError::Gate(GateError::NoReadyPack { .. })));

        let err = spine.get_latest(&ctx(d(4)), &PolicyId::new("OTHER"), true).unwrap_err();
        assert!(matches!(err, SpineError::Gate(GateError::NoPack(_))));
    }
}

mod lock_tests {
    use super::*;

    #[test]
    fn concurrent_build_for_same_key_is_refused() {
        let (spine, clock) = spine();
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, d(4), dec!(100));
        feed.add_ledger(ledger(d(4), dec!(10000)));

        let lease = spine.store().locks().try_acquire(d(4), &usd_policy().id, clock.now()).unwrap();

        std::thread::scope(|s| {
            let blocked = s.spawn(|| run(&spine, &feed, d(4)));
            let err = blocked.join().unwrap().unwrap_err();
            assert!(matches!(err, SpineError::Store(StoreError::BuildInProgress { .. })));
            assert!(err.is_retryable());

            // a different date is not blocked
            usd_day_separate(&spine, d(5));
        });
        assert!(spine.store().versions(d(4), &usd_policy().id).is_empty());

        drop(lease);
        assert!(run(&spine, &feed, d(4)).is_ok());
    }

    fn usd_day_separate(spine: &Spine, as_of: NaiveDate) {
        let mut feed = FixtureFeed::new();
        usd_day(&mut feed, as_of, dec!(100));
        feed.add_ledger(ledger(as_of, dec!(10000)));
        assert!(run(spine, &feed, as_of).is_ok());
    }

    #[test]
    fn lock_released_after_failed_build() {
        let (spine, _) = spine();
        let feed = FixtureFeed::new();

        assert!(run(&spine, &feed, d(4)).is_err());
        assert!(!spine.store().locks().is_held(d(4), &usd_policy().id));
    }
}

mod analytics_tests {
    use super::*;

    // 10 AAPL held in a CAD portfolio
    fn cad_day(feed: &mut FixtureFeed, as_of: NaiveDate, price: Decimal, usdcad: Decimal) {
        feed.add_position(
            as_of,
            RawPosition {
                portfolio_id: PortfolioId(1),
                symbol: "AAPL".to_string(),
                currency: usd(),
                quantity: dec!(10),
            },
        );
        feed.add_price("AAPL", usd(), as_of, Price::new_unchecked(price));
        feed.add_fx(usd(), cad(), as_of, FxRate::new_unchecked(usdcad));
        feed.add_ledger(ledger(as_of, dec!(10) * price * usdcad));
    }

    fn run_cad(spine: &Spine, feed: &FixtureFeed, as_of: NaiveDate) -> DailyJobReport {
        spine
            .run_daily_job(&ctx(as_of), &cad_policy(), Feeds::from_source(feed), feed)
            .unwrap()
    }

    #[test_log::test]
    fn usd_stock_in_cad_portfolio_attribution() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        cad_day(&mut feed, d(4), dec!(100), dec!(1.30));
        cad_day(&mut feed, d(5), dec!(105), dec!(1.32));
        let prior = run_cad(&spine, &feed, d(4));
        let current = run_cad(&spine, &feed, d(5));

        let attribution = spine
            .attribute(&ctx(d(5)), prior.pack.id, current.pack.id, PortfolioId(1))
            .unwrap();

        assert_eq!(attribution.local_return, dec!(0.05));
        assert!((attribution.fx_return - dec!(0.0153846153846)).abs() < dec!(0.0000000001));
        assert!((attribution.interaction_return - dec!(0.000769230769)).abs() < dec!(0.0000000001));
        assert!((attribution.total_return - dec!(0.0661538461538)).abs() < dec!(0.0000000001));
        assert!(attribution.validation_error_bps <= Bps::new(dec!(0.1)));
        assert!(attribution.unmatched.is_empty());
        assert!(kinds(&spine).contains(&"attribution_computed"));

        let latest = spine.attribute_latest(&ctx(d(5)), &cad_policy().id, PortfolioId(1)).unwrap();
        assert_eq!(latest, attribution);
    }

    #[test]
    fn attribution_refuses_failed_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        cad_day(&mut feed, d(4), dec!(100), dec!(1.30));
        cad_day(&mut feed, d(5), dec!(105), dec!(1.32));
        feed.add_ledger(ledger(d(5), dec!(1)));
        let prior = run_cad(&spine, &feed, d(4));
        spine
            .run_daily_job(&ctx(d(5)), &cad_policy(), Feeds::from_source(&feed), &feed)
            .unwrap_err();
        let failed = spine.store().latest(&cad_policy().id).unwrap();

        let err = spine
            .attribute(&ctx(d(5)), prior.pack.id, failed.id, PortfolioId(1))
            .unwrap_err();
        assert!(matches!(err, SpineError::Attribution(AttributionError::PackNotReady { .. })));
    }

    #[test]
    fn metrics_are_recorded_once_per_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        for (day, price) in [(4, dec!(100)), (5, dec!(100.4)), (6, dec!(99.9)), (7, dec!(100.5))] {
            usd_day(&mut feed, d(day), price);
            feed.add_ledger(ledger(d(day), dec!(100) * price));
            run(&spine, &feed, d(day)).unwrap();
        }

        let first = spine
            .compute_metrics(&ctx(d(7)), &usd_policy().id, PortfolioId(1), d(4), &feed)
            .unwrap();
        let again = spine
            .compute_metrics(&ctx(d(7)), &usd_policy().id, PortfolioId(1), d(4), &feed)
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(first.observations, 3);
        assert_eq!(first.twr, dec!(0.005));
        assert_eq!(first.drawdown.peak_date, Some(d(5)));
        assert_eq!(first.drawdown.trough_date, Some(d(6)));
        assert_eq!(first.drawdown.recovery_date, Some(d(7)));
        assert_eq!(first.digest().unwrap(), again.digest().unwrap());

        assert_eq!(spine.history().len(), 1);
        let recorded = kinds(&spine).iter().filter(|k| **k == "metrics_recorded").count();
        assert_eq!(recorded, 1);
        assert_eq!(spine.history().get(PortfolioId(1), d(7)).unwrap().pack_id, first.pack_id);
    }

    #[test]
    fn shorter_window_over_the_same_pack_is_recorded_separately() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        for (day, price) in [(4, dec!(100)), (5, dec!(100.4)), (6, dec!(99.9))] {
            usd_day(&mut feed, d(day), price);
            feed.add_ledger(ledger(d(day), dec!(100) * price));
            run(&spine, &feed, d(day)).unwrap();
        }

        let inception = spine
            .compute_metrics(&ctx(d(6)), &usd_policy().id, PortfolioId(1), d(4), &feed)
            .unwrap();
        let recent = spine
            .compute_metrics(&ctx(d(6)), &usd_policy().id, PortfolioId(1), d(5), &feed)
            .unwrap();

        assert_eq!(inception.pack_id, recent.pack_id);
        assert_eq!(inception.chain_start, d(4));
        assert_eq!(recent.chain_start, d(5));
        assert_ne!(inception.twr, recent.twr);
        assert_eq!(spine.history().len(), 2);
        assert_eq!(*spine.history().get(PortfolioId(1), d(6)).unwrap(), inception);
    }

    #[test]
    fn pinned_metrics_refuse_a_superseded_pack() {
        let (spine, _) = spine();
        let mut feed = FixtureFeed::new();
        for (day, price) in [(4, dec!(100)), (5, dec!(100.4))] {
            usd_day(&mut feed, d(day), price);
            feed.add_ledger(ledger(d(day), dec!(100) * price));
            run(&spine, &feed, d(day)).unwrap();
        }
        let original = spine.get_latest(&ctx(d(5)), &usd_policy().id, true).unwrap().pack;

        let mut inputs = SnapshotInputs::collect(d(5), 0, &feed, &feed, &feed).unwrap();
        inputs.prices[0].price = Price::new_unchecked(dec!(100.401));
        let corrected = spine.build_pack(&ctx(d(5)), &usd_policy(), &inputs).unwrap();
        spine
            .publish_pack(&ctx(d(5)), corrected.pack.id, &ledger(d(5), dec!(10040.1)))
            .unwrap();

        let pinned = ctx(d(5)).with_pack(original.id);
        let err = spine
            .compute_metrics(&pinned, &usd_policy().id, PortfolioId(1), d(4), &feed)
            .unwrap_err();
        assert!(matches!(
            err,
            SpineError::Metrics(MetricsError::PinnedPackOutsideChain { pack_id, .. }) if pack_id == original.id
        ));
        assert!(spine.history().is_empty());

        let record = spine
            .compute_metrics(&ctx(d(5)).with_pack(corrected.pack.id), &usd_policy().id, PortfolioId(1), d(4), &feed)
            .unwrap();
        assert_eq!(record.pack_id, corrected.pack.id);
    }

    #[test]
    fn metrics_need_a_ready_chain() {
        let (spine, _) = spine();
        let feed = FixtureFeed::new();
        let err = spine
            .compute_metrics(&ctx(d(7)), &usd_policy().id, PortfolioId(1), d(4), &feed)
            .unwrap_err();
        assert!(matches!(err, SpineError::Metrics(MetricsError::EmptyChain(_))));
    }

    #[test]
    fn rolling_aggregates_follow_the_scheduler() {
        let (spine, clock) = spine();
        let mut feed = FixtureFeed::new();
        for (day, price) in [(4, dec!(100)), (5, dec!(100.2)), (6, dec!(100.3))] {
            usd_day(&mut feed, d(day), price);
            feed.add_ledger(ledger(d(day), dec!(100) * price));
            run(&spine, &feed, d(day)).unwrap();
            spine
                .compute_metrics(&ctx(d(day)), &usd_policy().id, PortfolioId(1), d(4), &feed)
                .unwrap();
        }

        assert_eq!(spine.aggregate_status(RollingWindow::D30).health, AggregateHealth::Degraded);
        let refreshed = spine.run_due_aggregates();
        assert_eq!(refreshed.len(), RollingWindow::ALL.len());
        assert!(spine.run_due_aggregates().is_empty());

        let read = spine.aggregate(RollingWindow::D30, PortfolioId(1), d(6)).unwrap();
        assert_eq!(read.source, ReadSource::Materialized);
        assert_eq!(read.aggregate.observations, 3);

        // 30d view refreshes hourly; 4x interval is degraded
        clock.advance(2 * HOUR_MS);
        assert_eq!(spine.aggregate_status(RollingWindow::D30).health, AggregateHealth::Warning);
        clock.advance(2 * HOUR_MS);
        assert_eq!(spine.aggregate_status(RollingWindow::D30).health, AggregateHealth::Degraded);

        let fallback = spine.aggregate(RollingWindow::D30, PortfolioId(1), d(6)).unwrap();
        assert_eq!(fallback.source, ReadSource::Computed);
        assert_eq!(fallback.aggregate.cumulative_return, read.aggregate.cumulative_return);
    }
}
