//! Pricing pack spine simulation.
//!
//! Walks the daily lifecycle end to end: pack build, ledger reconciliation, supersede on a
//! late correction, freshness-gated reads, currency attribution, metrics and rolling
//! aggregate health.
//!
//! `RUST_LOG` overrides the log filter; `-v` switches the default to debug.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spine_core::*;
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

type SimResult<T = ()> = Result<T, Box<dyn Error>>;

const HOUR_MS: i64 = 60 * 60 * 1000;

fn main() -> SimResult {
    let verbose = std::env::args().any(|a| a == "-v" || a == "--verbose");
    init_tracing(verbose);

    println!("Pricing Pack Spine Simulation");
    println!("One CAD policy, USD and CAD holdings, full daily lifecycle\n");

    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_704_186_000_000)));
    let spine = Spine::new(Environment::Development.config(), clock.clone())?;
    let mut world = World::new()?;

    scenario_1_build_and_reconcile(&spine, &mut world)?;
    scenario_2_late_correction(&spine, &mut world)?;
    scenario_3_freshness_gate(&spine, &mut world, &clock)?;
    scenario_4_currency_attribution(&spine, &world)?;
    scenario_5_metrics(&spine, &mut world)?;
    scenario_6_rolling_health(&spine, &clock)?;

    println!("\n{} events recorded", spine.events().len());
    println!("All simulations completed successfully.");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "spine_core=debug" } else { "spine_core=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Fixture feed plus the policy every scenario builds against.
struct World {
    feed: FixtureFeed,
    policy: ValuationPolicy,
    usd: Currency,
    cad: Currency,
}

impl World {
    fn new() -> SimResult<Self> {
        let usd = Currency::new("USD").ok_or("bad currency")?;
        let cad = Currency::new("CAD").ok_or("bad currency")?;
        Ok(Self {
            feed: FixtureFeed::new(),
            policy: ValuationPolicy::new(PolicyId::new("WM4PM-CAD"), cad.clone()),
            usd,
            cad,
        })
    }

    // pf-1 holds 10 AAPL (USD) and `shop_qty` SHOP (CAD). ledger is off by `ledger_skew` fraction.
    fn market_day(&mut self, as_of: NaiveDate, quote: Quote, shop_qty: Decimal, ledger_skew: Decimal) {
        let pf = PortfolioId(1);
        let Quote { aapl, shop, usdcad } = quote;
        for (symbol, ccy, qty) in [("AAPL", &self.usd, dec!(10)), ("SHOP", &self.cad, shop_qty)] {
            self.feed.add_position(
                as_of,
                RawPosition {
                    portfolio_id: pf,
                    symbol: symbol.to_string(),
                    currency: ccy.clone(),
                    quantity: qty,
                },
            );
        }
        self.feed.add_price("AAPL", self.usd.clone(), as_of, Price::new_unchecked(aapl));
        self.feed.add_price("SHOP", self.cad.clone(), as_of, Price::new_unchecked(shop));
        self.feed.add_fx(self.usd.clone(), self.cad.clone(), as_of, FxRate::new_unchecked(usdcad));

        let factor = Decimal::ONE / (Decimal::ONE + ledger_skew);
        let ledger = LedgerValuation::new(as_of, format!("ledger-{as_of}"))
            .with_position(pf, "AAPL", Amount::new(dec!(10) * aapl * usdcad * factor))
            .with_position(pf, "SHOP", Amount::new(shop_qty * shop * factor));
        self.feed.add_ledger(ledger);
    }
}

#[derive(Clone, Copy)]
struct Quote {
    aapl: Decimal,
    shop: Decimal,
    usdcad: Decimal,
}

fn quote(aapl: Decimal, shop: Decimal, usdcad: Decimal) -> Quote {
    Quote { aapl, shop, usdcad }
}

fn day(d: u32) -> SimResult<NaiveDate> {
    Ok(NaiveDate::from_ymd_opt(2024, 1, d).ok_or("invalid date")?)
}

fn ctx(as_of: NaiveDate, request: &str) -> RequestContext {
    RequestContext::new(as_of, TenantId(1), request)
}

/// Daily job: build, reconcile, publish.
fn scenario_1_build_and_reconcile(spine: &Spine, world: &mut World) -> SimResult {
    println!("Scenario 1: Build and Reconcile\n");

    world.market_day(day(2)?, quote(dec!(100), dec!(80), dec!(1.30)), dec!(20), Decimal::ZERO);
    let report = spine.run_daily_job(&ctx(day(2)?, "job-0102"), &world.policy, Feeds::from_source(&world.feed), &world.feed)?;

    println!("  Pack {} for {} -> {}", report.pack.id, report.pack.as_of, report.pack.status);
    println!("  Content hash {}", report.pack.content_hash);
    if let Some(recon) = &report.reconciliation {
        println!("  Pack NAV {} vs ledger NAV {}: {} (tolerance {})", recon.pack_nav, recon.ledger_nav, recon.error_bps, recon.tolerance_bps);
    }

    let again = spine.run_daily_job(&ctx(day(2)?, "job-0102-retry"), &world.policy, Feeds::from_source(&world.feed), &world.feed)?;
    println!("  Rerun with identical inputs reuses {} (new: {})\n", again.pack.id, again.commit.is_new());
    Ok(())
}

/// A corrected price for a published date supersedes the old pack without touching it.
fn scenario_2_late_correction(spine: &Spine, world: &mut World) -> SimResult {
    println!("Scenario 2: Late Price Correction\n");

    let as_of = day(2)?;
    let request = ctx(as_of, "correction-0102");
    let mut inputs = SnapshotInputs::collect(as_of, 0, &world.feed, &world.feed, &world.feed)?;
    for obs in inputs.prices.iter_mut().filter(|o| o.symbol == "SHOP") {
        obs.price = Price::new_unchecked(dec!(80.01));
    }

    let built = spine.build_pack(&request, &world.policy, &inputs)?;
    println!("  Correction committed as {:?}", built.commit);

    let ledger = LedgerValuation::new(as_of, "ledger-2024-01-02-r2")
        .with_position(PortfolioId(1), "AAPL", Amount::new(dec!(1300)))
        .with_position(PortfolioId(1), "SHOP", Amount::new(dec!(1600.2)));
    let recon = spine.publish_pack(&request, built.pack.id, &ledger)?;
    println!("  Corrected pack reconciled at {}", recon.error_bps);

    if let CommitOutcome::Superseded { old, .. } = built.commit {
        let original = spine.pack(old)?;
        println!("  Original {} still {} and unchanged: {}", original.id, original.status, original.verify_content_hash());
    }
    println!("  Lineage: {:?}\n", spine.store().lineage(built.pack.id)?);
    Ok(())
}

/// Warming packs are never served as fresh; a failed pack degrades to last known-good.
fn scenario_3_freshness_gate(spine: &Spine, world: &mut World, clock: &ManualClock) -> SimResult {
    println!("Scenario 3: Freshness Gate\n");

    clock.advance(24 * HOUR_MS);
    let as_of = day(3)?;
    // ledger disagrees by 1.5bp
    world.market_day(as_of, quote(dec!(105), dec!(82), dec!(1.32)), dec!(20), dec!(0.00015));
    let request = ctx(as_of, "job-0103");
    let inputs = SnapshotInputs::collect(as_of, 0, &world.feed, &world.feed, &world.feed)?;
    let built = spine.build_pack(&request, &world.policy, &inputs)?;

    match spine.get_latest(&request, &world.policy.id, true) {
        Err(SpineError::Gate(GateError::PackWarming { pack_id, estimated_ready_at, .. })) => {
            println!("  Fresh read rejected: {pack_id} warming, ready around {estimated_ready_at}");
        }
        other => println!("  Unexpected fresh read: {other:?}"),
    }
    let best_effort = spine.get_latest(&request, &world.policy.id, false)?;
    println!("  Best-effort read returns {} tagged {:?}", best_effort.pack.id, best_effort.staleness);

    let ledger = world.feed.valuation(as_of)?;
    if let Err(err) = spine.publish_pack(&request, built.pack.id, &ledger) {
        println!("  Publish refused: {err}");
    }
    let latest = spine.get_latest(&request, &world.policy.id, true)?;
    println!("  Fresh read now serves {} tagged {:?}", latest.pack.id, latest.staleness);

    // the corrected ledger arrives and the day is rebuilt with a small price fix
    world.feed.add_ledger(
        LedgerValuation::new(as_of, "ledger-2024-01-03-r2")
            .with_position(PortfolioId(1), "AAPL", Amount::new(dec!(1386)))
            .with_position(PortfolioId(1), "SHOP", Amount::new(dec!(1640))),
    );
    let mut inputs = inputs;
    for obs in inputs.prices.iter_mut().filter(|o| o.symbol == "SHOP") {
        obs.price = Price::new_unchecked(dec!(82.00001));
    }
    let rebuilt = spine.build_pack(&request, &world.policy, &inputs)?;
    spine.publish_pack(&request, rebuilt.pack.id, &world.feed.valuation(as_of)?)?;
    let latest = spine.get_latest(&request, &world.policy.id, true)?;
    println!("  After rebuild: {} tagged {:?}\n", latest.pack.id, latest.staleness);
    Ok(())
}

/// USD stock held in a CAD portfolio, day over day.
fn scenario_4_currency_attribution(spine: &Spine, world: &World) -> SimResult {
    println!("Scenario 4: Currency Attribution\n");

    let request = ctx(day(3)?, "attr-0103");
    let attribution = spine.attribute_latest(&request, &world.policy.id, PortfolioId(1))?;

    for p in &attribution.positions {
        println!(
            "  {:<5} weight {:.4}  local {:.4}%  fx {:.4}%  interaction {:.4}%  total {:.4}%",
            p.symbol,
            p.weight,
            p.local_return * dec!(100),
            p.fx_return * dec!(100),
            p.interaction_return * dec!(100),
            p.total_return * dec!(100),
        );
    }
    println!(
        "  Portfolio {} -> {}: total {:.4}% (identity error {})\n",
        attribution.prior_pack_id,
        attribution.pack_id,
        attribution.total_return * dec!(100),
        attribution.validation_error_bps
    );
    Ok(())
}

/// A week of ready packs with a mid-week deposit.
fn scenario_5_metrics(spine: &Spine, world: &mut World) -> SimResult {
    println!("Scenario 5: Portfolio Metrics\n");

    // a 500 CAD deposit on the 5th buys more SHOP
    world.feed.add_cashflow(PortfolioId(1), Cashflow::new(day(5)?, dec!(500)));
    let path = [
        (4, quote(dec!(105.2), dec!(81), dec!(1.32)), dec!(20)),
        (5, quote(dec!(105.5), dec!(80), dec!(1.321)), dec!(26.25)),
        (8, quote(dec!(104.9), dec!(80.4), dec!(1.322)), dec!(26.25)),
        (9, quote(dec!(105.8), dec!(80.9), dec!(1.321)), dec!(26.25)),
    ];

    for (d, q, shop_qty) in path {
        let as_of = day(d)?;
        world.market_day(as_of, q, shop_qty, Decimal::ZERO);
        let request = ctx(as_of, "daily-metrics");
        let report = spine.run_daily_job(&request, &world.policy, Feeds::from_source(&world.feed), &world.feed)?;
        let record = spine.compute_metrics(&request, &world.policy.id, PortfolioId(1), day(2)?, &world.feed)?;
        println!(
            "  {} {}: period {:.4}%  twr {:.4}%  mwr {:?}  max drawdown {}",
            as_of,
            report.pack.id,
            record.period_return * dec!(100),
            record.twr * dec!(100),
            record.mwr,
            record.drawdown.max_drawdown
        );
    }

    if let Some(record) = spine.history().get(PortfolioId(1), day(9)?) {
        println!("  Digest for {}: {}\n", record.as_of, record.digest()?);
    }
    Ok(())
}

/// Aggregate health as the scheduler falls behind.
fn scenario_6_rolling_health(spine: &Spine, clock: &ManualClock) -> SimResult {
    println!("Scenario 6: Rolling Aggregate Health\n");

    let refreshed = spine.run_due_aggregates();
    println!("  Scheduler refreshed {} windows", refreshed.len());

    for hours in [0, 2, 6] {
        clock.advance(hours * HOUR_MS);
        let status = spine.aggregate_status(RollingWindow::D30);
        println!("  +{hours}h: 30d view {:?}, lag {:?}ms, {} rows", status.health, status.lag_ms, status.row_count);
    }

    let read = spine.aggregate(RollingWindow::D30, PortfolioId(1), day(9)?)?;
    println!(
        "  30d read for {} served from {:?}: cumulative {:.4}%",
        read.aggregate.as_of,
        read.source,
        read.aggregate.cumulative_return * dec!(100)
    );
    Ok(())
}
