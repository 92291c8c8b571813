// 6.0 metrics.rs: derived performance metrics over a chain of ready packs.
// every record is tagged with the pack and ledger commit it came from and is reproducible:
// same chain + same cashflows = byte-identical record (BTreeMaps, fixed rounding, no clocks).
//
// 6.1 sub-period returns: r_t = (V_t - CF_t) / V_{t-1} - 1, CF_t dated in (d_{t-1}, d_t]
// 6.2 TWR links them geometrically. MWR is the annualized IRR, solved by bounded Newton.
// 6.3 volatility, sharpe, drawdown, windowed returns.
// 6.4 MetricsHistory is the append-only store the rolling aggregates read from.

use crate::pack::{PackStatus, PricingPack};
use crate::types::{Amount, PackId, PolicyId, PortfolioId};
use chrono::NaiveDate;
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

const DAYS_PER_YEAR: Decimal = dec!(365);
const OUTPUT_DP: u32 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsParams {
    /// Annualization factor for volatility and sharpe.
    pub periods_per_year: u32,
    /// Annual, as a fraction.
    pub risk_free_rate: Decimal,
    /// Trailing windows in calendar days.
    pub volatility_windows_days: Vec<u32>,
    pub return_windows_days: Vec<u32>,
    pub irr_max_iterations: u32,
    /// Newton stops once a step moves the rate less than this.
    pub irr_tolerance: Decimal,
    pub irr_initial_guess: Decimal,
}

impl Default for MetricsParams {
    fn default() -> Self {
        Self {
            periods_per_year: 252,
            risk_free_rate: Decimal::ZERO,
            volatility_windows_days: vec![30, 90],
            return_windows_days: vec![30, 90, 365],
            irr_max_iterations: 100,
            irr_tolerance: dec!(0.0000000001),
            irr_initial_guess: dec!(0.1),
        }
    }
}

/// External flow into (+) or out of (-) a portfolio, in base currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cashflow {
    pub date: NaiveDate,
    pub amount: Amount,
}

impl Cashflow {
    pub fn new(date: NaiveDate, amount: Decimal) -> Self {
        Self {
            date,
            amount: Amount::new(amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DrawdownStats {
    /// (peak - trough) / peak on the TWR index. Positive.
    pub max_drawdown: Decimal,
    pub peak_date: Option<NaiveDate>,
    pub trough_date: Option<NaiveDate>,
    /// None if the index never got back to the peak
    pub recovery_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub portfolio_id: PortfolioId,
    pub as_of: NaiveDate,
    pub pack_id: PackId,
    pub ledger_commit: Option<String>,
    pub policy: PolicyId,
    /// first pack date of the chain the record was computed over
    pub chain_start: NaiveDate,
    /// sha-256 of the flows applied inside the chain, empty list included
    pub cashflow_digest: String,
    pub observations: usize,
    /// last sub-period return
    pub period_return: Decimal,
    pub twr: Decimal,
    pub mwr: Option<Decimal>,
    pub windowed_returns: BTreeMap<u32, Decimal>,
    pub volatility: BTreeMap<u32, Option<Decimal>>,
    pub sharpe: Option<Decimal>,
    pub drawdown: DrawdownStats,
}

impl MetricsRecord {
    /// Hex sha-256 over the canonical JSON encoding. Equal digests mean equal records.
    pub fn digest(&self) -> Result<String, MetricsError> {
        let encoded = serde_json::to_vec(self).map_err(|e| MetricsError::Encoding(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("IRR did not converge after {iterations} iterations (last rate {last_rate}): {reason}")]
pub struct NonConvergenceError {
    pub iterations: u32,
    pub last_rate: Decimal,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricsError {
    #[error(transparent)]
    NonConvergence(#[from] NonConvergenceError),

    #[error("No packs supplied for {0}")]
    EmptyChain(PortfolioId),

    #[error("Pack {pack_id} is {status}, metrics need ready packs")]
    PackNotReady { pack_id: PackId, status: PackStatus },

    #[error("Chain mixes policies {expected} and {found}")]
    PolicyMismatch { expected: PolicyId, found: PolicyId },

    #[error("Chain dates must strictly increase, {previous} then {next}")]
    NotChronological { previous: NaiveDate, next: NaiveDate },

    #[error("Record for {portfolio_id} on {as_of} from {pack_id} already exists with different content")]
    HistoryConflict {
        portfolio_id: PortfolioId,
        as_of: NaiveDate,
        pack_id: PackId,
    },

    #[error("Failed to encode metrics record: {0}")]
    Encoding(String),

    #[error("Pinned {pack_id} is not a ready pack in [{from}, {to}]")]
    PinnedPackOutsideChain {
        pack_id: PackId,
        from: NaiveDate,
        to: NaiveDate,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MetricsEngine {
    params: MetricsParams,
}

impl MetricsEngine {
    pub fn new(params: MetricsParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MetricsParams {
        &self.params
    }

    /// Metrics for one portfolio as of the last pack in `chain`.
    pub fn compute(
        &self,
        portfolio_id: PortfolioId,
        chain: &[Arc<PricingPack>],
        cashflows: &[Cashflow],
    ) -> Result<MetricsRecord, MetricsError> {
        let last = check_chain(portfolio_id, chain)?;

        let values: Vec<(NaiveDate, Decimal)> = chain
            .iter()
            .map(|p| (p.as_of, p.portfolio_nav(portfolio_id).value()))
            .collect();
        let returns = sub_period_returns(&values, cashflows);
        let as_of = last.as_of;
        let start = values.first().map(|(d, _)| *d).unwrap_or(as_of);

        let twr = link(returns.iter().map(|(_, r)| *r));
        let mwr = self.money_weighted(&values, cashflows)?;

        let windowed_returns = self
            .params
            .return_windows_days
            .iter()
            .map(|w| (*w, round(link(in_window(&returns, as_of, *w)))))
            .collect();

        let volatility: BTreeMap<u32, Option<Decimal>> = self
            .params
            .volatility_windows_days
            .iter()
            .map(|w| {
                let window: Vec<Decimal> = in_window(&returns, as_of, *w).collect();
                (*w, self.annualized_volatility(&window).map(round))
            })
            .collect();

        let sharpe = self.sharpe(&returns, as_of);

        let record = MetricsRecord {
            portfolio_id,
            as_of,
            pack_id: last.id,
            ledger_commit: last.ledger_commit.clone(),
            policy: last.policy.clone(),
            chain_start: start,
            cashflow_digest: cashflow_digest(start, as_of, cashflows),
            observations: returns.len(),
            period_return: round(returns.last().map(|(_, r)| *r).unwrap_or(Decimal::ZERO)),
            twr: round(twr),
            mwr: mwr.map(round),
            windowed_returns,
            volatility,
            sharpe: sharpe.map(round),
            drawdown: drawdown(start, &returns),
        };

        debug!(portfolio = %portfolio_id, pack = %last.id, twr = %record.twr, mwr = ?record.mwr, "metrics computed");
        Ok(record)
    }

    // IRR on -V0 at d0, -CF at each flow date, +Vn at dn
    fn money_weighted(&self, values: &[(NaiveDate, Decimal)], cashflows: &[Cashflow]) -> Result<Option<Decimal>, NonConvergenceError> {
        let (Some((d0, v0)), Some((dn, vn))) = (values.first(), values.last()) else {
            return Ok(None);
        };
        let mut flows = vec![(*d0, -*v0)];
        flows.extend(
            cashflows
                .iter()
                .filter(|cf| cf.date > *d0 && cf.date <= *dn)
                .map(|cf| (cf.date, -cf.amount.value())),
        );
        flows.push((*dn, *vn));

        let distinct: BTreeSet<NaiveDate> = flows.iter().map(|(d, _)| *d).collect();
        if distinct.len() < 2 {
            return Ok(None);
        }

        solve_irr(
            &flows,
            self.params.irr_max_iterations,
            self.params.irr_tolerance,
            self.params.irr_initial_guess,
        )
        .map(Some)
    }

    /// Sample stdev scaled by √periods_per_year. None below two observations.
    pub fn annualized_volatility(&self, returns: &[Decimal]) -> Option<Decimal> {
        if returns.len() < 2 {
            return None;
        }
        let count = Decimal::from(returns.len());
        let mean = returns.iter().sum::<Decimal>() / count;
        let squared: Decimal = returns.iter().map(|r| (r - mean) * (r - mean)).sum();
        let variance = squared / (count - Decimal::ONE);
        let per_period = variance.sqrt()?;
        let factor = Decimal::from(self.params.periods_per_year).sqrt()?;
        Some(per_period * factor)
    }

    // over the longest volatility window
    fn sharpe(&self, returns: &[(NaiveDate, Decimal)], as_of: NaiveDate) -> Option<Decimal> {
        let window = *self.params.volatility_windows_days.iter().max()?;
        let sample: Vec<Decimal> = in_window(returns, as_of, window).collect();
        let vol = self.annualized_volatility(&sample)?;
        if vol.is_zero() {
            return None;
        }
        let mean = sample.iter().sum::<Decimal>() / Decimal::from(sample.len());
        let excess = mean * Decimal::from(self.params.periods_per_year) - self.params.risk_free_rate;
        excess.checked_div(vol)
    }
}

fn check_chain(portfolio_id: PortfolioId, chain: &[Arc<PricingPack>]) -> Result<&PricingPack, MetricsError> {
    let first = chain.first().ok_or(MetricsError::EmptyChain(portfolio_id))?;
    for pack in chain {
        if pack.status != PackStatus::Ready {
            return Err(MetricsError::PackNotReady {
                pack_id: pack.id,
                status: pack.status,
            });
        }
        if pack.policy != first.policy {
            return Err(MetricsError::PolicyMismatch {
                expected: first.policy.clone(),
                found: pack.policy.clone(),
            });
        }
    }
    for pair in chain.windows(2) {
        if pair[0].as_of >= pair[1].as_of {
            return Err(MetricsError::NotChronological {
                previous: pair[0].as_of,
                next: pair[1].as_of,
            });
        }
    }
    Ok(chain.last().map(|p| p.as_ref()).unwrap_or(first.as_ref()))
}

/// r_t for t = 1..n, dated d_t. A zero starting value gives a zero return.
pub fn sub_period_returns(values: &[(NaiveDate, Decimal)], cashflows: &[Cashflow]) -> Vec<(NaiveDate, Decimal)> {
    values
        .windows(2)
        .map(|pair| {
            let (d0, v0) = pair[0];
            let (d1, v1) = pair[1];
            let flow: Decimal = cashflows
                .iter()
                .filter(|cf| cf.date > d0 && cf.date <= d1)
                .map(|cf| cf.amount.value())
                .sum();
            let r = if v0.is_zero() {
                Decimal::ZERO
            } else {
                (v1 - flow) / v0 - Decimal::ONE
            };
            (d1, r)
        })
        .collect()
}

/// Π(1 + r) - 1
pub fn link(returns: impl IntoIterator<Item = Decimal>) -> Decimal {
    returns
        .into_iter()
        .fold(Decimal::ONE, |acc, r| acc * (Decimal::ONE + r))
        - Decimal::ONE
}

// returns dated in (as_of - days, as_of]
fn in_window(returns: &[(NaiveDate, Decimal)], as_of: NaiveDate, days: u32) -> impl Iterator<Item = Decimal> + '_ {
    returns
        .iter()
        .filter(move |(d, _)| (as_of - *d).num_days() < i64::from(days))
        .map(|(_, r)| *r)
}

/// Max drawdown on the index built from `returns`, starting at 1 on `start`.
pub fn drawdown(start: NaiveDate, returns: &[(NaiveDate, Decimal)]) -> DrawdownStats {
    let mut index = Decimal::ONE;
    let mut peak = Decimal::ONE;
    let mut peak_date = start;
    let mut worst = Decimal::ZERO;
    let mut stats = DrawdownStats::default();

    for (date, r) in returns {
        index *= Decimal::ONE + *r;
        if index >= peak {
            // first new high after the worst trough
            if worst > Decimal::ZERO && stats.recovery_date.is_none() {
                stats.recovery_date = Some(*date);
            }
            peak = index;
            peak_date = *date;
            continue;
        }
        let dd = if peak.is_zero() { Decimal::ONE } else { (peak - index) / peak };
        if dd > worst {
            worst = dd;
            stats.peak_date = Some(peak_date);
            stats.trough_date = Some(*date);
            stats.recovery_date = None;
        }
    }
    stats.max_drawdown = round(worst);
    stats
}

/// Newton–Raphson IRR with time in years = days / 365. Bounded by `max_iterations`.
pub fn solve_irr(
    flows: &[(NaiveDate, Decimal)],
    max_iterations: u32,
    tolerance: Decimal,
    initial_guess: Decimal,
) -> Result<Decimal, NonConvergenceError> {
    if flows.iter().all(|(_, a)| a.is_zero()) {
        return Ok(Decimal::ZERO);
    }
    let Some(start) = flows.iter().map(|(d, _)| *d).min() else {
        return Ok(Decimal::ZERO);
    };

    let mut rate = initial_guess;
    for iteration in 1..=max_iterations {
        let fail = |reason| NonConvergenceError {
            iterations: iteration,
            last_rate: rate,
            reason,
        };
        let (npv, slope) = npv_and_slope(flows, start, rate).ok_or_else(|| fail("rate outside solvable range"))?;
        if slope.is_zero() {
            return Err(fail("zero derivative"));
        }
        let step = npv.checked_div(slope).ok_or_else(|| fail("step overflow"))?;
        let mut next = rate - step;
        if next <= -Decimal::ONE {
            // overshot past -100%: go halfway to the boundary instead
            next = (rate - Decimal::ONE) / Decimal::TWO;
        }
        let moved = (next - rate).abs();
        rate = next;
        if moved < tolerance {
            return Ok(rate);
        }
    }

    warn!(iterations = max_iterations, last_rate = %rate, "irr solver hit iteration limit");
    Err(NonConvergenceError {
        iterations: max_iterations,
        last_rate: rate,
        reason: "iteration limit",
    })
}

/// NPV and its derivative at `rate`. None when the power is undefined or overflows.
pub fn npv_and_slope(flows: &[(NaiveDate, Decimal)], start: NaiveDate, rate: Decimal) -> Option<(Decimal, Decimal)> {
    let base = Decimal::ONE + rate;
    if base <= Decimal::ZERO {
        return None;
    }
    let mut npv = Decimal::ZERO;
    let mut slope = Decimal::ZERO;
    for (date, amount) in flows {
        let years = Decimal::from((*date - start).num_days()) / DAYS_PER_YEAR;
        if years.is_zero() {
            npv += *amount;
            continue;
        }
        let growth = base.checked_powd(years)?;
        npv += amount.checked_div(growth)?;
        slope -= (years * *amount).checked_div(growth.checked_mul(base)?)?;
    }
    Some((npv, slope))
}

// flows in (start, end], date order, amounts normalized
fn cashflow_digest(start: NaiveDate, end: NaiveDate, cashflows: &[Cashflow]) -> String {
    let mut applied: Vec<(NaiveDate, Decimal)> = cashflows
        .iter()
        .filter(|cf| cf.date > start && cf.date <= end)
        .map(|cf| (cf.date, cf.amount.value().normalize()))
        .collect();
    applied.sort();
    let canonical: Vec<Value> = applied
        .iter()
        .map(|(date, amount)| json!({ "date": date.to_string(), "amount": amount.to_string() }))
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(Value::Array(canonical).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn round(d: Decimal) -> Decimal {
    d.round_dp(OUTPUT_DP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Byte-identical record was already there.
    AlreadyPresent,
}

type HistoryKey = (PortfolioId, NaiveDate, PackId, NaiveDate);

/// Append-only metrics rows keyed by (portfolio, as_of, pack, chain start). A corrected pack
/// or a different starting date gets its own row. Reads take the newest pack for a date and,
/// within it, the longest chain.
#[derive(Debug, Default)]
pub struct MetricsHistory {
    rows: RwLock<BTreeMap<HistoryKey, Arc<MetricsRecord>>>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: MetricsRecord) -> Result<AppendOutcome, MetricsError> {
        let key = (record.portfolio_id, record.as_of, record.pack_id, record.chain_start);
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = rows.get(&key) {
            if **existing == record {
                debug!(portfolio = %record.portfolio_id, as_of = %record.as_of, "metrics already recorded");
                return Ok(AppendOutcome::AlreadyPresent);
            }
            warn!(portfolio = %record.portfolio_id, as_of = %record.as_of, pack = %record.pack_id, "refusing to overwrite metrics record");
            return Err(MetricsError::HistoryConflict {
                portfolio_id: record.portfolio_id,
                as_of: record.as_of,
                pack_id: record.pack_id,
            });
        }
        info!(portfolio = %record.portfolio_id, as_of = %record.as_of, pack = %record.pack_id, twr = %record.twr, "metrics recorded");
        rows.insert(key, Arc::new(record));
        Ok(AppendOutcome::Appended)
    }

    /// Newest-pack record for one date.
    pub fn get(&self, portfolio_id: PortfolioId, as_of: NaiveDate) -> Option<Arc<MetricsRecord>> {
        self.series(portfolio_id, as_of, as_of).pop()
    }

    /// One record per date inside `[from, to]`: newest pack, then earliest chain start. Date order.
    pub fn series(&self, portfolio_id: PortfolioId, from: NaiveDate, to: NaiveDate) -> Vec<Arc<MetricsRecord>> {
        if from > to {
            return Vec::new();
        }
        let rows = self.read();
        let mut by_date: BTreeMap<NaiveDate, Arc<MetricsRecord>> = BTreeMap::new();
        let lower = (portfolio_id, from, PackId(0), NaiveDate::MIN);
        let upper = (portfolio_id, to, PackId(u64::MAX), NaiveDate::MAX);
        for (_, record) in rows.range(lower..=upper) {
            // ordered by pack then chain start: a newer pack replaces, a later start never does
            let newer = by_date
                .get(&record.as_of)
                .map_or(true, |kept| record.pack_id > kept.pack_id);
            if newer {
                by_date.insert(record.as_of, Arc::clone(record));
            }
        }
        by_date.into_values().collect()
    }

    pub fn portfolios(&self) -> BTreeSet<PortfolioId> {
        self.read().keys().map(|(pf, _, _, _)| *pf).collect()
    }

    pub fn dates(&self, portfolio_id: PortfolioId) -> BTreeSet<NaiveDate> {
        self.read()
            .keys()
            .filter(|(pf, _, _, _)| *pf == portfolio_id)
            .map(|(_, d, _, _)| *d)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<HistoryKey, Arc<MetricsRecord>>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{compute_content_hash, PositionSnapshot};
    use crate::types::{Currency, FxRate, Price, Timestamp};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn pack(id: u64, as_of: NaiveDate, nav: Decimal) -> Arc<PricingPack> {
        let policy = PolicyId::new("EOD-USD");
        let usd = Currency::new("USD").unwrap();
        let positions = vec![PositionSnapshot {
            pack_id: PackId(id),
            portfolio_id: PortfolioId(1),
            symbol: "SPY".to_string(),
            currency: usd.clone(),
            quantity: Decimal::ONE,
            local_price: Price::new_unchecked(nav),
            fx_rate: FxRate::identity(),
            value: Amount::new(nav),
        }];
        Arc::new(PricingPack {
            id: PackId(id),
            as_of,
            content_hash: compute_content_hash(as_of, &policy, &usd, &positions),
            policy,
            base_currency: usd,
            supersedes: None,
            superseded_by: None,
            status: PackStatus::Ready,
            is_fresh: true,
            reconciliation_error: Some(Decimal::ZERO),
            ledger_commit: Some(format!("c-{id}")),
            created_at: Timestamp::from_millis(0),
            positions,
        })
    }

    fn chain(navs: &[Decimal]) -> Vec<Arc<PricingPack>> {
        navs.iter()
            .enumerate()
            .map(|(i, v)| pack(i as u64 + 1, d(i as u32 + 1), *v))
            .collect()
    }

    #[test]
    fn cashflows_are_removed_from_returns() {
        let values = vec![(d(1), dec!(100)), (d(2), dec!(160))];
        let flows = vec![Cashflow::new(d(2), dec!(50))];
        let r = sub_period_returns(&values, &flows);
        assert_eq!(r, vec![(d(2), dec!(0.1))]);

        // flow dated on the start date belongs to the previous period
        let early = vec![Cashflow::new(d(1), dec!(50))];
        assert_eq!(sub_period_returns(&values, &early)[0].1, dec!(0.6));
    }

    #[test]
    fn zero_start_value_gives_zero_return() {
        let values = vec![(d(1), Decimal::ZERO), (d(2), dec!(100))];
        assert_eq!(sub_period_returns(&values, &[])[0].1, Decimal::ZERO);
    }

    #[test]
    fn twr_drawdown_and_tags() {
        let record = MetricsEngine::default()
            .compute(PortfolioId(1), &chain(&[dec!(100), dec!(110), dec!(99)]), &[])
            .unwrap();
        assert_eq!(record.twr, dec!(-0.01));
        assert_eq!(record.period_return, dec!(-0.1));
        assert_eq!(record.pack_id, PackId(3));
        assert_eq!(record.ledger_commit.as_deref(), Some("c-3"));
        assert_eq!(record.drawdown.max_drawdown, dec!(0.1));
        assert_eq!(record.drawdown.peak_date, Some(d(2)));
        assert_eq!(record.drawdown.trough_date, Some(d(3)));
        assert_eq!(record.drawdown.recovery_date, None);
    }

    #[test]
    fn drawdown_recovery_date() {
        let returns = vec![(d(2), dec!(0.1)), (d(3), dec!(-0.1)), (d(4), dec!(0.05)), (d(5), dec!(0.1))];
        let stats = drawdown(d(1), &returns);
        assert_eq!(stats.trough_date, Some(d(3)));
        assert_eq!(stats.recovery_date, Some(d(5)));
    }

    #[test]
    fn volatility_is_sample_stdev_annualized() {
        let engine = MetricsEngine::default();
        let vol = engine.annualized_volatility(&[dec!(0.1), dec!(-0.1)]).unwrap();
        // sqrt(0.02 * 252)
        assert!((vol - dec!(2.2449944320643650)).abs() < dec!(0.000000001));
        assert!(engine.annualized_volatility(&[dec!(0.1)]).is_none());
    }

    #[test]
    fn irr_matches_simple_growth() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let flows = vec![(start, dec!(-100)), (end, dec!(110))];
        let irr = solve_irr(&flows, 100, dec!(0.0000000001), Decimal::ZERO).unwrap();
        assert!((irr - dec!(0.1)).abs() < dec!(0.00000001));
    }

    #[test]
    fn irr_with_interim_flow_zeroes_npv() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let mid = NaiveDate::from_ymd_opt(2023, 7, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let flows = vec![(start, dec!(-1000)), (mid, dec!(-500)), (end, dec!(1600))];
        let irr = solve_irr(&flows, 100, dec!(0.0000000001), dec!(0.1)).unwrap();
        let (npv, _) = npv_and_slope(&flows, start, irr).unwrap();
        assert!(npv.abs() < dec!(0.0001));
        assert!(irr > Decimal::ZERO && irr < dec!(0.1));
    }

    #[test]
    fn irr_one_day_loss_stays_above_minus_one() {
        // 1% down over one day annualizes to about -97.45%; the first newton step overshoots -1
        let flows = vec![(d(1), dec!(-100)), (d(2), dec!(99))];
        let irr = solve_irr(&flows, 100, dec!(0.0000000001), dec!(0.1)).unwrap();
        assert!(irr > -Decimal::ONE && irr < dec!(-0.97));
        let (npv, _) = npv_and_slope(&flows, d(1), irr).unwrap();
        assert!(npv.abs() < dec!(0.0001));
    }

    #[test]
    fn irr_without_sign_change_does_not_converge() {
        let flows = vec![(d(1), dec!(0)), (d(30), dec!(100))];
        let err = solve_irr(&flows, 5, dec!(0.0000000001), dec!(0.1)).unwrap_err();
        assert!(err.iterations <= 5);
    }

    #[test]
    fn single_pack_has_no_mwr() {
        let record = MetricsEngine::default()
            .compute(PortfolioId(1), &chain(&[dec!(100)]), &[])
            .unwrap();
        assert_eq!(record.mwr, None);
        assert_eq!(record.twr, Decimal::ZERO);
        assert_eq!(record.observations, 0);
    }

    #[test]
    fn chain_checks() {
        let engine = MetricsEngine::default();
        assert_eq!(
            engine.compute(PortfolioId(1), &[], &[]),
            Err(MetricsError::EmptyChain(PortfolioId(1)))
        );
        let mut packs = chain(&[dec!(100), dec!(101)]);
        packs.swap(0, 1);
        assert!(matches!(
            engine.compute(PortfolioId(1), &packs, &[]),
            Err(MetricsError::NotChronological { .. })
        ));
    }

    #[test]
    fn identical_inputs_identical_digest() {
        let engine = MetricsEngine::default();
        let packs = chain(&[dec!(100), dec!(103), dec!(101), dec!(104)]);
        let flows = vec![Cashflow::new(d(3), dec!(-2))];
        let a = engine.compute(PortfolioId(1), &packs, &flows).unwrap();
        let b = engine.compute(PortfolioId(1), &packs, &flows).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
    }

    #[test]
    fn history_is_append_only() {
        let engine = MetricsEngine::default();
        let history = MetricsHistory::new();
        let record = engine
            .compute(PortfolioId(1), &chain(&[dec!(100), dec!(105)]), &[])
            .unwrap();

        assert_eq!(history.append(record.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(history.append(record.clone()).unwrap(), AppendOutcome::AlreadyPresent);

        let mut altered = record.clone();
        altered.twr = dec!(0.99);
        assert!(matches!(history.append(altered), Err(MetricsError::HistoryConflict { .. })));
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(PortfolioId(1), d(2)).unwrap().twr, record.twr);
        assert_eq!(history.series(PortfolioId(1), d(1), d(31)).len(), 1);
    }

    #[test]
    fn history_keeps_each_starting_date() {
        let engine = MetricsEngine::default();
        let history = MetricsHistory::new();
        let packs = chain(&[dec!(100), dec!(104), dec!(102)]);

        let inception = engine.compute(PortfolioId(1), &packs, &[]).unwrap();
        let tail = engine.compute(PortfolioId(1), &packs[1..], &[]).unwrap();
        assert_eq!(inception.pack_id, tail.pack_id);
        assert_eq!(inception.chain_start, d(1));
        assert_eq!(tail.chain_start, d(2));

        assert_eq!(history.append(tail.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(history.append(inception.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(history.len(), 2);
        // longest chain wins within a pack
        assert_eq!(*history.get(PortfolioId(1), d(3)).unwrap(), inception);
    }

    #[test]
    fn record_carries_its_inputs() {
        let engine = MetricsEngine::default();
        let packs = chain(&[dec!(100), dec!(103), dec!(101), dec!(104)]);
        let flows = vec![Cashflow::new(d(3), dec!(-2))];
        let with_flow = engine.compute(PortfolioId(1), &packs, &flows).unwrap();
        let without = engine.compute(PortfolioId(1), &packs, &[]).unwrap();
        assert_ne!(with_flow.cashflow_digest, without.cashflow_digest);

        // the record names enough to recompute itself
        let start = packs.iter().position(|p| p.as_of == with_flow.chain_start).unwrap();
        let again = engine.compute(PortfolioId(1), &packs[start..], &flows).unwrap();
        assert_eq!(again, with_flow);

        // flows outside the chain do not move the digest
        let outside = vec![Cashflow::new(d(1), dec!(50)), Cashflow::new(d(20), dec!(7))];
        assert_eq!(
            engine.compute(PortfolioId(1), &packs, &outside).unwrap().cashflow_digest,
            without.cashflow_digest
        );
    }
}
