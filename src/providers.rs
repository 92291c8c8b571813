// 9.0 providers.rs: typed pull interfaces for everything the spine reads from outside.
// positions, prices, fx rates, the independent ledger, external cashflows. the core never
// knows whether it is talking to a fixture or a live feed; the right one is injected.
// 9.1 FixtureFeed is the in-memory implementation used by tests and the simulator.

use crate::metrics::Cashflow;
use crate::reconcile::LedgerValuation;
use crate::types::{Currency, FxRate, PortfolioId, Price};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A holding as reported by the position feed, before it is priced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosition {
    pub portfolio_id: PortfolioId,
    pub symbol: String,
    pub currency: Currency,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub symbol: String,
    pub as_of: NaiveDate,
    pub currency: Currency,
    pub price: Price,
}

/// `rate` converts one unit of `from` into `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxObservation {
    pub from: Currency,
    pub to: Currency,
    pub as_of: NaiveDate,
    pub rate: FxRate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("Feed {feed} unavailable: {reason}")]
    Unavailable { feed: &'static str, reason: String },

    #[error("Feed {feed} has no data for {as_of}")]
    NotFound { feed: &'static str, as_of: NaiveDate },
}

impl FeedError {
    // transient outages are worth another attempt. missing data is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Unavailable { .. })
    }
}

pub trait PositionSource: Send + Sync {
    fn positions(&self, as_of: NaiveDate) -> Result<Vec<RawPosition>, FeedError>;
}

pub trait PriceSource: Send + Sync {
    /// Observations dated within `[as_of - lookback_days, as_of]`.
    fn prices(&self, as_of: NaiveDate, lookback_days: u32) -> Result<Vec<PriceObservation>, FeedError>;
}

/// Date-keyed currency-pair rates. Pair resolution happens in the snapshot builder.
pub trait FxRateStore: Send + Sync {
    /// Observations dated within `[as_of - lookback_days, as_of]`.
    fn rates(&self, as_of: NaiveDate, lookback_days: u32) -> Result<Vec<FxObservation>, FeedError>;
}

pub trait LedgerSource: Send + Sync {
    fn valuation(&self, as_of: NaiveDate) -> Result<LedgerValuation, FeedError>;
}

pub trait CashflowSource: Send + Sync {
    /// External flows dated within `[from, to]`.
    fn cashflows(&self, portfolio_id: PortfolioId, from: NaiveDate, to: NaiveDate) -> Result<Vec<Cashflow>, FeedError>;
}

/// The three feeds one pack build reads from, bundled for the daily job.
#[derive(Clone, Copy)]
pub struct Feeds<'a> {
    pub positions: &'a dyn PositionSource,
    pub prices: &'a dyn PriceSource,
    pub fx: &'a dyn FxRateStore,
}

impl<'a> Feeds<'a> {
    /// One source that serves all three.
    pub fn from_source<S>(source: &'a S) -> Self
    where
        S: PositionSource + PriceSource + FxRateStore,
    {
        Self {
            positions: source,
            prices: source,
            fx: source,
        }
    }
}

/// In-memory feed. Everything keyed by date so lookups match what a live feed would return.
#[derive(Debug, Clone, Default)]
pub struct FixtureFeed {
    positions: BTreeMap<NaiveDate, Vec<RawPosition>>,
    prices: BTreeMap<NaiveDate, Vec<PriceObservation>>,
    fx_rates: BTreeMap<NaiveDate, Vec<FxObservation>>,
    ledgers: BTreeMap<NaiveDate, LedgerValuation>,
    cashflows: Vec<(PortfolioId, Cashflow)>,
    unavailable: Option<&'static str>,
}

impl FixtureFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, as_of: NaiveDate, position: RawPosition) -> Self {
        self.add_position(as_of, position);
        self
    }

    pub fn with_price(mut self, symbol: &str, currency: Currency, as_of: NaiveDate, price: Price) -> Self {
        self.add_price(symbol, currency, as_of, price);
        self
    }

    pub fn with_fx(mut self, from: Currency, to: Currency, as_of: NaiveDate, rate: FxRate) -> Self {
        self.add_fx(from, to, as_of, rate);
        self
    }

    pub fn add_position(&mut self, as_of: NaiveDate, position: RawPosition) {
        self.positions.entry(as_of).or_default().push(position);
    }

    pub fn add_price(&mut self, symbol: &str, currency: Currency, as_of: NaiveDate, price: Price) {
        self.prices.entry(as_of).or_default().push(PriceObservation {
            symbol: symbol.to_string(),
            as_of,
            currency,
            price,
        });
    }

    pub fn add_fx(&mut self, from: Currency, to: Currency, as_of: NaiveDate, rate: FxRate) {
        self.fx_rates.entry(as_of).or_default().push(FxObservation { from, to, as_of, rate });
    }

    pub fn add_ledger(&mut self, ledger: LedgerValuation) {
        self.ledgers.insert(ledger.as_of, ledger);
    }

    pub fn add_cashflow(&mut self, portfolio_id: PortfolioId, cashflow: Cashflow) {
        self.cashflows.push((portfolio_id, cashflow));
    }

    // simulate an outage on one named feed
    pub fn set_unavailable(&mut self, feed: Option<&'static str>) {
        self.unavailable = feed;
    }

    fn check(&self, feed: &'static str) -> Result<(), FeedError> {
        match self.unavailable {
            Some(down) if down == feed => Err(FeedError::Unavailable {
                feed,
                reason: "fixture marked unavailable".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl PositionSource for FixtureFeed {
    fn positions(&self, as_of: NaiveDate) -> Result<Vec<RawPosition>, FeedError> {
        self.check("positions")?;
        self.positions
            .get(&as_of)
            .cloned()
            .ok_or(FeedError::NotFound { feed: "positions", as_of })
    }
}

impl PriceSource for FixtureFeed {
    fn prices(&self, as_of: NaiveDate, lookback_days: u32) -> Result<Vec<PriceObservation>, FeedError> {
        self.check("prices")?;
        let from = as_of - chrono::Duration::days(i64::from(lookback_days));
        Ok(self
            .prices
            .range(from..=as_of)
            .flat_map(|(_, obs)| obs.iter().cloned())
            .collect())
    }
}

impl FxRateStore for FixtureFeed {
    fn rates(&self, as_of: NaiveDate, lookback_days: u32) -> Result<Vec<FxObservation>, FeedError> {
        self.check("fx")?;
        let from = as_of - chrono::Duration::days(i64::from(lookback_days));
        Ok(self
            .fx_rates
            .range(from..=as_of)
            .flat_map(|(_, obs)| obs.iter().cloned())
            .collect())
    }
}

impl LedgerSource for FixtureFeed {
    fn valuation(&self, as_of: NaiveDate) -> Result<LedgerValuation, FeedError> {
        self.check("ledger")?;
        self.ledgers
            .get(&as_of)
            .cloned()
            .ok_or(FeedError::NotFound { feed: "ledger", as_of })
    }
}

impl CashflowSource for FixtureFeed {
    fn cashflows(&self, portfolio_id: PortfolioId, from: NaiveDate, to: NaiveDate) -> Result<Vec<Cashflow>, FeedError> {
        self.check("cashflows")?;
        let mut flows: Vec<Cashflow> = self
            .cashflows
            .iter()
            .filter(|(pf, cf)| *pf == portfolio_id && cf.date >= from && cf.date <= to)
            .map(|(_, cf)| cf.clone())
            .collect();
        flows.sort_by_key(|cf| cf.date);
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    fn cad() -> Currency {
        Currency::new("CAD").unwrap()
    }

    #[test]
    fn fx_lookback_window() {
        let feed = FixtureFeed::new()
            .with_fx(usd(), cad(), d(2), FxRate::new_unchecked(dec!(1.25)))
            .with_fx(usd(), cad(), d(5), FxRate::new_unchecked(dec!(1.26)));

        assert_eq!(feed.rates(d(2), 0).unwrap().len(), 1);
        assert!(feed.rates(d(4), 0).unwrap().is_empty());
        assert_eq!(feed.rates(d(4), 2).unwrap()[0].rate.value(), dec!(1.25));
        assert_eq!(feed.rates(d(5), 3).unwrap().len(), 2);
    }

    #[test]
    fn price_lookback_window() {
        let feed = FixtureFeed::new()
            .with_price("AAPL", usd(), d(1), Price::new_unchecked(dec!(100)))
            .with_price("AAPL", usd(), d(3), Price::new_unchecked(dec!(101)));

        assert_eq!(feed.prices(d(3), 0).unwrap().len(), 1);
        assert_eq!(feed.prices(d(3), 2).unwrap().len(), 2);
        assert!(feed.prices(d(2), 0).unwrap().is_empty());
    }

    #[test]
    fn outage_is_retryable_missing_is_not() {
        let mut feed = FixtureFeed::new();
        let missing = feed.positions(d(1)).unwrap_err();
        assert!(!missing.is_retryable());

        feed.set_unavailable(Some("positions"));
        let outage = feed.positions(d(1)).unwrap_err();
        assert!(outage.is_retryable());
    }
}
