// 2.1x snapshot.rs: turns raw positions + price/fx observations into a pack draft.
// the draft has no id yet; the store assigns one when it commits. every missing observation
// is reported at once so the feed team sees the whole gap, not the first hole.

use crate::pack::{compute_content_hash, ContentHash, PositionSnapshot, ValuationPolicy};
use crate::providers::{FeedError, FxObservation, FxRateStore, PositionSource, PriceObservation, PriceSource, RawPosition};
use crate::types::{Amount, Currency, FxRate, PackId, PolicyId, PortfolioId, Price};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// How many days back a price observation may be carried forward. 0 = exact date only.
    pub price_lookback_days: u32,
    /// Same for fx rates.
    pub fx_lookback_days: u32,
}

impl SnapshotParams {
    /// Widest window the feeds have to serve.
    pub fn feed_lookback_days(&self) -> u32 {
        self.price_lookback_days.max(self.fx_lookback_days)
    }
}

impl Default for SnapshotParams {
    fn default() -> Self {
        Self {
            price_lookback_days: 0,
            fx_lookback_days: 0,
        }
    }
}

/// Everything one build needs for one as-of date.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotInputs {
    pub as_of: Option<NaiveDate>,
    pub positions: Vec<RawPosition>,
    pub prices: Vec<PriceObservation>,
    pub fx_rates: Vec<FxObservation>,
}

impl SnapshotInputs {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of: Some(as_of),
            ..Self::default()
        }
    }

    // pulls one date's inputs from whatever feeds were injected
    pub fn collect(
        as_of: NaiveDate,
        lookback_days: u32,
        positions: &dyn PositionSource,
        prices: &dyn PriceSource,
        fx: &dyn FxRateStore,
    ) -> Result<Self, FeedError> {
        Ok(Self {
            as_of: Some(as_of),
            positions: positions.positions(as_of)?,
            prices: prices.prices(as_of, lookback_days)?,
            fx_rates: fx.rates(as_of, lookback_days)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingInput {
    Price { symbol: String },
    FxRate { from: Currency, to: Currency },
}

impl fmt::Display for MissingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingInput::Price { symbol } => write!(f, "price for {symbol}"),
            MissingInput::FxRate { from, to } => write!(f, "fx rate {from}/{to}"),
        }
    }
}

fn join_missing(missing: &[MissingInput]) -> String {
    missing.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Data incomplete for {as_of}: missing {}", join_missing(.missing))]
    DataIncomplete { as_of: NaiveDate, missing: Vec<MissingInput> },

    #[error("No positions supplied for {0}")]
    NoPositions(NaiveDate),

    #[error("No as-of date supplied")]
    NoAsOfDate,

    #[error("{symbol} in {portfolio_id} reported in both {first} and {second}")]
    HoldingCurrencyConflict {
        portfolio_id: PortfolioId,
        symbol: String,
        first: Currency,
        second: Currency,
    },

    #[error("Price for {symbol} quoted in {price_currency}, position held in {position_currency}")]
    CurrencyMismatch {
        symbol: String,
        position_currency: Currency,
        price_currency: Currency,
    },
}

/// A fully priced pack that has not been committed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackDraft {
    pub as_of: NaiveDate,
    pub policy: PolicyId,
    pub base_currency: Currency,
    pub content_hash: ContentHash,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    policy: ValuationPolicy,
    params: SnapshotParams,
}

impl SnapshotBuilder {
    pub fn new(policy: ValuationPolicy, params: SnapshotParams) -> Self {
        Self { policy, params }
    }

    pub fn policy(&self) -> &ValuationPolicy {
        &self.policy
    }

    /// Prices every position and computes the content hash.
    ///
    /// Identical inputs in any order produce the identical hash. Fails with
    /// [`SnapshotError::DataIncomplete`] listing every missing observation.
    pub fn build(&self, inputs: &SnapshotInputs) -> Result<PackDraft, SnapshotError> {
        let as_of = inputs.as_of.ok_or(SnapshotError::NoAsOfDate)?;
        if inputs.positions.is_empty() {
            return Err(SnapshotError::NoPositions(as_of));
        }

        let holdings = merge_positions(&inputs.positions)?;
        let prices = self.latest_prices(as_of, &inputs.prices);
        let base = &self.policy.base_currency;

        let mut missing = Vec::new();
        let mut positions = Vec::with_capacity(holdings.len());

        for ((portfolio_id, symbol), (currency, quantity)) in &holdings {
            let price = match prices.get(symbol.as_str()) {
                Some(obs) => {
                    if &obs.currency != currency {
                        return Err(SnapshotError::CurrencyMismatch {
                            symbol: symbol.clone(),
                            position_currency: currency.clone(),
                            price_currency: obs.currency.clone(),
                        });
                    }
                    Some(obs.price)
                }
                None => {
                    let gap = MissingInput::Price { symbol: symbol.clone() };
                    if !missing.contains(&gap) {
                        missing.push(gap);
                    }
                    None
                }
            };

            let fx = lookup_fx(&inputs.fx_rates, currency, base, as_of, self.params.fx_lookback_days);
            if fx.is_none() {
                let gap = MissingInput::FxRate {
                    from: currency.clone(),
                    to: base.clone(),
                };
                if !missing.contains(&gap) {
                    missing.push(gap);
                }
            }

            if let (Some(price), Some(fx)) = (price, fx) {
                positions.push(price_position(*portfolio_id, symbol, currency, *quantity, price, fx));
            }
        }

        if !missing.is_empty() {
            debug!(%as_of, policy = %self.policy.id, gaps = missing.len(), "snapshot inputs incomplete");
            return Err(SnapshotError::DataIncomplete { as_of, missing });
        }

        let content_hash = compute_content_hash(as_of, &self.policy.id, base, &positions);
        debug!(%as_of, policy = %self.policy.id, positions = positions.len(), hash = %content_hash, "snapshot built");

        Ok(PackDraft {
            as_of,
            policy: self.policy.id.clone(),
            base_currency: base.clone(),
            content_hash,
            positions,
        })
    }

    // newest observation per symbol inside the lookback window
    fn latest_prices<'a>(&self, as_of: NaiveDate, observations: &'a [PriceObservation]) -> BTreeMap<&'a str, &'a PriceObservation> {
        let earliest = as_of - chrono::Duration::days(i64::from(self.params.price_lookback_days));
        let mut latest: BTreeMap<&str, &PriceObservation> = BTreeMap::new();
        for obs in observations.iter().filter(|o| o.as_of >= earliest && o.as_of <= as_of) {
            match latest.get(obs.symbol.as_str()) {
                Some(current) if current.as_of >= obs.as_of => {}
                _ => {
                    latest.insert(obs.symbol.as_str(), obs);
                }
            }
        }
        latest
    }
}

// same holding reported twice is summed; it must be reported in one currency.
// BTreeMap keys give the canonical order.
fn merge_positions(raw: &[RawPosition]) -> Result<BTreeMap<(PortfolioId, String), (Currency, Decimal)>, SnapshotError> {
    let mut merged: BTreeMap<(PortfolioId, String), (Currency, Decimal)> = BTreeMap::new();
    for p in raw {
        match merged.get_mut(&(p.portfolio_id, p.symbol.clone())) {
            Some((currency, _)) if currency != &p.currency => {
                let (first, second) = if *currency < p.currency {
                    (currency.clone(), p.currency.clone())
                } else {
                    (p.currency.clone(), currency.clone())
                };
                return Err(SnapshotError::HoldingCurrencyConflict {
                    portfolio_id: p.portfolio_id,
                    symbol: p.symbol.clone(),
                    first,
                    second,
                });
            }
            Some((_, qty)) => *qty += p.quantity,
            None => {
                merged.insert((p.portfolio_id, p.symbol.clone()), (p.currency.clone(), p.quantity));
            }
        }
    }
    Ok(merged)
}

// newest rate inside the window; direct pair beats inverse on the same date
fn lookup_fx(rates: &[FxObservation], from: &Currency, to: &Currency, as_of: NaiveDate, lookback_days: u32) -> Option<FxRate> {
    if from == to {
        return Some(FxRate::identity());
    }
    let earliest = as_of - chrono::Duration::days(i64::from(lookback_days));
    rates
        .iter()
        .filter(|r| r.as_of >= earliest && r.as_of <= as_of)
        .filter_map(|r| {
            if &r.from == from && &r.to == to {
                Some((r.as_of, true, r.rate))
            } else if &r.from == to && &r.to == from {
                Some((r.as_of, false, r.rate.inverse()))
            } else {
                None
            }
        })
        // rate value last in the key keeps duplicates independent of feed order
        .max_by_key(|(date, direct, rate)| (*date, *direct, rate.value()))
        .map(|(_, _, rate)| rate)
}

fn price_position(
    portfolio_id: PortfolioId,
    symbol: &str,
    currency: &Currency,
    quantity: Decimal,
    price: Price,
    fx: FxRate,
) -> PositionSnapshot {
    PositionSnapshot {
        // placeholder until the store assigns the real id
        pack_id: PackId(0),
        portfolio_id,
        symbol: symbol.to_string(),
        currency: currency.clone(),
        quantity,
        local_price: price,
        fx_rate: fx,
        value: Amount::new(quantity * price.value() * fx.value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn ccy(code: &str) -> Currency {
        Currency::new(code).unwrap()
    }

    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(
            ValuationPolicy::new(PolicyId::new("WM4PM-CAD"), ccy("CAD")),
            SnapshotParams::default(),
        )
    }

    fn raw(symbol: &str, currency: &str, qty: Decimal) -> RawPosition {
        RawPosition {
            portfolio_id: PortfolioId(1),
            symbol: symbol.to_string(),
            currency: ccy(currency),
            quantity: qty,
        }
    }

    fn price(symbol: &str, currency: &str, day: u32, px: Decimal) -> PriceObservation {
        PriceObservation {
            symbol: symbol.to_string(),
            as_of: d(day),
            currency: ccy(currency),
            price: Price::new_unchecked(px),
        }
    }

    fn fx(from: &str, to: &str, day: u32, rate: Decimal) -> FxObservation {
        FxObservation {
            from: ccy(from),
            to: ccy(to),
            as_of: d(day),
            rate: FxRate::new_unchecked(rate),
        }
    }

    fn inputs() -> SnapshotInputs {
        SnapshotInputs {
            as_of: Some(d(10)),
            positions: vec![raw("AAPL", "USD", dec!(10)), raw("RY", "CAD", dec!(20))],
            prices: vec![price("AAPL", "USD", 10, dec!(100)), price("RY", "CAD", 10, dec!(50))],
            fx_rates: vec![fx("USD", "CAD", 10, dec!(1.30))],
        }
    }

    #[test]
    fn builds_and_values_in_base_currency() {
        let draft = builder().build(&inputs()).unwrap();
        assert_eq!(draft.positions.len(), 2);

        let aapl = draft.positions.iter().find(|p| p.symbol == "AAPL").unwrap();
        assert_eq!(aapl.value.value(), dec!(1300));
        let ry = draft.positions.iter().find(|p| p.symbol == "RY").unwrap();
        assert_eq!(ry.fx_rate.value(), Decimal::ONE);
        assert_eq!(ry.value.value(), dec!(1000));
    }

    #[test]
    fn input_order_does_not_change_hash() {
        let a = builder().build(&inputs()).unwrap();
        let mut shuffled = inputs();
        shuffled.positions.reverse();
        shuffled.prices.reverse();
        let b = builder().build(&shuffled).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn reports_every_missing_observation() {
        let mut broken = inputs();
        broken.prices.retain(|p| p.symbol != "RY");
        broken.fx_rates.clear();
        broken.positions.push(raw("SAP", "EUR", dec!(1)));

        match builder().build(&broken) {
            Err(SnapshotError::DataIncomplete { missing, .. }) => {
                assert!(missing.contains(&MissingInput::Price { symbol: "RY".into() }));
                assert!(missing.contains(&MissingInput::Price { symbol: "SAP".into() }));
                assert!(missing.contains(&MissingInput::FxRate { from: ccy("USD"), to: ccy("CAD") }));
                assert!(missing.contains(&MissingInput::FxRate { from: ccy("EUR"), to: ccy("CAD") }));
                assert_eq!(missing.len(), 4);
            }
            other => panic!("expected DataIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn inverse_fx_and_lookback() {
        let builder = SnapshotBuilder::new(
            ValuationPolicy::new(PolicyId::new("EOD-CAD"), ccy("CAD")),
            SnapshotParams {
                price_lookback_days: 3,
                ..SnapshotParams::default()
            },
        );
        let inputs = SnapshotInputs {
            as_of: Some(d(10)),
            positions: vec![raw("AAPL", "USD", dec!(2))],
            prices: vec![price("AAPL", "USD", 8, dec!(100)), price("AAPL", "USD", 6, dec!(90))],
            fx_rates: vec![fx("CAD", "USD", 10, dec!(0.8))],
        };
        let draft = builder.build(&inputs).unwrap();
        assert_eq!(draft.positions[0].local_price.value(), dec!(100));
        assert_eq!(draft.positions[0].fx_rate.value(), dec!(1.25));
        assert_eq!(draft.positions[0].value.value(), dec!(250));
    }

    #[test]
    fn fx_carried_over_the_weekend() {
        let carried = SnapshotBuilder::new(
            ValuationPolicy::new(PolicyId::new("EOD-CAD"), ccy("CAD")),
            SnapshotParams {
                price_lookback_days: 3,
                fx_lookback_days: 3,
            },
        );
        // monday 2024-05-13: only friday's price and fx exist
        let monday = SnapshotInputs {
            as_of: Some(d(13)),
            positions: vec![raw("AAPL", "USD", dec!(2))],
            prices: vec![price("AAPL", "USD", 10, dec!(100))],
            fx_rates: vec![
                fx("USD", "CAD", 9, dec!(1.30)),
                fx("CAD", "USD", 10, dec!(0.8)),
                fx("USD", "CAD", 6, dec!(1.40)),
            ],
        };
        let draft = carried.build(&monday).unwrap();
        assert_eq!(draft.positions[0].fx_rate.value(), dec!(1.25));

        let exact = SnapshotBuilder::new(
            ValuationPolicy::new(PolicyId::new("EOD-CAD"), ccy("CAD")),
            SnapshotParams {
                price_lookback_days: 3,
                ..SnapshotParams::default()
            },
        );
        match exact.build(&monday) {
            Err(SnapshotError::DataIncomplete { missing, .. }) => {
                assert_eq!(missing, vec![MissingInput::FxRate { from: ccy("USD"), to: ccy("CAD") }]);
            }
            other => panic!("expected DataIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_fx_rows_resolve_independent_of_order() {
        let mut a = inputs();
        a.fx_rates.push(fx("USD", "CAD", 10, dec!(1.36)));
        let mut b = a.clone();
        b.fx_rates.reverse();
        assert_eq!(builder().build(&a).unwrap().content_hash, builder().build(&b).unwrap().content_hash);
    }

    #[test]
    fn holding_reported_in_two_currencies_is_rejected() {
        let mut mixed = inputs();
        mixed.positions.push(raw("AAPL", "CAD", dec!(5)));
        assert_eq!(
            builder().build(&mixed),
            Err(SnapshotError::HoldingCurrencyConflict {
                portfolio_id: PortfolioId(1),
                symbol: "AAPL".to_string(),
                first: ccy("CAD"),
                second: ccy("USD"),
            })
        );
    }

    #[test]
    fn duplicate_holdings_are_merged() {
        let mut dup = inputs();
        dup.positions.push(raw("AAPL", "USD", dec!(5)));
        let draft = builder().build(&dup).unwrap();
        let aapl = draft.positions.iter().find(|p| p.symbol == "AAPL").unwrap();
        assert_eq!(aapl.quantity, dec!(15));
    }

    #[test]
    fn rejects_currency_mismatch_and_empty() {
        let mut bad = inputs();
        bad.prices[0].currency = ccy("EUR");
        assert!(matches!(builder().build(&bad), Err(SnapshotError::CurrencyMismatch { .. })));

        let empty = SnapshotInputs::new(d(10));
        assert_eq!(builder().build(&empty), Err(SnapshotError::NoPositions(d(10))));
    }
}
