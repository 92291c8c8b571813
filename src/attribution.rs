// 5.0 attribution.rs: splits a base-currency return into local, fx and interaction parts.
// (1 + total) = (1 + local)(1 + fx), so total = local + fx + local*fx.
// every result is checked against an independent recomputation from base prices; any gap
// beyond tolerance stops the computation. nothing gets rounded away to make it pass.

use crate::pack::{PackStatus, PositionSnapshot, PricingPack};
use crate::types::{Bps, PackId, PolicyId, PortfolioId};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionParams {
    /// Maximum gap between the decomposed and the independently computed total.
    pub tolerance_bps: Decimal,
}

impl Default for AttributionParams {
    fn default() -> Self {
        Self {
            tolerance_bps: dec!(0.1),
        }
    }
}

// 5.1: the four components of one return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnComponents {
    pub local: Decimal,
    pub fx: Decimal,
    pub interaction: Decimal,
    pub total: Decimal,
}

impl ReturnComponents {
    /// total - (local + fx + interaction). Zero up to decimal precision.
    pub fn identity_residual(&self) -> Decimal {
        self.total - (self.local + self.fx + self.interaction)
    }
}

pub fn decompose(local: Decimal, fx: Decimal) -> ReturnComponents {
    ReturnComponents {
        local,
        fx,
        interaction: local * fx,
        total: (Decimal::ONE + local) * (Decimal::ONE + fx) - Decimal::ONE,
    }
}

/// Components from raw prices and rates: local = p1/p0 - 1, fx = r1/r0 - 1.
pub fn decompose_prices(p0: Decimal, p1: Decimal, r0: Decimal, r1: Decimal) -> ReturnComponents {
    decompose(p1 / p0 - Decimal::ONE, r1 / r0 - Decimal::ONE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionResult {
    pub pack_id: PackId,
    pub prior_pack_id: PackId,
    pub portfolio_id: PortfolioId,
    pub symbol: String,
    /// prior-period base-currency weight within the portfolio
    pub weight: Decimal,
    pub local_return: Decimal,
    pub fx_return: Decimal,
    pub interaction_return: Decimal,
    pub total_return: Decimal,
    pub validation_error_bps: Bps,
}

impl AttributionResult {
    pub fn components(&self) -> ReturnComponents {
        ReturnComponents {
            local: self.local_return,
            fx: self.fx_return,
            interaction: self.interaction_return,
            total: self.total_return,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedSide {
    PriorOnly,
    CurrentOnly,
}

/// A holding that exists in only one of the two packs. Excluded from weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedPosition {
    pub symbol: String,
    pub side: UnmatchedSide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioAttribution {
    pub pack_id: PackId,
    pub prior_pack_id: PackId,
    pub portfolio_id: PortfolioId,
    pub as_of: NaiveDate,
    pub prior_as_of: NaiveDate,
    pub local_return: Decimal,
    pub fx_return: Decimal,
    pub interaction_return: Decimal,
    pub total_return: Decimal,
    pub validation_error_bps: Bps,
    pub positions: Vec<AttributionResult>,
    pub unmatched: Vec<UnmatchedPosition>,
}

impl PortfolioAttribution {
    pub fn components(&self) -> ReturnComponents {
        ReturnComponents {
            local: self.local_return,
            fx: self.fx_return,
            interaction: self.interaction_return,
            total: self.total_return,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Attribution identity violated for {portfolio_id}{}: decomposed {computed} vs independent {independent}, gap {error_bps} > {tolerance_bps}",
    .symbol.as_deref().map(|s| format!("/{s}")).unwrap_or_default()
)]
pub struct AttributionIdentityError {
    pub pack_id: PackId,
    pub portfolio_id: PortfolioId,
    /// None when the portfolio aggregate failed
    pub symbol: Option<String>,
    pub computed: Decimal,
    pub independent: Decimal,
    pub error_bps: Bps,
    pub tolerance_bps: Bps,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributionError {
    #[error(transparent)]
    Identity(#[from] AttributionIdentityError),

    #[error("Pack {pack_id} is {status}, attribution needs ready packs")]
    PackNotReady { pack_id: PackId, status: PackStatus },

    #[error("Packs belong to different policies: {prior} vs {current}")]
    PolicyMismatch { prior: PolicyId, current: PolicyId },

    #[error("Prior pack dated {prior_as_of} is not earlier than {current_as_of}")]
    NotChronological { prior_as_of: NaiveDate, current_as_of: NaiveDate },

    #[error("Portfolio {0} has no position held in both packs")]
    NoMatchedPositions(PortfolioId),

    #[error("Portfolio {0} prior value is zero, weights undefined")]
    ZeroPriorValue(PortfolioId),
}

#[derive(Debug, Clone, Default)]
pub struct CurrencyAttributionEngine {
    params: AttributionParams,
}

impl CurrencyAttributionEngine {
    pub fn new(params: AttributionParams) -> Self {
        Self { params }
    }

    pub fn tolerance(&self) -> Bps {
        Bps::new(self.params.tolerance_bps)
    }

    /// Attribution for one portfolio between two ready packs of the same policy.
    ///
    /// Positions are matched by symbol. Weights are prior-period base values. The portfolio
    /// total is recomputed as `Σ q0·p1·r1 / Σ q0·p0·r0 − 1` and must agree with the weighted
    /// sum of position totals within tolerance.
    pub fn attribute_portfolio(
        &self,
        prior: &PricingPack,
        current: &PricingPack,
        portfolio_id: PortfolioId,
    ) -> Result<PortfolioAttribution, AttributionError> {
        check_pair(prior, current)?;

        let prior_rows: BTreeMap<&str, &PositionSnapshot> =
            prior.positions_for(portfolio_id).map(|p| (p.symbol.as_str(), p)).collect();
        let current_rows: BTreeMap<&str, &PositionSnapshot> =
            current.positions_for(portfolio_id).map(|p| (p.symbol.as_str(), p)).collect();

        let mut unmatched = Vec::new();
        let mut matched = Vec::new();
        for (symbol, p0) in &prior_rows {
            match current_rows.get(symbol) {
                Some(p1) => matched.push((*p0, *p1)),
                None => unmatched.push(UnmatchedPosition {
                    symbol: symbol.to_string(),
                    side: UnmatchedSide::PriorOnly,
                }),
            }
        }
        for symbol in current_rows.keys().filter(|s| !prior_rows.contains_key(*s)) {
            unmatched.push(UnmatchedPosition {
                symbol: symbol.to_string(),
                side: UnmatchedSide::CurrentOnly,
            });
        }

        if matched.is_empty() {
            return Err(AttributionError::NoMatchedPositions(portfolio_id));
        }
        if !unmatched.is_empty() {
            debug!(portfolio = %portfolio_id, count = unmatched.len(), "unmatched positions excluded from attribution");
        }

        // prior base value per matched position, q0·p0·r0
        let prior_value: Decimal = matched.iter().map(|(p0, _)| p0.value.value()).sum();
        if prior_value.is_zero() {
            return Err(AttributionError::ZeroPriorValue(portfolio_id));
        }
        // Σ q0·p1·r1, held quantity valued at current prices
        let carried_value: Decimal = matched
            .iter()
            .map(|(p0, p1)| p0.quantity * p1.base_price())
            .sum();

        let mut positions = Vec::with_capacity(matched.len());
        let mut agg = ReturnComponents {
            local: Decimal::ZERO,
            fx: Decimal::ZERO,
            interaction: Decimal::ZERO,
            total: Decimal::ZERO,
        };

        for (p0, p1) in matched {
            let weight = p0.value.value() / prior_value;
            let result = self.attribute_position(prior.id, current.id, p0, p1, weight)?;
            agg.local += weight * result.local_return;
            agg.fx += weight * result.fx_return;
            agg.interaction += weight * result.interaction_return;
            agg.total += weight * result.total_return;
            positions.push(result);
        }

        let independent = carried_value / prior_value - Decimal::ONE;
        let error_bps = self.check(current.id, portfolio_id, None, agg.total, independent)?;
        self.check(
            current.id,
            portfolio_id,
            None,
            agg.local + agg.fx + agg.interaction,
            agg.total,
        )?;

        info!(
            portfolio = %portfolio_id,
            prior = %prior.id,
            current = %current.id,
            total = %agg.total,
            local = %agg.local,
            fx = %agg.fx,
            %error_bps,
            "attribution computed"
        );

        Ok(PortfolioAttribution {
            pack_id: current.id,
            prior_pack_id: prior.id,
            portfolio_id,
            as_of: current.as_of,
            prior_as_of: prior.as_of,
            local_return: agg.local,
            fx_return: agg.fx,
            interaction_return: agg.interaction,
            total_return: agg.total,
            validation_error_bps: error_bps,
            positions,
            unmatched,
        })
    }

    /// Every portfolio that appears in the current pack, in id order.
    pub fn attribute_all(
        &self,
        prior: &PricingPack,
        current: &PricingPack,
    ) -> Result<Vec<PortfolioAttribution>, AttributionError> {
        current
            .portfolio_ids()
            .into_iter()
            .map(|pf| self.attribute_portfolio(prior, current, pf))
            .collect()
    }

    fn attribute_position(
        &self,
        prior_pack: PackId,
        current_pack: PackId,
        p0: &PositionSnapshot,
        p1: &PositionSnapshot,
        weight: Decimal,
    ) -> Result<AttributionResult, AttributionIdentityError> {
        let c = decompose_prices(
            p0.local_price.value(),
            p1.local_price.value(),
            p0.fx_rate.value(),
            p1.fx_rate.value(),
        );
        let independent = p1.base_price() / p0.base_price() - Decimal::ONE;
        let symbol = Some(p1.symbol.clone());

        let error_bps = self.check(current_pack, p1.portfolio_id, symbol.clone(), c.total, independent)?;
        self.check(current_pack, p1.portfolio_id, symbol, c.local + c.fx + c.interaction, c.total)?;

        Ok(AttributionResult {
            pack_id: current_pack,
            prior_pack_id: prior_pack,
            portfolio_id: p1.portfolio_id,
            symbol: p1.symbol.clone(),
            weight,
            local_return: c.local,
            fx_return: c.fx,
            interaction_return: c.interaction,
            total_return: c.total,
            validation_error_bps: error_bps,
        })
    }

    fn check(
        &self,
        pack_id: PackId,
        portfolio_id: PortfolioId,
        symbol: Option<String>,
        computed: Decimal,
        independent: Decimal,
    ) -> Result<Bps, AttributionIdentityError> {
        let error_bps = Bps::from_fraction(computed - independent).abs();
        let tolerance_bps = self.tolerance();
        if error_bps > tolerance_bps {
            warn!(pack = %pack_id, portfolio = %portfolio_id, ?symbol, %computed, %independent, %error_bps, "attribution identity violated");
            return Err(AttributionIdentityError {
                pack_id,
                portfolio_id,
                symbol,
                computed,
                independent,
                error_bps,
                tolerance_bps,
            });
        }
        Ok(error_bps)
    }
}

fn check_pair(prior: &PricingPack, current: &PricingPack) -> Result<(), AttributionError> {
    for pack in [prior, current] {
        if pack.status != PackStatus::Ready {
            return Err(AttributionError::PackNotReady {
                pack_id: pack.id,
                status: pack.status,
            });
        }
    }
    if prior.policy != current.policy {
        return Err(AttributionError::PolicyMismatch {
            prior: prior.policy.clone(),
            current: current.policy.clone(),
        });
    }
    if prior.as_of >= current.as_of {
        return Err(AttributionError::NotChronological {
            prior_as_of: prior.as_of,
            current_as_of: current.as_of,
        });
    }
    Ok(())
}
