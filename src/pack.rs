// 2.0: the pricing pack. one immutable snapshot of valuation inputs for one as-of date under
// one valuation policy. once a pack is Ready its content never changes; corrections arrive as
// a new pack that points back at the one it replaces.

use crate::types::{Amount, Currency, FxRate, PackId, PolicyId, PortfolioId, Price, Timestamp};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// How a pack is valued: which policy key it belongs to and which currency it reports in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationPolicy {
    pub id: PolicyId,
    pub base_currency: Currency,
}

impl ValuationPolicy {
    pub fn new(id: PolicyId, base_currency: Currency) -> Self {
        Self { id, base_currency }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackStatus {
    Warming,
    Ready,
    Error,
}

impl PackStatus {
    // warming -> ready | error. nothing else.
    pub fn can_transition_to(&self, next: PackStatus) -> bool {
        matches!(
            (self, next),
            (PackStatus::Warming, PackStatus::Ready) | (PackStatus::Warming, PackStatus::Error)
        )
    }
}

impl fmt::Display for PackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PackStatus::Warming => "warming",
            PackStatus::Ready => "ready",
            PackStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// 2.1: hex sha-256 over the canonical pack content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One holding as valued inside a pack. Owned by exactly one pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub pack_id: PackId,
    pub portfolio_id: PortfolioId,
    pub symbol: String,
    pub currency: Currency,
    pub quantity: Decimal,
    pub local_price: Price,
    /// local currency -> pack base currency
    pub fx_rate: FxRate,
    pub value: Amount,
}

impl PositionSnapshot {
    pub fn local_value(&self) -> Decimal {
        self.quantity * self.local_price.value()
    }

    pub fn base_price(&self) -> Decimal {
        self.local_price.value() * self.fx_rate.value()
    }
}

/// The handle the freshness gate hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRef {
    pub id: PackId,
    pub as_of: NaiveDate,
    pub content_hash: ContentHash,
    pub status: PackStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingPack {
    pub id: PackId,
    pub as_of: NaiveDate,
    pub policy: PolicyId,
    pub base_currency: Currency,
    pub content_hash: ContentHash,
    pub supersedes: Option<PackId>,
    pub superseded_by: Option<PackId>,
    pub status: PackStatus,
    pub is_fresh: bool,
    /// signed (pack - ledger) / ledger, set by reconciliation
    pub reconciliation_error: Option<Decimal>,
    pub ledger_commit: Option<String>,
    pub created_at: Timestamp,
    pub positions: Vec<PositionSnapshot>,
}

impl PricingPack {
    pub fn reference(&self) -> PackRef {
        PackRef {
            id: self.id,
            as_of: self.as_of,
            content_hash: self.content_hash.clone(),
            status: self.status,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == PackStatus::Ready
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    pub fn nav(&self) -> Amount {
        self.positions.iter().map(|p| p.value).sum()
    }

    pub fn portfolio_nav(&self, portfolio_id: PortfolioId) -> Amount {
        self.positions_for(portfolio_id).map(|p| p.value).sum()
    }

    pub fn positions_for(&self, portfolio_id: PortfolioId) -> impl Iterator<Item = &PositionSnapshot> {
        self.positions.iter().filter(move |p| p.portfolio_id == portfolio_id)
    }

    pub fn portfolio_ids(&self) -> BTreeSet<PortfolioId> {
        self.positions.iter().map(|p| p.portfolio_id).collect()
    }

    pub fn position(&self, portfolio_id: PortfolioId, symbol: &str) -> Option<&PositionSnapshot> {
        self.positions
            .iter()
            .find(|p| p.portfolio_id == portfolio_id && p.symbol == symbol)
    }

    // recomputes the hash from the rows we hold. a ready pack must always agree with itself.
    pub fn verify_content_hash(&self) -> bool {
        compute_content_hash(self.as_of, &self.policy, &self.base_currency, &self.positions)
            == self.content_hash
    }
}

// 2.2: canonical content hash. covers everything that defines the valuation and nothing
// about lifecycle (status, freshness, ids, timestamps). callers must pass positions in
// canonical (portfolio, symbol) order; the snapshot builder guarantees that.
// sha256 over canonical json: object keys sorted, decimals normalized so 1.50 and 1.5 agree.
pub fn compute_content_hash(
    as_of: NaiveDate,
    policy: &PolicyId,
    base_currency: &Currency,
    positions: &[PositionSnapshot],
) -> ContentHash {
    let rows: Vec<Value> = positions
        .iter()
        .map(|p| {
            json!({
                "portfolio_id": p.portfolio_id.0,
                "symbol": p.symbol,
                "currency": p.currency.as_str(),
                "quantity": p.quantity.normalize().to_string(),
                "local_price": p.local_price.value().normalize().to_string(),
                "fx_rate": p.fx_rate.value().normalize().to_string(),
                "value": p.value.value().normalize().to_string(),
            })
        })
        .collect();
    let canonical = json!({
        "version": "pricing_pack_v2",
        "as_of": as_of.to_string(),
        "policy": policy.as_str(),
        "base_currency": base_currency.as_str(),
        "positions": rows,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    ContentHash(hex::encode(hasher.finalize()))
}
