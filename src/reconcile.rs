// 4.0 reconcile.rs: the ledger gate. a pack only becomes Ready if its NAV agrees with the
// independently maintained ledger to within tolerance (1 bp by default).
// error = (pack_nav - ledger_nav) / ledger_nav, reported signed, checked on |bps|.
// a failure carries a per-position diff so whoever investigates starts with the culprit.

use crate::pack::PricingPack;
use crate::types::{Amount, Bps, PackId, PortfolioId};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationParams {
    /// Maximum accepted |error| in basis points. Inclusive.
    pub tolerance_bps: Decimal,
}

impl Default for ReconciliationParams {
    fn default() -> Self {
        Self {
            tolerance_bps: dec!(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPosition {
    pub portfolio_id: PortfolioId,
    pub symbol: String,
    /// base currency
    pub value: Amount,
}

/// The ledger's own valuation for a date, identified by the commit it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerValuation {
    pub as_of: NaiveDate,
    pub commit_id: String,
    pub positions: Vec<LedgerPosition>,
}

impl LedgerValuation {
    pub fn new(as_of: NaiveDate, commit_id: impl Into<String>) -> Self {
        Self {
            as_of,
            commit_id: commit_id.into(),
            positions: Vec::new(),
        }
    }

    pub fn with_position(mut self, portfolio_id: PortfolioId, symbol: &str, value: Amount) -> Self {
        self.positions.push(LedgerPosition {
            portfolio_id,
            symbol: symbol.to_string(),
            value,
        });
        self
    }

    pub fn nav(&self) -> Amount {
        self.positions.iter().map(|p| p.value).sum()
    }
}

/// One line of disagreement between pack and ledger. A side is `None` when that
/// side does not hold the position at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDiff {
    pub portfolio_id: PortfolioId,
    pub symbol: String,
    pub pack_value: Option<Amount>,
    pub ledger_value: Option<Amount>,
    /// pack - ledger, missing side counted as zero
    pub difference: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub pack_id: PackId,
    pub as_of: NaiveDate,
    pub ledger_commit: String,
    pub pack_nav: Amount,
    pub ledger_nav: Amount,
    pub error_fraction: Decimal,
    pub error_bps: Bps,
    pub tolerance_bps: Bps,
    pub accepted: bool,
    pub diffs: Vec<PositionDiff>,
}

impl ReconciliationReport {
    /// Biggest absolute position differences first.
    pub fn largest_diffs(&self, n: usize) -> Vec<&PositionDiff> {
        let mut sorted: Vec<&PositionDiff> = self.diffs.iter().collect();
        sorted.sort_by(|a, b| b.difference.abs().cmp(&a.difference.abs()));
        sorted.truncate(n);
        sorted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Reconciliation failed for {}: error {} exceeds tolerance {} ({} position diffs)",
    .report.pack_id, .report.error_bps, .report.tolerance_bps, .report.diffs.len()
)]
pub struct ReconciliationFailed {
    pub report: ReconciliationReport,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Failed(#[from] ReconciliationFailed),

    #[error("Ledger dated {ledger_as_of} cannot reconcile pack {pack_id} dated {pack_as_of}")]
    DateMismatch {
        pack_id: PackId,
        pack_as_of: NaiveDate,
        ledger_as_of: NaiveDate,
    },

    #[error("Ledger NAV is zero but pack {pack_id} NAV is {pack_nav}")]
    ZeroLedgerNav { pack_id: PackId, pack_nav: Amount },
}

impl ReconcileError {
    pub fn pack_id(&self) -> PackId {
        match self {
            ReconcileError::Failed(f) => f.report.pack_id,
            ReconcileError::DateMismatch { pack_id, .. } | ReconcileError::ZeroLedgerNav { pack_id, .. } => *pack_id,
        }
    }

    /// Signed error fraction when one could be computed.
    pub fn error_fraction(&self) -> Option<Decimal> {
        match self {
            ReconcileError::Failed(f) => Some(f.report.error_fraction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    params: ReconciliationParams,
}

impl ReconciliationEngine {
    pub fn new(params: ReconciliationParams) -> Self {
        Self { params }
    }

    pub fn tolerance(&self) -> Bps {
        Bps::new(self.params.tolerance_bps)
    }

    /// Compares pack NAV against ledger NAV. `Ok` only when |error| <= tolerance.
    pub fn reconcile(&self, pack: &PricingPack, ledger: &LedgerValuation) -> Result<ReconciliationReport, ReconcileError> {
        if pack.as_of != ledger.as_of {
            return Err(ReconcileError::DateMismatch {
                pack_id: pack.id,
                pack_as_of: pack.as_of,
                ledger_as_of: ledger.as_of,
            });
        }

        let pack_nav = pack.nav();
        let ledger_nav = ledger.nav();

        let error_fraction = if ledger_nav.is_zero() {
            if !pack_nav.is_zero() {
                warn!(pack = %pack.id, %pack_nav, "ledger nav is zero");
                return Err(ReconcileError::ZeroLedgerNav { pack_id: pack.id, pack_nav });
            }
            Decimal::ZERO
        } else {
            (pack_nav.value() - ledger_nav.value()) / ledger_nav.value()
        };

        let error_bps = Bps::from_fraction(error_fraction);
        let tolerance_bps = self.tolerance();
        let accepted = error_bps.abs() <= tolerance_bps;

        let report = ReconciliationReport {
            pack_id: pack.id,
            as_of: pack.as_of,
            ledger_commit: ledger.commit_id.clone(),
            pack_nav,
            ledger_nav,
            error_fraction,
            error_bps,
            tolerance_bps,
            accepted,
            diffs: position_diffs(pack, ledger),
        };

        if accepted {
            info!(pack = %pack.id, ledger_commit = %ledger.commit_id, %error_bps, "reconciliation passed");
            Ok(report)
        } else {
            warn!(
                pack = %pack.id,
                ledger_commit = %ledger.commit_id,
                %error_bps,
                %tolerance_bps,
                diffs = report.diffs.len(),
                "reconciliation rejected"
            );
            Err(ReconciliationFailed { report }.into())
        }
    }
}

// full outer join on (portfolio, symbol). only lines that disagree are kept.
fn position_diffs(pack: &PricingPack, ledger: &LedgerValuation) -> Vec<PositionDiff> {
    let mut joined: BTreeMap<(PortfolioId, &str), (Option<Amount>, Option<Amount>)> = BTreeMap::new();

    for p in &pack.positions {
        let entry = joined.entry((p.portfolio_id, p.symbol.as_str())).or_default();
        entry.0 = Some(entry.0.unwrap_or_else(Amount::zero).add(p.value));
    }
    for l in &ledger.positions {
        let entry = joined.entry((l.portfolio_id, l.symbol.as_str())).or_default();
        entry.1 = Some(entry.1.unwrap_or_else(Amount::zero).add(l.value));
    }

    joined
        .into_iter()
        .filter_map(|((portfolio_id, symbol), (pack_value, ledger_value))| {
            let difference = pack_value
                .unwrap_or_else(Amount::zero)
                .sub(ledger_value.unwrap_or_else(Amount::zero));
            let one_sided = pack_value.is_none() || ledger_value.is_none();
            (one_sided || !difference.is_zero()).then(|| PositionDiff {
                portfolio_id,
                symbol: symbol.to_string(),
                pack_value,
                ledger_value,
                difference,
            })
        })
        .collect()
}
