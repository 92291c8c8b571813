// 3.0 gate.rs: the freshness gate. single place readers ask "what pack do I use".
// with require_fresh a warming or failed pack is never handed out: warming gets a retry
// hint, a failed pack falls back to the last known-good one and says so.

use crate::pack::{PackRef, PackStatus, PricingPack};
use crate::store::PackStore;
use crate::types::{PackId, PolicyId, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParams {
    /// Typical build+reconcile duration, used for the estimated-ready hint.
    pub expected_build_ms: i64,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            expected_build_ms: 15 * 60 * 1000,
        }
    }
}

/// How much trust the caller can put in the pack it got back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Staleness {
    /// Latest pack for the policy, ready and reconciled.
    Fresh,
    /// Latest pack failed; this is the last known-good one.
    Degraded { failed_pack: PackId },
    /// Caller opted out of freshness; this pack is not ready.
    BestEffort { status: PackStatus },
}

#[derive(Debug, Clone)]
pub struct LatestPack {
    pub pack: Arc<PricingPack>,
    pub staleness: Staleness,
}

impl LatestPack {
    pub fn reference(&self) -> PackRef {
        self.pack.reference()
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.staleness, Staleness::Degraded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("Pack {pack_id} for {as_of} is still warming, expected ready around {estimated_ready_at}")]
    PackWarming {
        pack_id: PackId,
        as_of: NaiveDate,
        estimated_ready_at: Timestamp,
    },

    #[error("No pack exists for policy {0}")]
    NoPack(PolicyId),

    #[error("Latest pack {failed_pack} for policy {policy} failed and no ready pack exists")]
    NoReadyPack { policy: PolicyId, failed_pack: PackId },
}

#[derive(Debug, Clone)]
pub struct FreshnessGate {
    store: Arc<PackStore>,
    params: GateParams,
}

impl FreshnessGate {
    pub fn new(store: Arc<PackStore>, params: GateParams) -> Self {
        Self { store, params }
    }

    /// Latest pack for a policy.
    ///
    /// With `require_fresh`, only Ready packs come back: a Warming head is rejected with
    /// [`GateError::PackWarming`], an Error head falls back to the last known-good pack
    /// tagged [`Staleness::Degraded`]. Without it, the head is returned whatever its status.
    pub fn get_latest(&self, policy: &PolicyId, require_fresh: bool) -> Result<LatestPack, GateError> {
        let head = self
            .store
            .latest(policy)
            .ok_or_else(|| GateError::NoPack(policy.clone()))?;

        match head.status {
            PackStatus::Ready => Ok(LatestPack {
                pack: head,
                staleness: Staleness::Fresh,
            }),
            status if !require_fresh => {
                debug!(pack = %head.id, %status, "serving non-ready pack on best-effort read");
                Ok(LatestPack {
                    pack: head,
                    staleness: Staleness::BestEffort { status },
                })
            }
            PackStatus::Warming => {
                let estimated_ready_at = head.created_at.plus_millis(self.params.expected_build_ms);
                debug!(pack = %head.id, %estimated_ready_at, "fresh read rejected, pack warming");
                Err(GateError::PackWarming {
                    pack_id: head.id,
                    as_of: head.as_of,
                    estimated_ready_at,
                })
            }
            PackStatus::Error => match self.store.last_known_good(policy) {
                Some(good) => {
                    warn!(failed = %head.id, serving = %good.id, "latest pack failed, serving last known-good");
                    Ok(LatestPack {
                        pack: good,
                        staleness: Staleness::Degraded { failed_pack: head.id },
                    })
                }
                None => Err(GateError::NoReadyPack {
                    policy: policy.clone(),
                    failed_pack: head.id,
                }),
            },
        }
    }
}
