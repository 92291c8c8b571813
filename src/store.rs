// 2.2x store.rs: append-only pack rows. packs are never deleted and never edited in place;
// a lifecycle transition swaps in a fresh Arc so anyone holding the old one keeps exactly
// what they read. supersession is a pointer field on both ends of the chain.
// 2.3 BuildLocks is the advisory lock that keeps one build in flight per (date, policy).

use crate::pack::{ContentHash, PackStatus, PricingPack};
use crate::snapshot::PackDraft;
use crate::types::{PackId, PolicyId, Timestamp};
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

pub type BuildKey = (NaiveDate, PolicyId);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Pack {0} not found")]
    PackNotFound(PackId),

    #[error("Pack {id} cannot move from {from} to {to}")]
    InvalidTransition { id: PackId, from: PackStatus, to: PackStatus },

    #[error("A build for {policy} on {as_of} is already in flight")]
    BuildInProgress { as_of: NaiveDate, policy: PolicyId },

    #[error("Supersede chain through pack {0} is invalid")]
    InvalidChain(PackId),
}

/// What committing a draft did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Brand new pack for this key.
    Created(PackId),
    /// Same content as an existing non-error pack; nothing written.
    Reused(PackId),
    /// New pack that replaces the previous head of the chain.
    Superseded { new: PackId, old: PackId },
}

impl CommitOutcome {
    pub fn pack_id(&self) -> PackId {
        match self {
            CommitOutcome::Created(id) | CommitOutcome::Reused(id) => *id,
            CommitOutcome::Superseded { new, .. } => *new,
        }
    }

    pub fn is_new(&self) -> bool {
        !matches!(self, CommitOutcome::Reused(_))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    packs: BTreeMap<PackId, Arc<PricingPack>>,
    by_key: HashMap<BuildKey, Vec<PackId>>,
    next_id: u64,
}

impl StoreInner {
    fn head(&self, key: &BuildKey) -> Option<&Arc<PricingPack>> {
        self.by_key
            .get(key)
            .and_then(|ids| ids.last())
            .and_then(|id| self.packs.get(id))
    }
}

#[derive(Debug)]
pub struct PackStore {
    inner: RwLock<StoreInner>,
    locks: BuildLocks,
}

impl PackStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                next_id: 1,
                ..StoreInner::default()
            }),
            locks: BuildLocks::default(),
        }
    }

    pub fn locks(&self) -> &BuildLocks {
        &self.locks
    }

    /// Commits a draft as a Warming pack, or returns the existing pack if the content matches.
    ///
    /// Differing content for the same (date, policy) creates a new pack whose `supersedes`
    /// points at the previous head; the previous head only gets its `superseded_by` pointer
    /// set and loses freshness.
    pub fn commit_draft(&self, draft: PackDraft, now: Timestamp) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let key = (draft.as_of, draft.policy.clone());

        let previous = inner.head(&key).cloned();
        if let Some(prev) = &previous {
            if prev.content_hash == draft.content_hash && prev.status != PackStatus::Error {
                debug!(pack = %prev.id, hash = %prev.content_hash, "identical content, reusing pack");
                return Ok(CommitOutcome::Reused(prev.id));
            }
        }

        let id = PackId(inner.next_id);
        inner.next_id += 1;

        let mut positions = draft.positions;
        for p in &mut positions {
            p.pack_id = id;
        }

        let pack = PricingPack {
            id,
            as_of: draft.as_of,
            policy: draft.policy,
            base_currency: draft.base_currency,
            content_hash: draft.content_hash,
            supersedes: previous.as_ref().map(|p| p.id),
            superseded_by: None,
            status: PackStatus::Warming,
            is_fresh: false,
            reconciliation_error: None,
            ledger_commit: None,
            created_at: now,
            positions,
        };

        validate_chain(&inner.packs, &pack)?;

        if let Some(prev) = &previous {
            let mut replaced = (**prev).clone();
            replaced.superseded_by = Some(id);
            replaced.is_fresh = false;
            inner.packs.insert(prev.id, Arc::new(replaced));
        }

        info!(pack = %id, as_of = %pack.as_of, policy = %pack.policy, hash = %pack.content_hash, supersedes = ?pack.supersedes, "pack committed as warming");
        inner.packs.insert(id, Arc::new(pack));
        inner.by_key.entry(key).or_default().push(id);

        Ok(match previous {
            Some(prev) => CommitOutcome::Superseded { new: id, old: prev.id },
            None => CommitOutcome::Created(id),
        })
    }

    /// Warming -> Ready. The pack becomes fresh unless something already superseded it.
    pub fn mark_ready(
        &self,
        id: PackId,
        reconciliation_error: Option<Decimal>,
        ledger_commit: Option<String>,
    ) -> Result<Arc<PricingPack>, StoreError> {
        self.transition(id, PackStatus::Ready, |pack| {
            pack.reconciliation_error = reconciliation_error;
            pack.ledger_commit = ledger_commit;
            pack.is_fresh = pack.superseded_by.is_none();
        })
    }

    /// Warming -> Error. Never fresh again.
    pub fn mark_error(&self, id: PackId, reconciliation_error: Option<Decimal>) -> Result<Arc<PricingPack>, StoreError> {
        self.transition(id, PackStatus::Error, |pack| {
            pack.reconciliation_error = reconciliation_error;
            pack.is_fresh = false;
        })
    }

    fn transition(
        &self,
        id: PackId,
        to: PackStatus,
        apply: impl FnOnce(&mut PricingPack),
    ) -> Result<Arc<PricingPack>, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let current = inner.packs.get(&id).ok_or(StoreError::PackNotFound(id))?;
        if !current.status.can_transition_to(to) {
            warn!(pack = %id, from = %current.status, to = %to, "rejected pack transition");
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        let mut next = (**current).clone();
        next.status = to;
        apply(&mut next);
        let next = Arc::new(next);
        inner.packs.insert(id, Arc::clone(&next));
        info!(pack = %id, status = %to, "pack status changed");
        Ok(next)
    }

    pub fn get(&self, id: PackId) -> Option<Arc<PricingPack>> {
        self.read().packs.get(&id).cloned()
    }

    pub fn content_hash(&self, id: PackId) -> Option<ContentHash> {
        self.get(id).map(|p| p.content_hash.clone())
    }

    /// Head of the chain for the newest as-of date under this policy.
    pub fn latest(&self, policy: &PolicyId) -> Option<Arc<PricingPack>> {
        let inner = self.read();
        inner
            .by_key
            .keys()
            .filter(|(_, p)| p == policy)
            .max_by_key(|(date, _)| *date)
            .and_then(|key| inner.head(key).cloned())
    }

    /// Newest fresh Ready pack under this policy, whatever its date.
    pub fn last_known_good(&self, policy: &PolicyId) -> Option<Arc<PricingPack>> {
        self.read()
            .packs
            .values()
            .filter(|p| &p.policy == policy && p.is_ready() && p.is_fresh)
            .max_by_key(|p| (p.as_of, p.id))
            .cloned()
    }

    /// Every pack ever committed for one key, oldest first.
    pub fn versions(&self, as_of: NaiveDate, policy: &PolicyId) -> Vec<Arc<PricingPack>> {
        let inner = self.read();
        inner
            .by_key
            .get(&(as_of, policy.clone()))
            .map(|ids| ids.iter().filter_map(|id| inner.packs.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Fresh Ready packs in date order, one per as-of date, inside `[from, to]`.
    pub fn ready_chain(&self, policy: &PolicyId, from: NaiveDate, to: NaiveDate) -> Vec<Arc<PricingPack>> {
        let mut chain: Vec<Arc<PricingPack>> = self
            .read()
            .packs
            .values()
            .filter(|p| &p.policy == policy && p.is_ready() && p.is_fresh)
            .filter(|p| p.as_of >= from && p.as_of <= to)
            .cloned()
            .collect();
        chain.sort_by_key(|p| p.as_of);
        chain
    }

    /// Walks `supersedes` back to the root. Starts with `id` itself.
    pub fn lineage(&self, id: PackId) -> Result<Vec<PackId>, StoreError> {
        let inner = self.read();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Err(StoreError::InvalidChain(current));
            }
            let pack = inner.packs.get(&current).ok_or(StoreError::PackNotFound(current))?;
            chain.push(current);
            cursor = pack.supersedes;
        }
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.read().packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PackStore {
    fn default() -> Self {
        Self::new()
    }
}

// 2.4: a new pack may only point at an existing, older, un-superseded pack with the same key.
// walking back must terminate without revisiting anything.
fn validate_chain(packs: &BTreeMap<PackId, Arc<PricingPack>>, candidate: &PricingPack) -> Result<(), StoreError> {
    let Some(prev_id) = candidate.supersedes else {
        return Ok(());
    };
    let prev = packs.get(&prev_id).ok_or(StoreError::PackNotFound(prev_id))?;
    if prev_id >= candidate.id
        || prev.superseded_by.is_some()
        || prev.as_of != candidate.as_of
        || prev.policy != candidate.policy
    {
        return Err(StoreError::InvalidChain(candidate.id));
    }

    let mut seen = HashSet::from([candidate.id]);
    let mut cursor = Some(prev_id);
    while let Some(current) = cursor {
        if !seen.insert(current) {
            return Err(StoreError::InvalidChain(current));
        }
        cursor = packs.get(&current).and_then(|p| p.supersedes);
    }
    Ok(())
}

/// Advisory lock table: at most one in-flight build per (date, policy).
#[derive(Debug, Default)]
pub struct BuildLocks {
    held: DashMap<BuildKey, Timestamp>,
}

impl BuildLocks {
    /// Takes the lock or reports the build already running. Never blocks.
    pub fn try_acquire(&self, as_of: NaiveDate, policy: &PolicyId, now: Timestamp) -> Result<BuildLease<'_>, StoreError> {
        let key = (as_of, policy.clone());
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(%as_of, %policy, "build lock busy");
                Err(StoreError::BuildInProgress {
                    as_of,
                    policy: policy.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(BuildLease { locks: self, key })
            }
        }
    }

    pub fn is_held(&self, as_of: NaiveDate, policy: &PolicyId) -> bool {
        self.held.contains_key(&(as_of, policy.clone()))
    }
}

/// Releases the build lock on drop.
#[derive(Debug)]
pub struct BuildLease<'a> {
    locks: &'a BuildLocks,
    key: BuildKey,
}

impl Drop for BuildLease<'_> {
    fn drop(&mut self) {
        self.locks.held.remove(&self.key);
    }
}

/// Marks a Warming pack as Error if the job holding it goes away before finishing.
/// Call [`WarmingGuard::disarm`] once the pack reached a terminal status.
#[derive(Debug)]
pub struct WarmingGuard<'a> {
    store: &'a PackStore,
    id: PackId,
    armed: bool,
}

impl<'a> WarmingGuard<'a> {
    pub fn new(store: &'a PackStore, id: PackId) -> Self {
        Self { store, id, armed: true }
    }

    pub fn pack_id(&self) -> PackId {
        self.id
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WarmingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let still_warming = self
            .store
            .get(self.id)
            .map(|p| p.status == PackStatus::Warming)
            .unwrap_or(false);
        if still_warming {
            warn!(pack = %self.id, "build abandoned while warming, marking error");
            let _ = self.store.mark_error(self.id, None);
        }
    }
}
