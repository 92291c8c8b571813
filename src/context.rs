// 10.0 context.rs: explicit request context and the injected clock.
// every Spine call takes the context by reference; nothing reads ambient globals.

use crate::types::{PackId, TenantId, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Who is asking, for which date, pinned to which pack. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub as_of: NaiveDate,
    pub pack_id: Option<PackId>,
    pub tenant: TenantId,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(as_of: NaiveDate, tenant: TenantId, request_id: impl Into<String>) -> Self {
        Self {
            as_of,
            pack_id: None,
            tenant,
            request_id: request_id.into(),
        }
    }

    /// Same request, pinned to a specific pack.
    #[must_use]
    pub fn with_pack(&self, pack_id: PackId) -> Self {
        Self {
            pack_id: Some(pack_id),
            ..self.clone()
        }
    }

    /// Same request, different as-of date.
    #[must_use]
    pub fn for_date(&self, as_of: NaiveDate) -> Self {
        Self {
            as_of,
            ..self.clone()
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req={} tenant={} as_of={}", self.request_id, self.tenant.0, self.as_of)?;
        if let Some(pack) = self.pack_id {
            write!(f, " pack={pack}")?;
        }
        Ok(())
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to. Used by tests and the simulator.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) -> Timestamp {
        Timestamp::from_millis(self.millis.fetch_add(ms, Ordering::SeqCst) + ms)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        assert_eq!(clock.now(), Timestamp::from_millis(1_000));
        assert_eq!(clock.advance(500), Timestamp::from_millis(1_500));
        assert_eq!(clock.now(), Timestamp::from_millis(1_500));
        clock.set(Timestamp::from_millis(10));
        assert_eq!(clock.now(), Timestamp::from_millis(10));
    }

    #[test]
    fn context_is_copied_not_mutated() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let ctx = RequestContext::new(date, TenantId(7), "r-1");
        let pinned = ctx.with_pack(PackId(3));
        assert_eq!(ctx.pack_id, None);
        assert_eq!(pinned.pack_id, Some(PackId(3)));
        assert_eq!(pinned.to_string(), "req=r-1 tenant=7 as_of=2024-05-01 pack=pack-3");
    }
}
