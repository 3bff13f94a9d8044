use std::collections::HashMap;
use parking_lot::Mutex;

/// Named checkpoints where the engine asks whether to simulate a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Before a replayed WAL record is applied during recovery.
    WalReplayRecord,
    /// Before the final flush in `stop()`; firing skips it like a crash would.
    ShutdownFlush,
    /// Before a flush writes its segment files.
    FlushWrite,
}

pub trait FaultInjector: Send + Sync {
    fn should_fail(&self, point: FaultPoint) -> bool;
}

/// Production injector: never fails.
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_fail(&self, _point: FaultPoint) -> bool {
        false
    }
}

/// Deterministic plan for tests: a point fires once it has been passed
/// `after` times, then keeps firing `times` times (`None` = forever).
#[derive(Default)]
pub struct FaultPlan {
    rules: Mutex<HashMap<FaultPoint, Rule>>,
}

struct Rule {
    after: u64,
    times: Option<u64>,
    hits: u64,
    fired: u64,
}

impl FaultPlan {
    pub fn new() -> Self {
        FaultPlan::default()
    }

    pub fn fail_always(self, point: FaultPoint) -> Self {
        self.fail_after(point, 0, None)
    }

    pub fn fail_after(self, point: FaultPoint, after: u64, times: Option<u64>) -> Self {
        self.rules.lock().insert(point, Rule { after, times, hits: 0, fired: 0 });
        self
    }

    pub fn fired(&self, point: FaultPoint) -> u64 {
        self.rules.lock().get(&point).map(|r| r.fired).unwrap_or(0)
    }
}

impl FaultInjector for FaultPlan {
    fn should_fail(&self, point: FaultPoint) -> bool {
        let mut rules = self.rules.lock();
        let Some(rule) = rules.get_mut(&point) else {
            return false;
        };
        rule.hits += 1;
        if rule.hits <= rule.after {
            return false;
        }
        if rule.times.is_some_and(|t| rule.fired >= t) {
            return false;
        }
        rule.fired += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_threshold_for_limited_times() {
        let plan = FaultPlan::new().fail_after(FaultPoint::FlushWrite, 2, Some(1));
        assert!(!plan.should_fail(FaultPoint::FlushWrite));
        assert!(!plan.should_fail(FaultPoint::FlushWrite));
        assert!(plan.should_fail(FaultPoint::FlushWrite));
        assert!(!plan.should_fail(FaultPoint::FlushWrite));
        assert!(!plan.should_fail(FaultPoint::ShutdownFlush));
        assert_eq!(plan.fired(FaultPoint::FlushWrite), 1);
    }
}
