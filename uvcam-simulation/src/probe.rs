use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 硬件调用重入探针
///
/// 每个控制面/格式协商调用进入时 `enter`，离开时 guard 被 drop。
/// 同一时刻出现第二个活跃调用即记为一次违规。
#[derive(Debug, Default)]
pub struct ReentrancyProbe {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicU64,
    violations: AtomicU64,
}

impl ReentrancyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if now > 1 {
            self.violations.fetch_add(1, Ordering::SeqCst);
            tracing::error!(target: "uvcam::sim", active = now, "hardware call re-entered");
        }
        ProbeGuard { probe: self }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ProbeGuard<'a> {
    probe: &'a ReentrancyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_entry_is_a_violation() {
        let probe = ReentrancyProbe::new();
        {
            let _a = probe.enter();
            let _b = probe.enter();
        }
        let _c = probe.enter();
        assert_eq!(probe.calls(), 3);
        assert_eq!(probe.violations(), 1);
        assert_eq!(probe.max_concurrency(), 2);
    }
}
