use std::sync::OnceLock;
use std::time::{Duration, Instant};

// 进程内单调时间锚点，OnceLock 保证只初始化一次且线程安全
static PROCESS_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// 将 Instant 转换为相对进程锚点的 Duration
pub fn since_anchor(t: Instant) -> Duration {
    let anchor = PROCESS_ANCHOR.get_or_init(Instant::now);

    // t 早于锚点时饱和为 0
    t.saturating_duration_since(*anchor)
}

pub fn monotonic_now() -> Duration {
    since_anchor(Instant::now())
}

/// 帧率计量器：滑动窗口内的帧间隔平均
#[derive(Debug)]
pub struct FpsMeter {
    window: usize,
    stamps: std::collections::VecDeque<Instant>,
}

impl FpsMeter {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2), // 至少两帧才有间隔
            stamps: std::collections::VecDeque::with_capacity(window),
        }
    }

    pub fn tick(&mut self, at: Instant) {
        if self.stamps.len() >= self.window {
            self.stamps.pop_front();
        }
        self.stamps.push_back(at);
    }

    pub fn fps(&self) -> f64 {
        match (self.stamps.front(), self.stamps.back()) {
            (Some(first), Some(last)) if self.stamps.len() >= 2 => {
                let secs = last.duration_since(*first).as_secs_f64();
                if secs > 0.0 {
                    (self.stamps.len() - 1) as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}
