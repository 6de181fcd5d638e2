use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::time::FpsMeter;

/// 流统计快照
///
/// 这些数据不随每一帧推送，而是由 UI 层定期查询 (如 "frame rate: 30 fps")。
#[derive(Clone, Default, PartialEq)]
pub struct StreamStats {
    /// 已投递给 FrameSink 的帧数
    pub frames_delivered: u64,

    /// 丢帧计数 (帧队列溢出，最旧帧被丢弃)
    pub frames_dropped: u64,

    /// 传输层错误计数
    pub transfer_errors: u64,

    /// 单帧等待超时计数
    pub transfer_timeouts: u64,

    /// 投递端测得的帧率
    pub fps: f64,
}

impl fmt::Debug for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStats")
            .field("delivered", &self.frames_delivered)
            .field("dropped", &self.frames_dropped)
            .field("errors", &self.transfer_errors)
            .field("timeouts", &self.transfer_timeouts)
            .field("fps", &format_args!("{:.1}", self.fps))
            .finish()
    }
}

/// 传输管线与投递线程共享的计数器
#[derive(Debug)]
pub struct StreamTelemetry {
    delivered: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    fps: Mutex<FpsMeter>,
}

impl Default for StreamTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTelemetry {
    pub fn new() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            fps: Mutex::new(FpsMeter::new(30)),
        }
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut meter) = self.fps.lock() {
            meter.tick(Instant::now());
        }
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// 新一轮预览开始时清零帧率窗口，计数保留
    pub fn restart_rate(&self) {
        if let Ok(mut meter) = self.fps.lock() {
            meter.reset();
        }
    }

    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            transfer_errors: self.errors.load(Ordering::Relaxed),
            transfer_timeouts: self.timeouts.load(Ordering::Relaxed),
            fps: self.fps.lock().map(|m| m.fps()).unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let telemetry = StreamTelemetry::new();
        telemetry.record_delivered();
        telemetry.record_delivered();
        telemetry.record_dropped();
        telemetry.record_timeout();

        let stats = telemetry.snapshot();
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.transfer_errors, 0);
        assert_eq!(stats.transfer_timeouts, 1);
    }
}
