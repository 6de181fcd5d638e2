//! 传输管线：传输泵 (tokio 任务) -> 帧队列 -> 投递线程 -> 录像/抓拍/Sink
//!
//! 两端都不修改会话状态，故障以内部命令的形式回报给 worker。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use tokio::task::JoinHandle;

use uvcam_core::builder::SessionConfig;
use uvcam_core::error::{CameraError, Result};
use uvcam_core::frame::{Frame, FramePool, Timestamp};
use uvcam_core::telemetry::StreamTelemetry;
use uvcam_core::time::monotonic_now;
use uvcam_core::traits::Stream;

use crate::internal::runtime;
use crate::session::events::SessionEvent;
use crate::session::queue::{Command, SessionCommandQueue};
use crate::session::SessionShared;
use crate::sink::{FrameQueue, FrameSink};
use crate::still::StillOutcome;

/// 投递线程空闲时检查停止标志的间隔
const DELIVERY_POLL: Duration = Duration::from_millis(20);

/// 两个 Arc 是否指向同一个 Sink
pub(crate) fn same_sink(a: &Arc<dyn FrameSink>, b: &Arc<dyn FrameSink>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// 把每一帧依次交给录像、抓拍，最后移交给 Sink
pub(crate) struct FrameRouter {
    shared: Arc<SessionShared>,
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
    faults: SessionCommandQueue,
}

impl FrameRouter {
    pub(crate) fn new(shared: Arc<SessionShared>, faults: SessionCommandQueue) -> Self {
        Self {
            shared,
            sink: RwLock::new(None),
            faults,
        }
    }

    pub(crate) fn bind(&self, sink: Arc<dyn FrameSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    pub(crate) fn unbind(&self) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = None;
        }
    }

    pub(crate) fn is_bound_to(&self, sink: &Arc<dyn FrameSink>) -> bool {
        self.sink
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| same_sink(s, sink)))
            .unwrap_or(false)
    }

    pub(crate) fn dispatch(&self, frame: Frame) {
        if let Err(e) = self.shared.recorder.feed(&frame) {
            tracing::error!(target: "uvcam::recording", "encoder failed: {}", e);
            self.faults.post(Command::RecordingFault {
                reason: e.to_string(),
            });
        }

        for outcome in self.shared.stills.feed(&frame) {
            self.shared.events.emit(match outcome {
                StillOutcome::Saved(path) => SessionEvent::StillSaved(path),
                StillOutcome::Failed { path, reason } => SessionEvent::StillFailed { path, reason },
            });
        }

        self.shared.telemetry.record_delivered();

        // 先 clone 出来，避免在 Sink 回调期间持有读锁
        let sink = self.sink.read().ok().and_then(|slot| slot.clone());
        if let Some(sink) = sink {
            sink.on_frame(frame);
        }
    }
}

/// 一次预览对应的一条管线
pub(crate) struct Pipeline {
    generation: u64,
    running: Arc<AtomicBool>,
    frames: Arc<FrameQueue>,
    pump: Option<JoinHandle<Box<dyn Stream>>>,
    delivery: Option<thread::JoinHandle<()>>,
}

impl Pipeline {
    /// 启动传输并开始投递
    pub(crate) fn start(
        session_id: u64,
        mut stream: Box<dyn Stream>,
        router: Arc<FrameRouter>,
        telemetry: Arc<StreamTelemetry>,
        config: &SessionConfig,
        generation: u64,
        faults: SessionCommandQueue,
    ) -> Result<Self> {
        stream.set_frame_timeout(config.frame_timeout);
        runtime::block_on_timeout("start_preview", config.open_timeout, stream.start())?;

        let running = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(FrameQueue::new(config.frame_queue_depth));

        let delivery = {
            let running = running.clone();
            let frames = frames.clone();
            thread::Builder::new()
                .name(format!("uvcam-deliver-{}", session_id))
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        if let Some(frame) = frames.pop_timeout(DELIVERY_POLL) {
                            router.dispatch(frame);
                        }
                    }
                })
        };
        let delivery = match delivery {
            Ok(handle) => handle,
            Err(e) => {
                let _ = runtime::block_on_timeout("stop_preview", config.open_timeout, stream.stop());
                return Err(CameraError::Io(e));
            }
        };

        // 池子比队列稍大：队列满时 Sink 手里通常还拿着一两帧
        let pool = FramePool::new(config.frame_queue_depth + 2);
        let pump = runtime::get_runtime().spawn(pump(
            stream,
            PumpContext {
                frames: frames.clone(),
                pool,
                running: running.clone(),
                telemetry,
                frame_timeout: config.frame_timeout,
                generation,
                faults,
            },
        ));

        tracing::debug!(target: "uvcam::pipeline", session = session_id, generation, "pipeline started");
        Ok(Self {
            generation,
            running,
            frames,
            pump: Some(pump),
            delivery: Some(delivery),
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// 停止传输与投递，取回已停止的 Stream
    ///
    /// 泵在 `limit` 内没有退出时被强制中止，此时 Stream 随任务一起丢弃。
    pub(crate) fn stop(mut self, limit: Duration) -> Option<Box<dyn Stream>> {
        self.running.store(false, Ordering::Release);

        let stream = self.pump.take().and_then(|task| {
            let abort = task.abort_handle();
            match runtime::block_on(async { tokio::time::timeout(limit, task).await }) {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    tracing::error!(target: "uvcam::pipeline", "transfer pump failed: {}", e);
                    None
                }
                Err(_) => {
                    tracing::warn!(target: "uvcam::pipeline", "transfer pump did not stop within {:?}, aborting", limit);
                    abort.abort();
                    None
                }
            }
        });

        if let Some(delivery) = self.delivery.take() {
            if delivery.join().is_err() {
                tracing::error!(target: "uvcam::pipeline", "delivery thread panicked");
            }
        }
        self.frames.clear();

        let mut stream = stream?;
        if let Err(e) = runtime::block_on_timeout("stop_preview", limit, stream.stop()) {
            tracing::warn!(target: "uvcam::pipeline", "stream stop failed: {}", e);
        }
        tracing::debug!(target: "uvcam::pipeline", generation = self.generation, "pipeline stopped");
        Some(stream)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.pump.take() {
            task.abort();
        }
    }
}

struct PumpContext {
    frames: Arc<FrameQueue>,
    pool: FramePool,
    running: Arc<AtomicBool>,
    telemetry: Arc<StreamTelemetry>,
    frame_timeout: Duration,
    generation: u64,
    faults: SessionCommandQueue,
}

/// 传输泵：拷出每一帧放进帧队列，遇到传输错误即退出并回报
async fn pump(mut stream: Box<dyn Stream>, ctx: PumpContext) -> Box<dyn Stream> {
    while ctx.running.load(Ordering::Acquire) {
        match tokio::time::timeout(ctx.frame_timeout, stream.next_frame()).await {
            Ok(Ok(raw)) => {
                let timestamp = Timestamp {
                    hw_raw_ns: raw.hw_timestamp_ns,
                    arrival: monotonic_now(),
                };
                // 借用的驱动缓冲区在这里拷进池化缓冲区
                let frame = Frame::new(
                    raw.sequence,
                    timestamp,
                    raw.width,
                    raw.height,
                    raw.format,
                    ctx.pool.fill(raw.data),
                );
                for _ in 0..ctx.frames.push(frame) {
                    ctx.telemetry.record_dropped();
                }
            }
            // 驱动侧的取帧超时 (V4L2 DQBUF) 与外层超时同样处理
            Ok(Err(e)) if e.is_timeout() => {
                ctx.telemetry.record_timeout();
                tracing::debug!(target: "uvcam::pipeline", "no frame within {:?}: {}", ctx.frame_timeout, e);
            }
            Ok(Err(e)) => {
                ctx.telemetry.record_error();
                if ctx.running.load(Ordering::Acquire) {
                    tracing::error!(target: "uvcam::pipeline", generation = ctx.generation, "transfer failed: {}", e);
                    ctx.faults.post(Command::TransferFault {
                        generation: ctx.generation,
                        error: e,
                    });
                }
                break;
            }
            Err(_) => {
                ctx.telemetry.record_timeout();
                tracing::debug!(target: "uvcam::pipeline", "no frame within {:?}", ctx.frame_timeout);
            }
        }
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_identity_is_by_pointer() {
        let a: Arc<dyn FrameSink> = Arc::new(|_f: Frame| {});
        let b: Arc<dyn FrameSink> = Arc::new(|_f: Frame| {});
        assert!(same_sink(&a, &a.clone()));
        assert!(!same_sink(&a, &b));
    }
}
