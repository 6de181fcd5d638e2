//! 静态图抓拍：挂起的一次性请求，由下一帧兑现

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use uvcam_core::error::{CameraError, Result};
use uvcam_core::frame::Frame;

use crate::imgcodecs;

/// 抓拍请求的应答句柄
///
/// 成功时返回写出的路径；预览在帧到达前停止时以 `NotPreviewing`/`DeviceGone` 失败。
#[derive(Debug)]
pub struct StillRequest {
    path: PathBuf,
    rx: Receiver<Result<PathBuf>>,
}

impl StillRequest {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 阻塞等待结果
    pub fn wait(self) -> Result<PathBuf> {
        self.rx.recv().map_err(|_| CameraError::SessionTerminated)?
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<PathBuf> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CameraError::timeout("capture_still", timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CameraError::SessionTerminated),
        }
    }

    /// 非阻塞查询，尚未完成时返回 None
    pub fn try_result(&self) -> Option<Result<PathBuf>> {
        self.rx.try_recv().ok()
    }
}

struct PendingStill {
    path: PathBuf,
    reply: Sender<Result<PathBuf>>,
}

/// 单帧抓拍的结果，交给会话转成事件
#[derive(Debug)]
pub(crate) enum StillOutcome {
    Saved(PathBuf),
    Failed { path: PathBuf, reason: String },
}

pub(crate) struct StillCapture {
    quality: u8,
    pending: Mutex<Vec<PendingStill>>,
}

impl StillCapture {
    pub(crate) fn new(quality: u8) -> Self {
        Self {
            quality,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn arm(&self, path: impl Into<PathBuf>) -> StillRequest {
        let path = path.into();
        let (reply, rx) = bounded(1);
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(PendingStill {
                path: path.clone(),
                reply,
            });
        }
        // 锁中毒时 reply 已被丢弃，wait 会得到 SessionTerminated
        StillRequest { path, rx }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.lock().map(|p| !p.is_empty()).unwrap_or(false)
    }

    /// 用这一帧兑现全部挂起的请求
    pub(crate) fn feed(&self, frame: &Frame) -> Vec<StillOutcome> {
        let armed = match self.pending.lock() {
            Ok(mut pending) if !pending.is_empty() => std::mem::take(&mut *pending),
            _ => return Vec::new(),
        };

        armed
            .into_iter()
            .map(|still| match imgcodecs::imwrite(&still.path, frame, self.quality) {
                Ok(()) => {
                    tracing::info!(target: "uvcam::still", seq = frame.sequence, "still saved: {}", still.path.display());
                    let _ = still.reply.send(Ok(still.path.clone()));
                    StillOutcome::Saved(still.path)
                }
                Err(e) => {
                    tracing::warn!(target: "uvcam::still", "still {} failed: {}", still.path.display(), e);
                    let reason = e.to_string();
                    let _ = still.reply.send(Err(e));
                    StillOutcome::Failed {
                        path: still.path,
                        reason,
                    }
                }
            })
            .collect()
    }

    /// 预览停止：所有挂起请求以同一错误失败
    pub(crate) fn cancel_all(&self, err: impl Fn() -> CameraError) -> usize {
        let armed = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return 0,
        };
        let n = armed.len();
        for still in armed {
            let _ = still.reply.send(Err(err()));
        }
        if n > 0 {
            tracing::debug!(target: "uvcam::still", "{} pending stills cancelled", n);
        }
        n
    }
}

impl std::fmt::Debug for StillCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("StillCapture")
            .field("quality", &self.quality)
            .field("pending", &pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvcam_core::frame::{PooledBuffer, Timestamp};
    use uvcam_core::pixel_format::FourCC;

    fn yuyv_frame() -> Frame {
        Frame::new(
            3,
            Timestamp {
                hw_raw_ns: 0,
                arrival: Duration::ZERO,
            },
            4,
            4,
            FourCC::YUYV.into(),
            PooledBuffer::unpooled([90u8, 128].repeat(16)),
        )
    }

    #[test]
    fn next_frame_fulfils_all_pending() {
        let dir = tempfile::tempdir().unwrap();
        let stills = StillCapture::new(90);
        let a = stills.arm(dir.path().join("a.jpg"));
        let b = stills.arm(dir.path().join("b.png"));
        assert!(stills.has_pending());

        let outcomes = stills.feed(&yuyv_frame());
        assert_eq!(outcomes.len(), 2);
        assert!(!stills.has_pending());

        let a = a.wait().unwrap();
        let b = b.wait().unwrap();
        assert!(std::fs::metadata(a).unwrap().len() > 0);
        assert!(std::fs::metadata(b).unwrap().len() > 0);

        // 已兑现的请求不会被之后的帧再次写入
        assert!(stills.feed(&yuyv_frame()).is_empty());
    }

    #[test]
    fn cancel_fails_pending_requests() {
        let stills = StillCapture::new(90);
        let req = stills.arm("/tmp/never.jpg");
        assert_eq!(stills.cancel_all(|| CameraError::NotPreviewing), 1);
        assert!(matches!(req.wait(), Err(CameraError::NotPreviewing)));
    }

    #[test]
    fn unknown_extension_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stills = StillCapture::new(90);
        let req = stills.arm(dir.path().join("still.unknownext"));
        let outcomes = stills.feed(&yuyv_frame());
        assert!(matches!(outcomes[0], StillOutcome::Failed { .. }));
        assert!(matches!(req.wait(), Err(CameraError::Encode(_))));
    }
}
