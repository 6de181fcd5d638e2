use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use uvcam_core::controls::{ControlId, ControlRange};
use uvcam_core::device::FormatDescriptor;
use uvcam_core::error::{CameraError, Result};

use crate::permission::AccessGrant;
use crate::session::SessionState;
use crate::sink::FrameSink;
use crate::still::StillRequest;

pub(crate) type Reply<T> = Sender<Result<T>>;

/// 会话 worker 执行的命令
///
/// 前半部分来自调用方，后半部分是传输管线与热插拔回报的内部事件。
pub(crate) enum Command {
    Open {
        grant: AccessGrant,
        reply: Reply<SessionState>,
    },
    Close {
        reply: Reply<SessionState>,
    },
    StartPreview {
        sink: Arc<dyn FrameSink>,
        reply: Reply<SessionState>,
    },
    StopPreview {
        reply: Reply<SessionState>,
    },
    StartRecording {
        path: PathBuf,
        reply: Reply<SessionState>,
    },
    StopRecording {
        reply: Reply<SessionState>,
    },
    CaptureStill {
        path: PathBuf,
        reply: Reply<StillRequest>,
    },
    GetControl {
        id: ControlId,
        reply: Reply<i32>,
    },
    SetControl {
        id: ControlId,
        value: i32,
        reply: Reply<i32>,
    },
    ResetControl {
        id: ControlId,
        reply: Reply<i32>,
    },
    CheckSupport {
        id: ControlId,
        reply: Reply<bool>,
    },
    ControlRange {
        id: ControlId,
        reply: Reply<ControlRange>,
    },
    SupportedFormats {
        reply: Reply<Vec<FormatDescriptor>>,
    },

    /// 设备被拔出
    Detached { path: String },
    /// 传输泵遇到错误后退出
    TransferFault { generation: u64, error: CameraError },
    /// 录像编码失败
    RecordingFault { reason: String },
    Shutdown,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::StartPreview { .. } => "start_preview",
            Self::StopPreview { .. } => "stop_preview",
            Self::StartRecording { .. } => "start_recording",
            Self::StopRecording { .. } => "stop_recording",
            Self::CaptureStill { .. } => "capture_still",
            Self::GetControl { .. } => "get_control",
            Self::SetControl { .. } => "set_control",
            Self::ResetControl { .. } => "reset_control",
            Self::CheckSupport { .. } => "check_support",
            Self::ControlRange { .. } => "control_range",
            Self::SupportedFormats { .. } => "supported_formats",
            Self::Detached { .. } => "detached",
            Self::TransferFault { .. } => "transfer_fault",
            Self::RecordingFault { .. } => "recording_fault",
            Self::Shutdown => "shutdown",
        }
    }
}

/// 命令执行结果的句柄
///
/// worker 退出而命令未被执行时，等待结果得到 `SessionTerminated`。
#[derive(Debug)]
pub struct Pending<T> {
    operation: &'static str,
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| CameraError::SessionTerminated)?
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CameraError::timeout(self.operation, timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CameraError::SessionTerminated),
        }
    }

    /// 非阻塞查询，尚未完成时返回 None
    pub fn try_result(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

/// 会话命令队列：多生产者，单个 worker 按提交顺序逐条执行
#[derive(Debug, Clone)]
pub(crate) struct SessionCommandQueue {
    tx: Sender<Command>,
}

impl SessionCommandQueue {
    pub(crate) fn new() -> (Self, Receiver<Command>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn submit<T>(
        &self,
        operation: &'static str,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Pending<T> {
        let (reply, rx) = bounded(1);
        if self.tx.send(make(reply)).is_err() {
            tracing::debug!(target: "uvcam::session", "{} submitted after worker exit", operation);
        }
        Pending { operation, rx }
    }

    /// 内部事件，不需要应答
    pub(crate) fn post(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_reply_reports_terminated() {
        let (queue, rx) = SessionCommandQueue::new();
        let pending = queue.submit("stop_preview", |reply| Command::StopPreview { reply });
        drop(rx.recv().unwrap());
        assert!(matches!(pending.wait(), Err(CameraError::SessionTerminated)));
    }

    #[test]
    fn commands_arrive_in_submission_order() {
        let (queue, rx) = SessionCommandQueue::new();
        let _a = queue.submit("stop_preview", |reply| Command::StopPreview { reply });
        let _b = queue.submit("stop_recording", |reply| Command::StopRecording { reply });
        queue.post(Command::Shutdown);

        let names: Vec<_> = rx.try_iter().map(|c| c.name()).collect();
        assert_eq!(names, ["stop_preview", "stop_recording", "shutdown"]);
    }

    #[test]
    fn wait_timeout_is_io_timeout() {
        let (queue, _rx) = SessionCommandQueue::new();
        let pending = queue.submit("close", |reply| Command::Close { reply });
        let err = pending.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
    }
}
