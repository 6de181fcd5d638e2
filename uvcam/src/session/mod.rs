//! UVC 会话：状态机 + 串行命令队列
//!
//! 每个会话有一个专属 worker 线程，持有设备句柄并按提交顺序逐条执行命令；
//! 同步方法只是提交命令后等待应答。状态、统计与控件缓存可以不经队列直接读取。

mod events;
mod pipeline;
mod queue;
mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use uvcam_core::builder::SessionConfig;
use uvcam_core::controls::{ControlId, ControlRange};
use uvcam_core::device::{DeviceDescriptor, FormatDescriptor};
use uvcam_core::error::{CameraError, Result};
use uvcam_core::pixel_format::PixelFormat;
use uvcam_core::telemetry::{StreamStats, StreamTelemetry};
use uvcam_core::traits::Driver;

use crate::enumerator::DeviceObserver;
use crate::permission::AccessGrant;
use crate::recording::{RecordingController, RecordingStatus};
use crate::sink::FrameSink;
use crate::still::{StillCapture, StillRequest};

pub use events::{ObserverId, SessionEvent, SessionObserver};
pub use queue::Pending;

use events::EventHub;
use queue::{Command, SessionCommandQueue};
use worker::Worker;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Opening,
    /// 已 claim 并完成格式协商，传输未启动
    Opened,
    Previewing,
    Recording,
    Closing,
    /// 不可恢复的硬件故障，只接受 close
    Error,
}

impl SessionState {
    /// 是否允许从 `from` 直接迁移到 `to`
    pub fn can_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        match (from, to) {
            (_, Error) => from != Error,
            (Closed, Opening) => true,
            (Opening, Opened | Closed) => true,
            (Opened, Previewing | Closing) => true,
            (Previewing, Recording | Opened | Closing) => true,
            (Recording, Previewing | Closing) => true,
            (Closing, Closed) => true,
            (Error, Closing) => true,
            _ => false,
        }
    }

    /// 设备已 claim
    pub fn is_open(self) -> bool {
        matches!(self, Self::Opened | Self::Previewing | Self::Recording)
    }

    /// 帧正在流动
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Previewing | Self::Recording)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// 在设备广播的描述符中按顺序找第一个完全匹配的，不做替代
pub fn negotiate(
    formats: &[FormatDescriptor],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<FormatDescriptor> {
    formats
        .iter()
        .find(|f| f.matches(width, height, format))
        .cloned()
        .ok_or(CameraError::UnsupportedFormat {
            width,
            height,
            format,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlEntry {
    pub(crate) range: ControlRange,
    pub(crate) current: i32,
}

/// worker、投递线程与调用方共享的会话数据
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) id: u64,
    state: RwLock<SessionState>,
    device: RwLock<Option<DeviceDescriptor>>,
    format: RwLock<Option<FormatDescriptor>>,
    formats: RwLock<Vec<FormatDescriptor>>,
    controls: RwLock<BTreeMap<ControlId, ControlEntry>>,
    fault: RwLock<Option<String>>,
    gone: AtomicBool,
    pub(crate) telemetry: Arc<StreamTelemetry>,
    pub(crate) events: EventHub,
    pub(crate) recorder: RecordingController,
    pub(crate) stills: StillCapture,
}

impl SessionShared {
    fn new(id: u64, config: &SessionConfig) -> Self {
        Self {
            id,
            state: RwLock::new(SessionState::Closed),
            device: RwLock::new(None),
            format: RwLock::new(None),
            formats: RwLock::new(Vec::new()),
            controls: RwLock::new(BTreeMap::new()),
            fault: RwLock::new(None),
            gone: AtomicBool::new(false),
            telemetry: Arc::new(StreamTelemetry::new()),
            events: EventHub::default(),
            recorder: RecordingController::new(config.encoder, config.jpeg_quality),
            stills: StillCapture::new(config.jpeg_quality),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(SessionState::Error)
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
    }

    pub(crate) fn device_path(&self) -> Option<String> {
        self.device
            .read()
            .ok()
            .and_then(|d| d.as_ref().map(|d| d.path.clone()))
    }

    fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.device.read().ok().and_then(|d| d.clone())
    }

    fn current_format(&self) -> Option<FormatDescriptor> {
        self.format.read().ok().and_then(|f| f.clone())
    }

    pub(crate) fn formats(&self) -> Vec<FormatDescriptor> {
        self.formats.read().map(|f| f.clone()).unwrap_or_default()
    }

    pub(crate) fn control_entry(&self, id: ControlId) -> Option<ControlEntry> {
        self.controls.read().ok().and_then(|c| c.get(&id).copied())
    }

    pub(crate) fn update_control(&self, id: ControlId, value: i32) {
        if let Ok(mut controls) = self.controls.write() {
            if let Some(entry) = controls.get_mut(&id) {
                entry.current = value;
            }
        }
    }

    fn publish_device(
        &self,
        descriptor: DeviceDescriptor,
        format: FormatDescriptor,
        formats: Vec<FormatDescriptor>,
        controls: BTreeMap<ControlId, ControlEntry>,
    ) {
        if let Ok(mut d) = self.device.write() {
            *d = Some(descriptor);
        }
        if let Ok(mut f) = self.format.write() {
            *f = Some(format);
        }
        if let Ok(mut f) = self.formats.write() {
            *f = formats;
        }
        if let Ok(mut c) = self.controls.write() {
            *c = controls;
        }
    }

    fn clear_device(&self) {
        self.publish_device_none();
        self.clear_gone();
        if let Ok(mut fault) = self.fault.write() {
            *fault = None;
        }
    }

    fn publish_device_none(&self) {
        if let Ok(mut d) = self.device.write() {
            *d = None;
        }
        if let Ok(mut f) = self.format.write() {
            *f = None;
        }
        if let Ok(mut f) = self.formats.write() {
            f.clear();
        }
        if let Ok(mut c) = self.controls.write() {
            c.clear();
        }
    }

    pub(crate) fn fault(&self) -> Option<String> {
        self.fault.read().ok().and_then(|f| f.clone())
    }

    fn set_fault(&self, reason: String) {
        if let Ok(mut fault) = self.fault.write() {
            *fault = Some(reason);
        }
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    fn clear_gone(&self) {
        self.gone.store(false, Ordering::Release);
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 一台摄像头的会话
///
/// ```no_run
/// # use std::sync::Arc;
/// # use uvcam::prelude::*;
/// # fn demo(driver: Arc<dyn Driver>, grant: AccessGrant) -> Result<()> {
/// let session = UvcSession::new(driver, SessionConfig::new().resolution(1280, 720))?;
/// session.open(grant)?;
/// let (sink, frames) = ChannelSink::new(4, std::time::Duration::from_millis(10));
/// session.start_preview(sink)?;
/// let frame = frames.recv().unwrap();
/// println!("{}x{} #{}", frame.width, frame.height, frame.sequence);
/// session.close()?;
/// # Ok(())
/// # }
/// ```
pub struct UvcSession {
    id: u64,
    config: SessionConfig,
    queue: SessionCommandQueue,
    shared: Arc<SessionShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl UvcSession {
    /// 创建会话并启动其 worker；配置在会话生命期内固定
    pub fn new(driver: Arc<dyn Driver>, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared::new(id, &config));
        let (queue, rx) = SessionCommandQueue::new();
        let worker = Worker::new(driver, config.clone(), shared.clone(), queue.clone());

        let handle = thread::Builder::new()
            .name(format!("uvcam-session-{}", id))
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            id,
            config,
            queue,
            shared,
            worker: Some(handle),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // --- 生命周期 ---

    pub fn submit_open(&self, grant: AccessGrant) -> Pending<SessionState> {
        self.queue
            .submit("open", |reply| Command::Open { grant, reply })
    }

    /// claim 设备、协商格式、分配传输缓冲区、缓存控件，成功后处于 Opened
    pub fn open(&self, grant: AccessGrant) -> Result<SessionState> {
        self.submit_open(grant).wait()
    }

    pub fn submit_close(&self) -> Pending<SessionState> {
        self.queue.submit("close", |reply| Command::Close { reply })
    }

    /// 幂等；从任何状态 (包括 Error) 都会回到 Closed
    pub fn close(&self) -> Result<SessionState> {
        self.submit_close().wait()
    }

    // --- 预览 ---

    pub fn submit_start_preview(&self, sink: Arc<dyn FrameSink>) -> Pending<SessionState> {
        self.queue
            .submit("start_preview", |reply| Command::StartPreview { sink, reply })
    }

    /// 启动传输并绑定 Sink
    ///
    /// 已在预览时：同一个 Sink 是空操作，不同的 Sink 替换绑定而不重启传输。
    /// Sink 在投递线程上被调用，不能在回调里同步等待本会话的命令。
    pub fn start_preview(&self, sink: Arc<dyn FrameSink>) -> Result<SessionState> {
        self.submit_start_preview(sink).wait()
    }

    pub fn submit_stop_preview(&self) -> Pending<SessionState> {
        self.queue
            .submit("stop_preview", |reply| Command::StopPreview { reply })
    }

    /// 结束进行中的录像并停止传输，保留 claim；未在预览时是空操作
    pub fn stop_preview(&self) -> Result<SessionState> {
        self.submit_stop_preview().wait()
    }

    // --- 录像与抓拍 ---

    pub fn submit_start_recording(&self, path: impl Into<PathBuf>) -> Pending<SessionState> {
        let path = path.into();
        self.queue
            .submit("start_recording", |reply| Command::StartRecording { path, reply })
    }

    pub fn start_recording(&self, path: impl Into<PathBuf>) -> Result<SessionState> {
        self.submit_start_recording(path).wait()
    }

    pub fn submit_stop_recording(&self) -> Pending<SessionState> {
        self.queue
            .submit("stop_recording", |reply| Command::StopRecording { reply })
    }

    /// 未在录像时是空操作，返回当前状态；录像汇总通过 `RecordingFinished` 事件送达
    pub fn stop_recording(&self) -> Result<SessionState> {
        self.submit_stop_recording().wait()
    }

    /// 用下一帧生成静态图，不打断传输
    pub fn capture_still(&self, path: impl Into<PathBuf>) -> Result<StillRequest> {
        let path = path.into();
        self.queue
            .submit("capture_still", |reply| Command::CaptureStill { path, reply })
            .wait()
    }

    // --- 控件 ---

    pub fn get_control(&self, id: ControlId) -> Result<i32> {
        self.queue
            .submit("get_control", |reply| Command::GetControl { id, reply })
            .wait()
    }

    pub fn submit_set_control(&self, id: ControlId, value: i32) -> Pending<i32> {
        self.queue
            .submit("set_control", |reply| Command::SetControl { id, value, reply })
    }

    /// 越界返回 `OutOfRange` 且不改变任何值
    pub fn set_control(&self, id: ControlId, value: i32) -> Result<i32> {
        self.submit_set_control(id, value).wait()
    }

    /// 恢复打开时从硬件读到的默认值并返回它
    pub fn reset_control(&self, id: ControlId) -> Result<i32> {
        self.queue
            .submit("reset_control", |reply| Command::ResetControl { id, reply })
            .wait()
    }

    pub fn check_support(&self, id: ControlId) -> bool {
        self.queue
            .submit("check_support", |reply| Command::CheckSupport { id, reply })
            .wait()
            .unwrap_or(false)
    }

    pub fn control_range(&self, id: ControlId) -> Result<ControlRange> {
        self.queue
            .submit("control_range", |reply| Command::ControlRange { id, reply })
            .wait()
    }

    /// 控件缓存快照 (范围, 当前值)，不经过队列
    pub fn controls(&self) -> Vec<(ControlId, ControlRange, i32)> {
        self.shared
            .controls
            .read()
            .map(|c| c.iter().map(|(id, e)| (*id, e.range, e.current)).collect())
            .unwrap_or_default()
    }

    // --- 查询 ---

    pub fn supported_formats(&self) -> Result<Vec<FormatDescriptor>> {
        self.queue
            .submit("supported_formats", |reply| Command::SupportedFormats { reply })
            .wait()
    }

    pub fn current_format(&self) -> Option<FormatDescriptor> {
        self.shared.current_format()
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.shared.descriptor()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Error 状态的原因
    pub fn fault(&self) -> Option<String> {
        self.shared.fault()
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.telemetry.snapshot()
    }

    pub fn recording_status(&self) -> Option<RecordingStatus> {
        self.shared.recorder.status()
    }

    // --- 事件 ---

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        self.shared.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// 设备被拔出
    ///
    /// 之后出队的命令都以 `DeviceGone` 结束，随后会话收尾到 Closed。
    /// 路径不是本会话的设备时返回 false。
    pub fn device_detached(&self, path: &str) -> bool {
        if self.shared.device_path().as_deref() != Some(path) {
            return false;
        }
        self.shared.gone.store(true, Ordering::Release);
        self.queue.post(Command::Detached {
            path: path.to_string(),
        })
    }
}

impl DeviceObserver for UvcSession {
    fn on_attach(&self, _device: &DeviceDescriptor) {}

    fn on_detach(&self, device: &DeviceDescriptor) {
        self.device_detached(device.key());
    }
}

impl std::fmt::Debug for UvcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UvcSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("device", &self.shared.device_path())
            .finish()
    }
}

impl Drop for UvcSession {
    fn drop(&mut self) {
        self.queue.post(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            // 观察者回调里释放最后一个引用时不能 join 自己
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::error!(target: "uvcam::session", session = self.id, "session worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvcam_core::pixel_format::FourCC;

    #[test]
    fn transitions_follow_the_lifecycle() {
        use SessionState::*;
        assert!(SessionState::can_transition(Closed, Opening));
        assert!(SessionState::can_transition(Previewing, Recording));
        assert!(SessionState::can_transition(Recording, Previewing));
        assert!(SessionState::can_transition(Recording, Error));
        assert!(SessionState::can_transition(Error, Closing));

        assert!(!SessionState::can_transition(Closed, Previewing));
        assert!(!SessionState::can_transition(Opened, Recording));
        assert!(!SessionState::can_transition(Recording, Opened));
        assert!(!SessionState::can_transition(Error, Opened));
        assert!(!SessionState::can_transition(Error, Error));
    }

    #[test]
    fn negotiation_picks_first_exact_match() {
        let formats = vec![
            FormatDescriptor::new(1280, 720, FourCC::YUYV).with_frame_rates(&[10]),
            FormatDescriptor::new(1280, 720, FourCC::MJPEG).with_frame_rates(&[30]),
            FormatDescriptor::new(1280, 720, FourCC::MJPEG).with_frame_rates(&[60]),
        ];
        let chosen = negotiate(&formats, 1280, 720, FourCC::MJPEG.into()).unwrap();
        assert_eq!(chosen.frame_rates, vec![30]);

        assert!(matches!(
            negotiate(&formats, 1920, 1080, FourCC::MJPEG.into()),
            Err(CameraError::UnsupportedFormat {
                width: 1920,
                height: 1080,
                ..
            })
        ));
    }
}
