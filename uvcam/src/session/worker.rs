use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;

use uvcam_core::builder::SessionConfig;
use uvcam_core::controls::{ControlId, ControlRange, DeviceControls};
use uvcam_core::device::{DeviceDescriptor, FormatDescriptor};
use uvcam_core::error::{CameraError, Result};
use uvcam_core::traits::{DeviceHandle, Driver, Stream};

use crate::internal::registry::{self, ClaimGuard};
use crate::internal::runtime;
use crate::permission::AccessGrant;
use crate::session::events::SessionEvent;
use crate::session::pipeline::{FrameRouter, Pipeline};
use crate::session::queue::{Command, Reply, SessionCommandQueue};
use crate::session::{negotiate, ControlEntry, SessionShared, SessionState};
use crate::sink::FrameSink;
use crate::still::StillRequest;

/// 已 claim 的设备
struct OpenDevice {
    descriptor: DeviceDescriptor,
    handle: Box<dyn DeviceHandle>,
    controls: DeviceControls,
    /// 已协商好、尚未启动的传输；预览停止后为 None，下次预览时重新分配
    stream: Option<Box<dyn Stream>>,
    format: FormatDescriptor,
    _claim: ClaimGuard,
}

/// 会话 worker：独占设备句柄，逐条执行命令
///
/// 所有硬件调用 (控件读写、格式协商、传输启停) 只发生在这个线程上。
pub(crate) struct Worker {
    driver: Arc<dyn Driver>,
    config: SessionConfig,
    shared: Arc<SessionShared>,
    queue: SessionCommandQueue,
    router: Arc<FrameRouter>,
    device: Option<OpenDevice>,
    pipeline: Option<Pipeline>,
    generation: u64,
}

impl Worker {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        config: SessionConfig,
        shared: Arc<SessionShared>,
        queue: SessionCommandQueue,
    ) -> Self {
        let router = Arc::new(FrameRouter::new(shared.clone(), queue.clone()));
        Self {
            driver,
            config,
            shared,
            queue,
            router,
            device: None,
            pipeline: None,
            generation: 0,
        }
    }

    pub(crate) fn run(mut self, rx: Receiver<Command>) {
        tracing::debug!(target: "uvcam::session", session = self.shared.id, driver = self.driver.name(), "worker started");
        while let Ok(command) = rx.recv() {
            if let Command::Shutdown = command {
                break;
            }
            self.handle(command);
        }
        self.teardown(|| CameraError::SessionTerminated);
        tracing::debug!(target: "uvcam::session", session = self.shared.id, "worker exited");
    }

    fn handle(&mut self, command: Command) {
        let _span = tracing::debug_span!(
            target: "uvcam::session",
            "command",
            session = self.shared.id,
            op = command.name()
        )
        .entered();

        match command {
            Command::Open { grant, reply } => self.respond(reply, |w| w.open(grant)),
            Command::Close { reply } => {
                let _ = reply.send(Ok(self.close()));
            }
            Command::StartPreview { sink, reply } => self.respond(reply, |w| w.start_preview(sink)),
            Command::StopPreview { reply } => self.respond(reply, |w| Ok(w.stop_preview())),
            Command::StartRecording { path, reply } => {
                self.respond(reply, |w| w.start_recording(path))
            }
            Command::StopRecording { reply } => self.respond(reply, |w| Ok(w.stop_recording())),
            Command::CaptureStill { path, reply } => self.respond(reply, |w| w.capture_still(path)),
            Command::GetControl { id, reply } => self.respond(reply, |w| w.get_control(id)),
            Command::SetControl { id, value, reply } => {
                self.respond(reply, |w| w.set_control(id, value))
            }
            Command::ResetControl { id, reply } => self.respond(reply, |w| w.reset_control(id)),
            Command::CheckSupport { id, reply } => self.respond(reply, |w| Ok(w.check_support(id))),
            Command::ControlRange { id, reply } => self.respond(reply, |w| w.control_range(id)),
            Command::SupportedFormats { reply } => self.respond(reply, |w| w.supported_formats()),

            Command::Detached { path } => self.on_detached(&path),
            Command::TransferFault { generation, error } => self.on_transfer_fault(generation, error),
            Command::RecordingFault { reason } => self.on_recording_fault(reason),
            Command::Shutdown => {}
        }
    }

    /// 调用方命令的统一入口：拔出后一律 DeviceGone，Error 状态下一律 Faulted
    fn respond<T>(&mut self, reply: Reply<T>, op: impl FnOnce(&mut Self) -> Result<T>) {
        let result = self.admit().and_then(|()| op(self));
        if let Err(e) = &result {
            tracing::debug!(target: "uvcam::session", "command failed: {}", e);
        }
        // 调用方可能已经放弃等待
        let _ = reply.send(result);
    }

    fn admit(&self) -> Result<()> {
        if self.shared.is_gone() {
            return Err(CameraError::DeviceGone(
                self.shared.device_path().unwrap_or_default(),
            ));
        }
        if self.shared.state() == SessionState::Error {
            return Err(CameraError::Faulted(
                self.shared.fault().unwrap_or_else(|| "unknown fault".into()),
            ));
        }
        Ok(())
    }

    fn transition(&self, to: SessionState) {
        let from = self.shared.state();
        if from == to {
            return;
        }
        if !SessionState::can_transition(from, to) {
            tracing::error!(target: "uvcam::session", session = self.shared.id, "illegal transition {:?} -> {:?}", from, to);
        }
        self.shared.set_state(to);
        tracing::info!(target: "uvcam::session", session = self.shared.id, "{:?} -> {:?}", from, to);
        self.shared
            .events
            .emit(SessionEvent::StateChanged { from, to });
    }

    // --- 生命周期 ---

    fn open(&mut self, grant: AccessGrant) -> Result<SessionState> {
        let state = self.shared.state();
        if state != SessionState::Closed {
            // 同一设备重复 open 视为幂等
            return match &self.device {
                Some(d) if d.descriptor.key() == grant.descriptor().key() => Ok(state),
                _ => Err(CameraError::DeviceBusy),
            };
        }

        let descriptor = grant.descriptor().clone();
        self.transition(SessionState::Opening);

        match self.open_device(&descriptor) {
            Ok((device, formats, cache)) => {
                tracing::info!(
                    target: "uvcam::session",
                    session = self.shared.id,
                    "opened {} at {}x{} {:?}, {} controls",
                    descriptor.name,
                    device.format.width,
                    device.format.height,
                    device.format.format,
                    cache.len()
                );
                self.shared
                    .publish_device(descriptor, device.format.clone(), formats, cache);
                self.device = Some(device);
                self.transition(SessionState::Opened);
                Ok(SessionState::Opened)
            }
            Err(e) => {
                tracing::warn!(target: "uvcam::session", session = self.shared.id, "open {} failed: {}", descriptor.path, e);
                if let CameraError::Io(_) = e {
                    self.shared.set_fault(e.to_string());
                    self.transition(SessionState::Error);
                } else {
                    self.transition(SessionState::Closed);
                }
                Err(e)
            }
        }
    }

    fn open_device(
        &mut self,
        descriptor: &DeviceDescriptor,
    ) -> Result<(OpenDevice, Vec<FormatDescriptor>, BTreeMap<ControlId, ControlEntry>)> {
        let deadline = Instant::now() + self.config.open_timeout;
        let claim = registry::claim(descriptor.key())?;
        let (mut handle, controls) = self.driver.open(descriptor)?;

        match self.prepare(handle.as_mut(), &controls, deadline) {
            Ok((formats, format, stream, cache)) => Ok((
                OpenDevice {
                    descriptor: descriptor.clone(),
                    handle,
                    controls,
                    stream: Some(stream),
                    format,
                    _claim: claim,
                },
                formats,
                cache,
            )),
            Err(e) => {
                if let Err(release) = handle.release() {
                    tracing::debug!(target: "uvcam::session", "release after failed open: {}", release);
                }
                Err(e)
            }
        }
    }

    /// 格式协商、缓冲区分配、控件范围与当前值缓存
    #[allow(clippy::type_complexity)]
    fn prepare(
        &self,
        handle: &mut dyn DeviceHandle,
        controls: &DeviceControls,
        deadline: Instant,
    ) -> Result<(
        Vec<FormatDescriptor>,
        FormatDescriptor,
        Box<dyn Stream>,
        BTreeMap<ControlId, ControlEntry>,
    )> {
        let formats = handle.supported_formats()?;
        let format = negotiate(
            &formats,
            self.config.width,
            self.config.height,
            self.config.mode.pixel_format(),
        )?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CameraError::timeout("open", self.config.open_timeout));
        }
        let stream = runtime::block_on_timeout(
            "open",
            remaining,
            handle.configure(&format, self.config.buffer_count),
        )?;

        let mut cache = BTreeMap::new();
        for id in ControlId::ALL {
            let unit = controls.unit(id);
            let Some(range) = unit.describe(id)? else {
                continue;
            };
            match unit.get(id) {
                Ok(current) => {
                    cache.insert(id, ControlEntry { range, current });
                }
                Err(CameraError::ControlNotSupported(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok((formats, format, stream, cache))
    }

    fn close(&mut self) -> SessionState {
        self.teardown(|| CameraError::NotPreviewing);
        SessionState::Closed
    }

    /// 收尾到 Closed：录像收尾、停止传输、释放 claim、清空缓存
    fn teardown(&mut self, still_err: impl Fn() -> CameraError) {
        if self.shared.state() == SessionState::Closed && self.device.is_none() {
            return;
        }
        self.transition(SessionState::Closing);
        self.stop_transfers(still_err);

        if let Some(mut device) = self.device.take() {
            drop(device.stream.take());
            if let Err(e) = device.handle.release() {
                tracing::warn!(target: "uvcam::session", "release {} failed: {}", device.descriptor.path, e);
            }
        }
        self.shared.clear_device();
        self.transition(SessionState::Closed);
    }

    // --- 预览 ---

    fn start_preview(&mut self, sink: Arc<dyn FrameSink>) -> Result<SessionState> {
        let state = self.shared.state();
        match state {
            SessionState::Previewing | SessionState::Recording => {
                if !self.router.is_bound_to(&sink) {
                    tracing::info!(target: "uvcam::session", session = self.shared.id, "frame sink rebound");
                    self.router.bind(sink);
                }
                return Ok(state);
            }
            SessionState::Opened => {}
            _ => return Err(CameraError::NotOpen),
        }

        let stream = {
            let device = self.device.as_mut().ok_or(CameraError::NotOpen)?;
            match device.stream.take() {
                Some(stream) => Ok(stream),
                None => runtime::block_on_timeout(
                    "start_preview",
                    self.config.open_timeout,
                    device.handle.configure(&device.format, self.config.buffer_count),
                ),
            }
        };
        let stream = stream.map_err(|e| self.fail(e))?;

        self.generation += 1;
        self.router.bind(sink);
        self.shared.telemetry.restart_rate();

        match Pipeline::start(
            self.shared.id,
            stream,
            self.router.clone(),
            self.shared.telemetry.clone(),
            &self.config,
            self.generation,
            self.queue.clone(),
        ) {
            Ok(pipeline) => {
                self.pipeline = Some(pipeline);
                self.transition(SessionState::Previewing);
                Ok(SessionState::Previewing)
            }
            Err(e) => {
                self.router.unbind();
                Err(self.fail(e))
            }
        }
    }

    fn stop_preview(&mut self) -> SessionState {
        match self.shared.state() {
            SessionState::Recording => {
                self.finish_recording();
                self.transition(SessionState::Previewing);
            }
            SessionState::Previewing => {}
            other => return other,
        }
        self.stop_transfers(|| CameraError::NotPreviewing);
        self.transition(SessionState::Opened);
        SessionState::Opened
    }

    /// 停止管线；不改变状态
    fn stop_transfers(&mut self, still_err: impl Fn() -> CameraError) {
        self.finish_recording();
        if let Some(pipeline) = self.pipeline.take() {
            // 停止的 Stream 随之释放，预览缓冲区不跨预览保留
            drop(pipeline.stop(self.config.frame_timeout * 2));
        }
        self.shared.stills.cancel_all(still_err);
        self.router.unbind();
    }

    // --- 录像与抓拍 ---

    fn start_recording(&mut self, path: std::path::PathBuf) -> Result<SessionState> {
        match self.shared.state() {
            SessionState::Previewing => {}
            SessionState::Recording => return Err(CameraError::AlreadyRecording),
            _ => return Err(CameraError::NotPreviewing),
        }
        // 文件错误只影响这次录像，不是硬件故障
        self.shared.recorder.start(path)?;
        self.transition(SessionState::Recording);
        Ok(SessionState::Recording)
    }

    fn stop_recording(&mut self) -> SessionState {
        let state = self.shared.state();
        if state != SessionState::Recording {
            return state;
        }
        self.finish_recording();
        self.transition(SessionState::Previewing);
        SessionState::Previewing
    }

    fn finish_recording(&self) {
        if let Some(summary) = self.shared.recorder.stop() {
            self.shared
                .events
                .emit(SessionEvent::RecordingFinished(summary));
        }
    }

    fn capture_still(&mut self, path: std::path::PathBuf) -> Result<StillRequest> {
        if !self.shared.state().is_streaming() {
            return Err(CameraError::NotPreviewing);
        }
        Ok(self.shared.stills.arm(path))
    }

    // --- 控件 ---

    fn entry(&self, id: ControlId) -> Result<(&OpenDevice, ControlEntry)> {
        let device = self.device.as_ref().ok_or(CameraError::NotOpen)?;
        let entry = self
            .shared
            .control_entry(id)
            .ok_or(CameraError::ControlNotSupported(id))?;
        Ok((device, entry))
    }

    fn get_control(&mut self, id: ControlId) -> Result<i32> {
        let (device, _) = self.entry(id)?;
        let value = device.controls.unit(id).get(id);
        let value = value.map_err(|e| self.fail(e))?;
        self.shared.update_control(id, value);
        Ok(value)
    }

    fn set_control(&mut self, id: ControlId, value: i32) -> Result<i32> {
        let (device, entry) = self.entry(id)?;
        // 越界时缓存与硬件都保持不变
        entry.range.check(id, value)?;
        let written = device.controls.unit(id).set(id, value);
        written.map_err(|e| self.fail(e))?;
        self.shared.update_control(id, value);
        tracing::debug!(target: "uvcam::session", "{} = {}", id.name(), value);
        Ok(value)
    }

    fn reset_control(&mut self, id: ControlId) -> Result<i32> {
        let (device, entry) = self.entry(id)?;
        let default = entry.range.default;
        let written = device.controls.unit(id).set(id, default);
        written.map_err(|e| self.fail(e))?;
        self.shared.update_control(id, default);
        Ok(default)
    }

    fn check_support(&self, id: ControlId) -> bool {
        self.device.is_some() && self.shared.control_entry(id).is_some()
    }

    fn control_range(&self, id: ControlId) -> Result<ControlRange> {
        self.entry(id).map(|(_, entry)| entry.range)
    }

    fn supported_formats(&self) -> Result<Vec<FormatDescriptor>> {
        if self.device.is_none() {
            return Err(CameraError::NotOpen);
        }
        Ok(self.shared.formats())
    }

    // --- 故障 ---

    /// 硬件错误改变会话状态后原样返回给触发它的命令
    fn fail(&mut self, e: CameraError) -> CameraError {
        match &e {
            CameraError::DeviceGone(path) => {
                let path = path.clone();
                self.teardown(move || CameraError::DeviceGone(path.clone()));
            }
            CameraError::Io(_) => self.enter_error(e.to_string()),
            _ => {}
        }
        e
    }

    fn enter_error(&mut self, reason: String) {
        tracing::error!(target: "uvcam::session", session = self.shared.id, "session faulted: {}", reason);
        let still_reason = reason.clone();
        self.stop_transfers(move || CameraError::Faulted(still_reason.clone()));
        self.shared.set_fault(reason);
        self.transition(SessionState::Error);
    }

    fn on_detached(&mut self, path: &str) {
        let ours = self
            .device
            .as_ref()
            .map(|d| d.descriptor.key() == path)
            .unwrap_or(false);
        if ours {
            tracing::warn!(target: "uvcam::session", session = self.shared.id, "{} detached", path);
            let path = path.to_string();
            self.teardown(move || CameraError::DeviceGone(path.clone()));
        }
        self.shared.clear_gone();
    }

    fn on_transfer_fault(&mut self, generation: u64, error: CameraError) {
        let current = self
            .pipeline
            .as_ref()
            .map(|p| p.generation() == generation)
            .unwrap_or(false);
        if !current {
            tracing::debug!(target: "uvcam::session", generation, "stale transfer fault ignored: {}", error);
            return;
        }

        self.shared
            .events
            .emit(SessionEvent::TransferFault(error.to_string()));
        match error {
            CameraError::DeviceGone(path) => {
                self.teardown(move || CameraError::DeviceGone(path.clone()));
            }
            other => self.enter_error(other.to_string()),
        }
    }

    fn on_recording_fault(&mut self, reason: String) {
        if self.shared.state() != SessionState::Recording {
            return;
        }
        tracing::warn!(target: "uvcam::session", session = self.shared.id, "recording aborted: {}", reason);
        self.finish_recording();
        self.transition(SessionState::Previewing);
    }
}
