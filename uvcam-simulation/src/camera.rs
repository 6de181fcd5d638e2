use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use uvcam_core::controls::{ControlId, ControlRange, ControlUnit};
use uvcam_core::device::{DeviceCapabilities, DeviceDescriptor, FormatDescriptor};
use uvcam_core::error::{CameraError, Result};
use uvcam_core::pixel_format::FourCC;
use uvcam_core::traits::{DeviceHandle, Stream};

use crate::probe::ReentrancyProbe;
use crate::stream::SimStream;

/// 可注入的行为参数
#[derive(Debug, Clone)]
pub(crate) struct Behaviour {
    pub(crate) fps: u32,
    /// configure (格式提交 + 缓冲区分配) 的额外耗时
    pub(crate) configure_delay: Duration,
    /// 每次控件访问的耗时，用来放大竞争窗口
    pub(crate) control_latency: Duration,
    /// 产出 n 帧后传输层报错
    pub(crate) fail_after_frames: Option<u64>,
    /// 接下来这么多次取帧等待超时 (驱动 DQBUF 超时)
    pub(crate) pending_timeouts: u64,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            fps: 30,
            configure_delay: Duration::ZERO,
            control_latency: Duration::ZERO,
            fail_after_frames: None,
            pending_timeouts: 0,
        }
    }
}

/// 一台仿真 UVC 摄像头
#[derive(Debug)]
pub struct SimCamera {
    descriptor: DeviceDescriptor,
    formats: Vec<FormatDescriptor>,
    controls: Mutex<BTreeMap<ControlId, (ControlRange, i32)>>,
    writes: Mutex<Vec<(ControlId, i32)>>,
    behaviour: Mutex<Behaviour>,
    probe: ReentrancyProbe,
    connected: AtomicBool,
    claimed: AtomicBool,
    streaming: AtomicBool,
    frames_produced: AtomicU64,
}

impl SimCamera {
    pub fn builder(path: impl Into<String>) -> SimCameraBuilder {
        SimCameraBuilder::new(path)
    }

    /// 典型的 1080p USB 摄像头
    pub fn webcam(path: impl Into<String>) -> Arc<Self> {
        Self::builder(path)
            .format(FormatDescriptor::new(1920, 1080, FourCC::MJPEG).with_frame_rates(&[30]))
            .format(FormatDescriptor::new(1280, 720, FourCC::MJPEG).with_frame_rates(&[30, 60]))
            .format(FormatDescriptor::new(1280, 720, FourCC::YUYV).with_frame_rates(&[10]))
            .format(FormatDescriptor::new(640, 480, FourCC::YUYV).with_frame_rates(&[30]))
            .control(ControlId::Brightness, range(-64, 64, 0))
            .control(ControlId::Contrast, range(0, 95, 32))
            .control(ControlId::Saturation, range(0, 100, 64))
            .control(ControlId::Gain, range(0, 100, 0))
            .build()
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    pub fn path(&self) -> &str {
        &self.descriptor.path
    }

    pub fn probe(&self) -> &ReentrancyProbe {
        &self.probe
    }

    /// 硬件侧的当前控件值
    pub fn control_value(&self, id: ControlId) -> Option<i32> {
        self.controls
            .lock()
            .ok()
            .and_then(|c| c.get(&id).map(|(_, v)| *v))
    }

    /// 所有写入硬件的控件值，按顺序
    pub fn control_writes(&self) -> Vec<(ControlId, i32)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::SeqCst)
    }

    pub fn set_fps(&self, fps: u32) {
        self.with_behaviour(|b| b.fps = fps.max(1));
    }

    pub fn set_configure_delay(&self, delay: Duration) {
        self.with_behaviour(|b| b.configure_delay = delay);
    }

    pub fn set_control_latency(&self, latency: Duration) {
        self.with_behaviour(|b| b.control_latency = latency);
    }

    /// 再产出 n 帧后传输层开始报错
    pub fn fail_stream_after(&self, frames: u64) {
        let base = self.frames_produced();
        self.with_behaviour(|b| b.fail_after_frames = Some(base + frames));
    }

    /// 接下来 n 次取帧以超时结束，之后恢复出帧
    pub fn time_out_next_frames(&self, n: u64) {
        self.with_behaviour(|b| b.pending_timeouts = n);
    }

    /// 消耗一次待注入的超时
    pub(crate) fn take_timeout(&self) -> bool {
        let Ok(mut b) = self.behaviour.lock() else {
            return false;
        };
        if b.pending_timeouts == 0 {
            return false;
        }
        b.pending_timeouts -= 1;
        true
    }

    fn with_behaviour(&self, f: impl FnOnce(&mut Behaviour)) {
        if let Ok(mut b) = self.behaviour.lock() {
            f(&mut b);
        }
    }

    pub(crate) fn behaviour(&self) -> Behaviour {
        self.behaviour.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::SeqCst);
    }

    /// 传输层每产出一帧调用一次，返回本帧序号
    pub(crate) fn next_sequence(&self) -> u64 {
        self.frames_produced.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CameraError::DeviceGone(self.descriptor.path.clone()))
        }
    }

    /// claim 接口，已被占用则 DeviceBusy
    pub(crate) fn claim(&self) -> Result<()> {
        self.ensure_connected()?;
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| CameraError::DeviceBusy)
    }

    fn unclaim(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }

    fn hardware_pause(&self) {
        let latency = self.behaviour().control_latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }
}

fn range(min: i32, max: i32, default: i32) -> ControlRange {
    ControlRange {
        min,
        max,
        step: 1,
        default,
    }
}

/// SimCamera 构建器
#[derive(Debug)]
pub struct SimCameraBuilder {
    descriptor: DeviceDescriptor,
    formats: Vec<FormatDescriptor>,
    controls: BTreeMap<ControlId, (ControlRange, i32)>,
    behaviour: Behaviour,
}

impl SimCameraBuilder {
    fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            descriptor: DeviceDescriptor {
                vendor_id: 0x1d6b,
                product_id: 0x0102,
                name: format!("Simulated UVC Camera ({})", path),
                path,
                serial: None,
                bus_info: Some("sim-usb-1".into()),
                capabilities: DeviceCapabilities::VIDEO_CAPTURE
                    | DeviceCapabilities::STREAMING
                    | DeviceCapabilities::CONTROLS,
            },
            formats: Vec::new(),
            controls: BTreeMap::new(),
            behaviour: Behaviour::default(),
        }
    }

    pub fn vendor(mut self, vendor_id: u16) -> Self {
        self.descriptor.vendor_id = vendor_id;
        self
    }

    pub fn product(mut self, product_id: u16) -> Self {
        self.descriptor.product_id = product_id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.descriptor.serial = Some(serial.into());
        self
    }

    pub fn capabilities(mut self, caps: DeviceCapabilities) -> Self {
        self.descriptor.capabilities = caps;
        self
    }

    /// 追加一个格式描述符 (顺序即设备广播顺序)
    pub fn format(mut self, format: FormatDescriptor) -> Self {
        self.formats.push(format);
        self
    }

    pub fn control(mut self, id: ControlId, range: ControlRange) -> Self {
        self.controls.insert(id, (range, range.default));
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.behaviour.fps = fps.max(1);
        self
    }

    pub fn build(self) -> Arc<SimCamera> {
        Arc::new(SimCamera {
            descriptor: self.descriptor,
            formats: self.formats,
            controls: Mutex::new(self.controls),
            writes: Mutex::new(Vec::new()),
            behaviour: Mutex::new(self.behaviour),
            probe: ReentrancyProbe::new(),
            connected: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            frames_produced: AtomicU64::new(0),
        })
    }
}

// --- 控制面 ---

pub(crate) struct SimControls {
    pub(crate) camera: Arc<SimCamera>,
}

impl ControlUnit for SimControls {
    fn describe(&self, id: ControlId) -> Result<Option<ControlRange>> {
        let _guard = self.camera.probe.enter();
        self.camera.ensure_connected()?;
        self.camera.hardware_pause();

        let controls = self.camera.controls.lock().map_err(poisoned)?;
        Ok(controls.get(&id).map(|(range, _)| *range))
    }

    fn get(&self, id: ControlId) -> Result<i32> {
        let _guard = self.camera.probe.enter();
        self.camera.ensure_connected()?;
        self.camera.hardware_pause();

        let controls = self.camera.controls.lock().map_err(poisoned)?;
        controls
            .get(&id)
            .map(|(_, value)| *value)
            .ok_or(CameraError::ControlNotSupported(id))
    }

    fn set(&self, id: ControlId, value: i32) -> Result<()> {
        let _guard = self.camera.probe.enter();
        self.camera.ensure_connected()?;
        self.camera.hardware_pause();

        let mut controls = self.camera.controls.lock().map_err(poisoned)?;
        let (range, current) = controls
            .get_mut(&id)
            .ok_or(CameraError::ControlNotSupported(id))?;
        // 真实硬件对越界 SET_CUR 回 STALL
        range.check(id, value)?;
        *current = value;

        if let Ok(mut writes) = self.camera.writes.lock() {
            writes.push((id, value));
        }
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> CameraError {
    CameraError::Io(std::io::Error::other("simulated device state poisoned"))
}

// --- 数据面句柄 ---

pub(crate) struct SimHandle {
    pub(crate) camera: Arc<SimCamera>,
    released: bool,
}

impl SimHandle {
    pub(crate) fn new(camera: Arc<SimCamera>) -> Self {
        Self {
            camera,
            released: false,
        }
    }
}

#[async_trait]
impl DeviceHandle for SimHandle {
    fn supported_formats(&self) -> Result<Vec<FormatDescriptor>> {
        let _guard = self.camera.probe.enter();
        self.camera.ensure_connected()?;
        Ok(self.camera.formats.clone())
    }

    async fn configure(
        &mut self,
        format: &FormatDescriptor,
        buffer_count: usize,
    ) -> Result<Box<dyn Stream>> {
        let delay = {
            let _guard = self.camera.probe.enter();
            self.camera.ensure_connected()?;

            if !self
                .camera
                .formats
                .iter()
                .any(|f| f.matches(format.width, format.height, format.format))
            {
                return Err(CameraError::UnsupportedFormat {
                    width: format.width,
                    height: format.height,
                    format: format.format,
                });
            }
            self.camera.behaviour().configure_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.camera.ensure_connected()?;

        tracing::debug!(
            target: "uvcam::sim",
            "configured {}x{} {:?} with {} buffers",
            format.width,
            format.height,
            format.format,
            buffer_count
        );

        let stream = SimStream::new(self.camera.clone(), format)?;
        Ok(Box::new(stream))
    }

    fn release(&mut self) -> Result<()> {
        let _guard = self.camera.probe.enter();
        if !self.released {
            self.released = true;
            self.camera.unclaim();
        }
        Ok(())
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        if !self.released {
            self.camera.unclaim();
        }
    }
}
