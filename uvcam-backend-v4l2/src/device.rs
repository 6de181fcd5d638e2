use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use v4l::capability::Flags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::video::Capture;

use uvcam_core::controls::DeviceControls;
use uvcam_core::device::{DeviceCapabilities, DeviceDescriptor, FormatDescriptor};
use uvcam_core::error::{CameraError, Result};
use uvcam_core::traits::{DeviceHandle, Stream};

use crate::controls::create_controls;
use crate::pixel_map;
use crate::stream::V4l2Stream;

/// 把 ioctl 错误映射到会话关心的几类
pub(crate) fn map_io(path: &str, e: io::Error) -> CameraError {
    match e.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENOENT) => CameraError::DeviceGone(path.to_string()),
        Some(libc::EBUSY) => CameraError::DeviceBusy,
        _ => CameraError::Io(e),
    }
}

/// video4linux 节点对应的 USB 设备目录 (/sys/class/video4linux/videoN/device/..)
fn usb_sysfs_dir(index: usize) -> PathBuf {
    PathBuf::from(format!("/sys/class/video4linux/video{}/device/..", index))
}

fn read_sysfs(dir: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(dir.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_sysfs_hex(dir: &Path, attr: &str) -> u16 {
    read_sysfs(dir, attr)
        .and_then(|s| u16::from_str_radix(&s, 16).ok())
        .unwrap_or(0)
}

/// 枚举系统中的摄像头设备
pub fn list_devices() -> Result<Vec<DeviceDescriptor>> {
    let mut devices = Vec::new();

    // 遍历 /dev/video* 节点
    for node in v4l::context::enum_devices() {
        let path = node.path().to_string_lossy().to_string();
        let Ok(dev) = v4l::Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };

        // 过滤：uvcvideo 为每台摄像头额外注册一个 Metadata 节点，它没有 VIDEO_CAPTURE
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let mut capabilities = DeviceCapabilities::VIDEO_CAPTURE;
        if caps.capabilities.contains(Flags::STREAMING) {
            capabilities |= DeviceCapabilities::STREAMING;
        }
        if caps.driver == "uvcvideo" {
            capabilities |= DeviceCapabilities::CONTROLS;
        }

        let usb = usb_sysfs_dir(node.index());
        devices.push(DeviceDescriptor {
            vendor_id: read_sysfs_hex(&usb, "idVendor"),
            product_id: read_sysfs_hex(&usb, "idProduct"),
            name: node.name().unwrap_or_else(|| caps.card.clone()),
            serial: read_sysfs(&usb, "serial"),
            bus_info: Some(caps.bus),
            capabilities,
            path,
        });
    }

    tracing::debug!(target: "uvcam::v4l2", "found {} capture devices", devices.len());
    Ok(devices)
}

/// 打开设备，返回传输句柄与控件
pub fn open(device: &DeviceDescriptor) -> Result<(Box<dyn DeviceHandle>, DeviceControls)> {
    if !Path::new(&device.path).exists() {
        return Err(CameraError::DeviceGone(device.path.clone()));
    }
    let dev = v4l::Device::with_path(&device.path).map_err(|e| map_io(&device.path, e))?;

    // Stream 和 Controls 都需要访问同一个 fd，V4L2 允许多线程访问同一个 fd
    let dev = Arc::new(dev);
    let controls = create_controls(dev.clone(), &device.path);

    tracing::info!(target: "uvcam::v4l2", "opened {} ({})", device.path, device.name);
    Ok((
        Box::new(V4l2Handle {
            dev,
            path: device.path.clone(),
        }),
        controls,
    ))
}

/// 已打开的 V4L2 节点
struct V4l2Handle {
    dev: Arc<v4l::Device>,
    path: String,
}

impl V4l2Handle {
    fn frame_rates(&self, fourcc: v4l::FourCC, width: u32, height: u32) -> Vec<u32> {
        let intervals = self
            .dev
            .enum_frameintervals(fourcc, width, height)
            .unwrap_or_default();

        let mut rates: Vec<u32> = intervals
            .into_iter()
            .filter_map(|fi| match fi.interval {
                FrameIntervalEnum::Discrete(f) if f.numerator > 0 => Some(f.denominator / f.numerator),
                _ => None,
            })
            .collect();
        rates.dedup();
        rates
    }
}

#[async_trait]
impl DeviceHandle for V4l2Handle {
    fn supported_formats(&self) -> Result<Vec<FormatDescriptor>> {
        let mut formats = Vec::new();

        for desc in self.dev.enum_formats().map_err(|e| map_io(&self.path, e))? {
            let format = pixel_map::from_v4l_fourcc(desc.fourcc);

            // 获取该格式下的所有分辨率，Stepwise 只取离散化后的点
            for size in self.dev.enum_framesizes(desc.fourcc).unwrap_or_default() {
                for discrete in size.size.to_discrete() {
                    let rates = self.frame_rates(desc.fourcc, discrete.width, discrete.height);
                    formats.push(
                        FormatDescriptor::new(discrete.width, discrete.height, format)
                            .with_frame_rates(&rates),
                    );
                }
            }
        }

        Ok(formats)
    }

    async fn configure(
        &mut self,
        format: &FormatDescriptor,
        buffer_count: usize,
    ) -> Result<Box<dyn Stream>> {
        let unsupported = || CameraError::UnsupportedFormat {
            width: format.width,
            height: format.height,
            format: format.format,
        };
        let fourcc = pixel_map::to_v4l_fourcc(format.format).ok_or_else(unsupported)?;

        // 应用格式设置 (ioctl: VIDIOC_S_FMT)
        let mut fmt = self.dev.format().map_err(|e| map_io(&self.path, e))?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = fourcc;
        let applied = self.dev.set_format(&fmt).map_err(|e| map_io(&self.path, e))?;

        // 驱动会把不支持的请求改成最接近的格式，这里不接受替代
        if applied.width != format.width || applied.height != format.height || applied.fourcc != fourcc {
            tracing::warn!(
                target: "uvcam::v4l2",
                "{} substituted {}x{} {} for the requested format",
                self.path,
                applied.width,
                applied.height,
                applied.fourcc
            );
            return Err(unsupported());
        }

        if let Some(&fps) = format.frame_rates.first() {
            let params = v4l::video::capture::Parameters::with_fps(fps);
            if let Err(e) = self.dev.set_params(&params) {
                tracing::debug!(target: "uvcam::v4l2", "{}: frame rate {} not applied: {}", self.path, fps, e);
            }
        }

        // 申请 Buffer, mmap
        let stream = V4l2Stream::new(self.dev.clone(), &self.path, &applied, buffer_count)?;
        tracing::info!(
            target: "uvcam::v4l2",
            "{} configured: {}x{} @ {}, {} buffers",
            self.path,
            applied.width,
            applied.height,
            applied.fourcc,
            buffer_count
        );
        Ok(Box::new(stream))
    }

    fn release(&mut self) -> Result<()> {
        // fd 在最后一个 Arc<Device> 释放时关闭
        tracing::debug!(target: "uvcam::v4l2", "released {}", self.path);
        Ok(())
    }
}
