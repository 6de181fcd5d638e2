use bitflags::bitflags;

use crate::pixel_format::PixelFormat;

bitflags! {
    /// 设备能力标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serialize", serde(transparent))]
    pub struct DeviceCapabilities: u32 {
        /// 视频采集 (VideoStreaming interface)
        const VIDEO_CAPTURE = 1;
        /// 支持流式传输
        const STREAMING = 1 << 1;
        /// 支持硬件静态图 (Still Image Frame)
        const STILL_IMAGE = 1 << 2;
        /// 暴露 Processing Unit / Camera Terminal 控件
        const CONTROLS = 1 << 3;
    }
}

/// 枚举得到的设备描述，拔出后失效
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,

    /// 唯一设备路径 (e.g. "/dev/video0" 或 "/dev/bus/usb/001/004")
    /// 同一时刻一个物理设备对应一个 path
    pub path: String,

    /// 对用户友好的显示名称 (e.g. "Logitech C920")
    pub name: String,

    pub serial: Option<String>,

    /// 硬件总线信息 (e.g. "usb-0000:00:14.0-1")
    pub bus_info: Option<String>,

    pub capabilities: DeviceCapabilities,
}

impl DeviceDescriptor {
    /// 会话注册表与权限表使用的键
    pub fn key(&self) -> &str {
        &self.path
    }
}

/// 设备过滤器 (对应 USBMonitor 的 device_filter.xml 条目)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// 必须具备的能力
    pub capabilities: DeviceCapabilities,
    /// 为 true 时命中即排除
    pub exclude: bool,
}

impl DeviceFilter {
    /// 不过滤
    pub fn any() -> Self {
        Self::default()
    }

    /// 默认 UVC 过滤器：只要能采集视频
    pub fn uvc() -> Self {
        Self {
            capabilities: DeviceCapabilities::VIDEO_CAPTURE,
            ..Self::default()
        }
    }

    pub fn vendor(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn product(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        let hit = self.vendor_id.map_or(true, |v| v == device.vendor_id)
            && self.product_id.map_or(true, |p| p == device.product_id)
            && device.capabilities.contains(self.capabilities);

        hit != self.exclude
    }
}

/// 设备广播的一个格式/帧描述符组合
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// 支持的帧率 (fps)，未知时为空
    pub frame_rates: Vec<u32>,
}

impl FormatDescriptor {
    pub fn new(width: u32, height: u32, format: impl Into<PixelFormat>) -> Self {
        Self {
            width,
            height,
            format: format.into(),
            frame_rates: Vec::new(),
        }
    }

    pub fn with_frame_rates(mut self, rates: &[u32]) -> Self {
        self.frame_rates = rates.to_vec();
        self
    }

    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel_format::FourCC;

    fn camera(vendor_id: u16, caps: DeviceCapabilities) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id,
            product_id: 0x0825,
            path: "/dev/video0".into(),
            name: "Test Camera".into(),
            serial: None,
            bus_info: None,
            capabilities: caps,
        }
    }

    #[test]
    fn uvc_filter_requires_capture() {
        let filter = DeviceFilter::uvc();
        assert!(filter.matches(&camera(0x046d, DeviceCapabilities::VIDEO_CAPTURE)));
        assert!(!filter.matches(&camera(0x046d, DeviceCapabilities::CONTROLS)));
    }

    #[test]
    fn exclude_filter_inverts() {
        let filter = DeviceFilter::any().vendor(0x046d).excluding();
        assert!(!filter.matches(&camera(0x046d, DeviceCapabilities::VIDEO_CAPTURE)));
        assert!(filter.matches(&camera(0x1234, DeviceCapabilities::VIDEO_CAPTURE)));
    }

    #[test]
    fn format_match_is_exact() {
        let fmt = FormatDescriptor::new(1280, 720, FourCC::YUYV);
        assert!(fmt.matches(1280, 720, FourCC::YUYV.into()));
        assert!(!fmt.matches(1920, 1080, FourCC::YUYV.into()));
        assert!(!fmt.matches(1280, 720, FourCC::MJPEG.into()));
    }
}
