#![cfg(target_os = "linux")]

pub mod controls;
pub mod device;
pub mod pixel_map;
pub mod stream;

use std::sync::Arc;

use uvcam_core::controls::DeviceControls;
use uvcam_core::device::DeviceDescriptor;
use uvcam_core::error::Result;
use uvcam_core::traits::{DeviceHandle, Driver};

/// V4L2 驱动
/// 通常作为全局单例存在
#[derive(Debug, Clone)]
pub struct V4l2Driver;

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for V4l2Driver {
    fn name(&self) -> &'static str {
        "V4L2"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        device::list_devices()
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<(Box<dyn DeviceHandle>, DeviceControls)> {
        device::open(device)
    }
}

// 为了方便直接使用，提供一个默认实例
pub fn default_driver() -> Arc<dyn Driver> {
    Arc::new(V4l2Driver::new())
}
