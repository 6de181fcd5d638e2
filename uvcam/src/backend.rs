//! 按平台选择硬件后端

use std::sync::Arc;

use uvcam_core::error::{CameraError, Result};
use uvcam_core::traits::Driver;

/// 后端枚举，用于内部标记当前使用的是哪个驱动
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    V4L2,
    /// 不支持的系统，需要调用方自行提供 Driver (例如仿真后端)
    None,
}

/// 创建当前平台的驱动实例
pub fn create_driver() -> Result<Arc<dyn Driver>> {
    #[cfg(all(feature = "linux-v4l2", target_os = "linux"))]
    {
        return Ok(Arc::new(uvcam_backend_v4l2::V4l2Driver::new()));
    }

    #[allow(unreachable_code)]
    Err(CameraError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no camera backend for this platform, check Cargo features",
    )))
}

/// 当前编译配置下的首选后端
pub fn default_backend() -> BackendType {
    if cfg!(all(feature = "linux-v4l2", target_os = "linux")) {
        BackendType::V4L2
    } else {
        BackendType::None
    }
}
