//! UVC 摄像头会话管理
//!
//! 枚举 USB 摄像头、申请访问授权、打开会话并协商格式、把帧经由传输管线投递给
//! [`FrameSink`](sink::FrameSink)，同时支持录像、抓拍与图像控件读写。
//! 每个会话的硬件调用都在它自己的 worker 线程上串行执行。

pub mod autoconnect;
pub mod backend;
pub mod enumerator;
pub mod imgcodecs;
pub(crate) mod internal;
pub mod permission;
pub mod recording;
pub mod session;
pub mod sink;
pub mod still;

pub use uvcam_core;

/// 预置模块，用户可以通过 `use uvcam::prelude::*;` 导入常用项
pub mod prelude {
    pub use uvcam_core::prelude::*;

    pub use crate::autoconnect::AutoConnect;
    pub use crate::backend::create_driver;
    pub use crate::enumerator::{DeviceEnumerator, DeviceEvent, DeviceObserver, MonitorHandle};
    pub use crate::permission::{
        AccessGrant, AccessOutcome, AccessRequest, AutoGrant, PermissionGate, PermissionPrompt,
        PermissionResponder,
    };
    pub use crate::recording::{RecordingStatus, RecordingSummary};
    pub use crate::session::{Pending, SessionEvent, SessionObserver, SessionState, UvcSession};
    pub use crate::sink::{ChannelSink, FrameSink};
    pub use crate::still::StillRequest;
    pub use uvcam_core::telemetry::StreamStats;
}
