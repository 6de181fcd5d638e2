use std::time::Duration;

use async_trait::async_trait;

use crate::controls::DeviceControls;
use crate::device::{DeviceDescriptor, FormatDescriptor};
use crate::error::Result;
use crate::frame::RawFrame;

/// 1. 驱动入口：设备枚举与打开
pub trait Driver: Send + Sync {
    /// 后端标识 (e.g. "V4L2", "Simulation")
    fn name(&self) -> &'static str;

    /// 查询当前总线上的设备，每次调用都重新查询
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// 打开并独占 (claim) 设备
    /// 返回分离的传输句柄 (数据面) 和 Controls (控制面)
    fn open(&self, device: &DeviceDescriptor) -> Result<(Box<dyn DeviceHandle>, DeviceControls)>;
}

/// 2. 已 claim 的设备：格式协商与传输建立
#[async_trait]
pub trait DeviceHandle: Send {
    /// 设备广播的全部格式描述符，按描述符顺序
    fn supported_formats(&self) -> Result<Vec<FormatDescriptor>>;

    /// 应用格式并分配传输缓冲区 (VS_COMMIT)
    async fn configure(
        &mut self,
        format: &FormatDescriptor,
        buffer_count: usize,
    ) -> Result<Box<dyn Stream>>;

    /// 释放 claim，之后句柄不可再用
    fn release(&mut self) -> Result<()>;
}

/// 3. 数据面：流式获取
/// 必须是 Send，以便在 Tokio 任务中运行
#[async_trait]
pub trait Stream: Send {
    /// 启动传输
    async fn start(&mut self) -> Result<()>;

    /// 停止传输 (释放带宽)，缓冲区保留到 Stream 被 drop
    async fn stop(&mut self) -> Result<()>;

    /// 获取下一帧
    /// 返回的 RawFrame 借用 self 的缓冲区；超过帧等待上限时返回 `Io(TimedOut)`
    async fn next_frame(&mut self) -> Result<RawFrame<'_>>;

    /// 单帧等待上限，由会话在启动传输前设置
    fn set_frame_timeout(&mut self, _timeout: Duration) {}
}

// 为 Box<T> 实现 Stream，这样 Box<dyn Stream> 也能被当做 Stream 使用
#[async_trait]
impl<S: Stream + ?Sized + Send> Stream for Box<S> {
    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }

    async fn next_frame(&mut self) -> Result<RawFrame<'_>> {
        (**self).next_frame().await
    }

    fn set_frame_timeout(&mut self, timeout: Duration) {
        (**self).set_frame_timeout(timeout)
    }
}
