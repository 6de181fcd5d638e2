use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::pixel_format::{FourCC, PixelFormat};

/// 预览负载模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PreviewMode {
    /// 未压缩 YUYV
    Yuyv,
    /// Motion-JPEG
    Mjpeg,
}

impl PreviewMode {
    /// 兼容 UVCCamera 的整型模式码：0 为 YUYV，其余为 MJPEG
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            Self::Yuyv
        } else {
            Self::Mjpeg
        }
    }

    pub fn fourcc(self) -> FourCC {
        match self {
            Self::Yuyv => FourCC::YUYV,
            Self::Mjpeg => FourCC::MJPEG,
        }
    }

    pub fn pixel_format(self) -> PixelFormat {
        PixelFormat::Known(self.fourcc())
    }
}

/// 录像编码器选择，构造时固定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum EncoderKind {
    /// 设备负载原样写出 (MJPEG 预览下即为 MJPEG 码流)
    Passthrough,
    /// 每帧先转成 JPEG 再写出，YUYV 预览需要它
    Transcode,
}

/// 会话配置，会话期间不可变
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub mode: PreviewMode,
    pub encoder: EncoderKind,
    /// 设备端传输缓冲区数量
    pub buffer_count: usize,
    /// 传输管线与 FrameSink 之间待投递帧的上限
    pub frame_queue_depth: usize,
    /// open 与传输建立的超时
    pub open_timeout: Duration,
    /// 单帧等待超时
    pub frame_timeout: Duration,
    /// Transcode 与静态图的 JPEG 质量 (1-100)
    pub jpeg_quality: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            width: 1920,
            height: 1080,
            mode: PreviewMode::Mjpeg,
            encoder: EncoderKind::Transcode,
            buffer_count: 4,
            frame_queue_depth: 3,
            open_timeout: Duration::from_secs(3),
            frame_timeout: Duration::from_millis(500),
            jpeg_quality: 90,
        }
    }

    /// 设置预览分辨率
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn mode(mut self, mode: PreviewMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn encoder(mut self, encoder: EncoderKind) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn frame_queue_depth(mut self, depth: usize) -> Self {
        self.frame_queue_depth = depth;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// 会话创建前的静态检查
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(CameraError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                msg.to_string(),
            )))
        };

        if self.width == 0 || self.height == 0 {
            return invalid("preview resolution must be non-zero");
        }
        if self.buffer_count == 0 {
            return invalid("buffer_count must be at least 1");
        }
        if self.frame_queue_depth == 0 {
            return invalid("frame_queue_depth must be at least 1");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality must be within 1..=100");
        }
        Ok(())
    }

    #[cfg(feature = "serialize")]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(std::io::Error::from)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serialize")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CameraError::Io(std::io::Error::from(e)))
    }
}
