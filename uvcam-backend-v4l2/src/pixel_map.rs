use uvcam_core::pixel_format::{FourCC, PixelFormat};
use v4l::format::fourcc::FourCC as V4lFourCC;

/// 将 v4l crate 的 FourCC 转换为 uvcam-core 的 PixelFormat
pub fn from_v4l_fourcc(cc: V4lFourCC) -> PixelFormat {
    let code = u32::from_le_bytes(cc.repr);
    let core_cc = FourCC(code);

    match core_cc {
        FourCC::YUYV | FourCC::UYVY | FourCC::NV12 | FourCC::RGB3 => PixelFormat::Known(core_cc),
        FourCC::MJPEG | FourCC::H264 => PixelFormat::Known(core_cc),
        _ => {
            tracing::debug!(target: "uvcam::v4l2", "unmapped V4L2 pixel format: {}", core_cc);
            PixelFormat::Unknown(code)
        }
    }
}

/// 将 uvcam-core 的 PixelFormat 转换为 v4l 的 FourCC
/// 用于请求设备设置格式
pub fn to_v4l_fourcc(fmt: PixelFormat) -> Option<V4lFourCC> {
    match fmt {
        PixelFormat::Known(cc) => Some(V4lFourCC::new(&cc.0.to_le_bytes())),
        PixelFormat::Unknown(_) => None, // 无法主动请求未知的格式
    }
}
