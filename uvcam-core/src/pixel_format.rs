use std::fmt::{self, Display};

/// 四字符代码 (Four Character Code)，UVC 格式描述符中的 GUID 前四字节
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct FourCC(pub u32);

impl FourCC {
    /// 从 ASCII 字符创建 FourCC
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self((a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24))
    }

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();

        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// UVC 摄像头常见的负载格式
impl FourCC {
    /// YUYV 4:2:2 - UVC 未压缩格式 (UVC_GUID_FORMAT_YUY2)
    pub const YUYV: Self = Self::new(b'Y', b'U', b'Y', b'V');
    /// UYVY 4:2:2
    pub const UYVY: Self = Self::new(b'U', b'Y', b'V', b'Y');
    /// NV12 4:2:0
    pub const NV12: Self = Self::new(b'N', b'V', b'1', b'2');
    /// Motion-JPEG - 高分辨率下节省 USB 带宽
    pub const MJPEG: Self = Self::new(b'M', b'J', b'P', b'G');
    /// H.264 (UVC 1.5 frame-based)
    pub const H264: Self = Self::new(b'H', b'2', b'6', b'4');
    /// RGB24 (R-G-B)
    pub const RGB3: Self = Self::new(b'R', b'G', b'B', b'3');
}

/// 像素格式的高级枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelFormat {
    /// 已知的标准格式
    Known(FourCC),
    /// 设备返回了库不认识的私有格式
    Unknown(u32),
}

impl PixelFormat {
    /// 判断是否为压缩格式 (JPEG, H264)
    pub fn is_compressed(&self) -> bool {
        match self {
            Self::Known(cc) => matches!(*cc, FourCC::MJPEG | FourCC::H264),
            _ => false,
        }
    }

    /// 未压缩格式一帧的字节数，压缩格式返回 None
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::Known(cc) => match *cc {
                FourCC::YUYV | FourCC::UYVY => Some(pixels * 2),
                FourCC::NV12 => Some(pixels * 3 / 2),
                FourCC::RGB3 => Some(pixels * 3),
                _ => None,
            },
            Self::Unknown(_) => None,
        }
    }

    pub fn fourcc(&self) -> Option<FourCC> {
        match self {
            Self::Known(cc) => Some(*cc),
            Self::Unknown(_) => None,
        }
    }
}

impl From<u32> for PixelFormat {
    fn from(val: u32) -> Self {
        match FourCC(val) {
            cc @ (FourCC::YUYV
            | FourCC::UYVY
            | FourCC::NV12
            | FourCC::MJPEG
            | FourCC::H264
            | FourCC::RGB3) => Self::Known(cc),
            _ => Self::Unknown(val),
        }
    }
}

impl From<FourCC> for PixelFormat {
    fn from(cc: FourCC) -> Self {
        Self::from(cc.0)
    }
}

impl PartialEq<PixelFormat> for FourCC {
    fn eq(&self, other: &PixelFormat) -> bool {
        match other {
            PixelFormat::Known(cc) => self == cc,
            PixelFormat::Unknown(val) => self.0 == *val,
        }
    }
}

// 反向比较也加上
impl PartialEq<FourCC> for PixelFormat {
    fn eq(&self, other: &FourCC) -> bool {
        other == self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_displays_ascii() {
        assert_eq!(FourCC::MJPEG.to_string(), "MJPG");
        assert_eq!(FourCC::from_bytes(*b"YUYV"), FourCC::YUYV);
    }

    #[test]
    fn unknown_codes_stay_unknown() {
        let private = FourCC::new(b'X', b'Y', b'Z', b'1');
        assert_eq!(PixelFormat::from(private), PixelFormat::Unknown(private.0));
        assert_eq!(PixelFormat::from(FourCC::YUYV), FourCC::YUYV);
        assert!(PixelFormat::from(FourCC::MJPEG).is_compressed());
    }

    #[test]
    fn raw_frame_sizes() {
        let yuyv = PixelFormat::from(FourCC::YUYV);
        assert_eq!(yuyv.frame_size(640, 480), Some(640 * 480 * 2));
        assert_eq!(PixelFormat::from(FourCC::MJPEG).frame_size(640, 480), None);
    }
}
