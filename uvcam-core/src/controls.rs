use crate::error::{CameraError, Result};

/// UVC 控件所在的单元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlUnitKind {
    /// Processing Unit (亮度、对比度、白平衡等图像处理)
    Processing,
    /// Camera Terminal (曝光、对焦、变焦等传感器/镜头)
    CameraTerminal,
}

/// 会话暴露的数值控件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlId {
    Brightness,
    Contrast,
    Hue,
    Saturation,
    Sharpness,
    Gamma,
    Gain,
    WhiteBalanceTemperature,
    BacklightCompensation,
    Exposure,
    Focus,
    Zoom,
}

impl ControlId {
    pub const ALL: [ControlId; 12] = [
        ControlId::Brightness,
        ControlId::Contrast,
        ControlId::Hue,
        ControlId::Saturation,
        ControlId::Sharpness,
        ControlId::Gamma,
        ControlId::Gain,
        ControlId::WhiteBalanceTemperature,
        ControlId::BacklightCompensation,
        ControlId::Exposure,
        ControlId::Focus,
        ControlId::Zoom,
    ];

    pub fn unit(self) -> ControlUnitKind {
        match self {
            Self::Exposure | Self::Focus | Self::Zoom => ControlUnitKind::CameraTerminal,
            _ => ControlUnitKind::Processing,
        }
    }

    /// UVC 1.1 控件选择子 (PU_*_CONTROL / CT_*_CONTROL)
    pub fn uvc_selector(self) -> u8 {
        match self {
            Self::BacklightCompensation => 0x01,
            Self::Brightness => 0x02,
            Self::Contrast => 0x03,
            Self::Gain => 0x04,
            Self::Hue => 0x06,
            Self::Saturation => 0x07,
            Self::Sharpness => 0x08,
            Self::Gamma => 0x09,
            Self::WhiteBalanceTemperature => 0x0A,
            // Camera Terminal
            Self::Exposure => 0x04,
            Self::Focus => 0x06,
            Self::Zoom => 0x0B,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Brightness => "brightness",
            Self::Contrast => "contrast",
            Self::Hue => "hue",
            Self::Saturation => "saturation",
            Self::Sharpness => "sharpness",
            Self::Gamma => "gamma",
            Self::Gain => "gain",
            Self::WhiteBalanceTemperature => "white_balance_temperature",
            Self::BacklightCompensation => "backlight_compensation",
            Self::Exposure => "exposure_absolute",
            Self::Focus => "focus_absolute",
            Self::Zoom => "zoom_absolute",
        }
    }
}

/// 硬件上报的控件范围 (GET_MIN / GET_MAX / GET_RES / GET_DEF)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub default: i32,
}

impl ControlRange {
    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// 越界直接报错，不做静默钳位
    pub fn check(&self, id: ControlId, value: i32) -> Result<i32> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(CameraError::OutOfRange {
                control: id,
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// 单个 UVC 单元的控件访问
pub trait ControlUnit: Send + Sync {
    /// 查询控件范围，设备不支持时返回 None
    fn describe(&self, id: ControlId) -> Result<Option<ControlRange>>;

    fn get(&self, id: ControlId) -> Result<i32>;

    fn set(&self, id: ControlId, value: i32) -> Result<()>;
}

/// 控制面聚合体 (Processing Unit 与 Camera Terminal 分开持有)
#[allow(missing_debug_implementations)]
pub struct DeviceControls {
    pub processing: Box<dyn ControlUnit>,
    pub camera: Box<dyn ControlUnit>,
}

impl DeviceControls {
    /// 按控件所在单元路由
    pub fn unit(&self, id: ControlId) -> &dyn ControlUnit {
        match id.unit() {
            ControlUnitKind::Processing => self.processing.as_ref(),
            ControlUnitKind::CameraTerminal => self.camera.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_rejects_instead_of_clamping() {
        let range = ControlRange {
            min: 0,
            max: 255,
            step: 1,
            default: 128,
        };
        assert_eq!(range.check(ControlId::Brightness, 255).unwrap(), 255);
        match range.check(ControlId::Brightness, 256) {
            Err(CameraError::OutOfRange { value, max, .. }) => {
                assert_eq!(value, 256);
                assert_eq!(max, 255);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn units() {
        assert_eq!(ControlId::Contrast.unit(), ControlUnitKind::Processing);
        assert_eq!(ControlId::Zoom.unit(), ControlUnitKind::CameraTerminal);
        assert_eq!(ControlId::Brightness.uvc_selector(), 0x02);
    }
}
