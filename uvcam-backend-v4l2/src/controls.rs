use std::sync::{Arc, OnceLock};

use v4l::control::{Control, Description, Value};
use v4l::Device;

use uvcam_core::controls::{ControlId, ControlRange, ControlUnit, ControlUnitKind, DeviceControls};
use uvcam_core::error::{CameraError, Result};

use crate::device::map_io;

// --- 手动定义 V4L2 标准常量 (Linux ABI) ---
// 来源: /usr/include/linux/v4l2-controls.h

const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009A_0900;

// User Class (uvcvideo 把 Processing Unit 控件映射到这里)
const CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
const CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
const CID_SATURATION: u32 = V4L2_CID_BASE + 2;
const CID_HUE: u32 = V4L2_CID_BASE + 3;
const CID_GAMMA: u32 = V4L2_CID_BASE + 16;
const CID_GAIN: u32 = V4L2_CID_BASE + 19;
const CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
const CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;
const CID_BACKLIGHT_COMPENSATION: u32 = V4L2_CID_BASE + 28;

// Camera Class (Camera Terminal)
const CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
const CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;
const CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
const CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
const CID_ZOOM_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 13;

/// V4L2_EXPOSURE_MANUAL
const EXPOSURE_MANUAL: i64 = 1;

fn cid(id: ControlId) -> u32 {
    match id {
        ControlId::Brightness => CID_BRIGHTNESS,
        ControlId::Contrast => CID_CONTRAST,
        ControlId::Saturation => CID_SATURATION,
        ControlId::Hue => CID_HUE,
        ControlId::Gamma => CID_GAMMA,
        ControlId::Gain => CID_GAIN,
        ControlId::WhiteBalanceTemperature => CID_WHITE_BALANCE_TEMPERATURE,
        ControlId::Sharpness => CID_SHARPNESS,
        ControlId::BacklightCompensation => CID_BACKLIGHT_COMPENSATION,
        ControlId::Exposure => CID_EXPOSURE_ABSOLUTE,
        ControlId::Focus => CID_FOCUS_ABSOLUTE,
        ControlId::Zoom => CID_ZOOM_ABSOLUTE,
    }
}

// --- 工厂函数 ---

pub fn create_controls(dev: Arc<Device>, path: &str) -> DeviceControls {
    let catalog = Arc::new(Catalog::default());
    DeviceControls {
        processing: Box::new(V4l2Controls {
            dev: dev.clone(),
            path: path.to_string(),
            unit: ControlUnitKind::Processing,
            catalog: catalog.clone(),
        }),
        camera: Box::new(V4l2Controls {
            dev,
            path: path.to_string(),
            unit: ControlUnitKind::CameraTerminal,
            catalog,
        }),
    }
}

/// VIDIOC_QUERYCTRL 的结果，首次使用时查询一次
#[derive(Default)]
struct Catalog {
    descriptions: OnceLock<Vec<Description>>,
}

impl Catalog {
    fn find(&self, dev: &Device, path: &str, cid: u32) -> Result<Option<ControlRange>> {
        let descriptions = match self.descriptions.get() {
            Some(d) => d,
            None => {
                let queried = dev.query_controls().map_err(|e| map_io(path, e))?;
                self.descriptions.get_or_init(|| queried)
            }
        };

        Ok(descriptions.iter().find(|d| d.id == cid).map(|d| ControlRange {
            min: d.minimum as i32,
            max: d.maximum as i32,
            step: d.step as i32,
            default: d.default as i32,
        }))
    }
}

/// 一个 UVC 单元的控件
struct V4l2Controls {
    dev: Arc<Device>,
    path: String,
    unit: ControlUnitKind,
    catalog: Arc<Catalog>,
}

impl V4l2Controls {
    fn check_unit(&self, id: ControlId) -> Result<()> {
        if id.unit() == self.unit {
            Ok(())
        } else {
            Err(CameraError::ControlNotSupported(id))
        }
    }

    /// 写绝对值前先关掉对应的自动模式，失败 (设备没有自动模式) 时忽略
    fn leave_auto_mode(&self, id: ControlId) {
        let auto = match id {
            ControlId::Exposure => Control {
                id: CID_EXPOSURE_AUTO,
                value: Value::Integer(EXPOSURE_MANUAL),
            },
            ControlId::Focus => Control {
                id: CID_FOCUS_AUTO,
                value: Value::Boolean(false),
            },
            _ => return,
        };
        if let Err(e) = self.dev.set_control(auto) {
            tracing::debug!(target: "uvcam::v4l2", "{}: no auto mode to disable for {}: {}", self.path, id.name(), e);
        }
    }
}

impl ControlUnit for V4l2Controls {
    fn describe(&self, id: ControlId) -> Result<Option<ControlRange>> {
        self.check_unit(id)?;
        self.catalog.find(&self.dev, &self.path, cid(id))
    }

    fn get(&self, id: ControlId) -> Result<i32> {
        self.check_unit(id)?;
        let control = self.dev.control(cid(id)).map_err(|e| match e.raw_os_error() {
            Some(libc::EINVAL) => CameraError::ControlNotSupported(id),
            _ => map_io(&self.path, e),
        })?;

        match control.value {
            Value::Integer(v) => Ok(v as i32),
            Value::Boolean(b) => Ok(b as i32),
            _ => Err(CameraError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is not a numeric control", id.name()),
            ))),
        }
    }

    fn set(&self, id: ControlId, value: i32) -> Result<()> {
        self.check_unit(id)?;
        self.leave_auto_mode(id);
        self.dev
            .set_control(Control {
                id: cid(id),
                value: Value::Integer(value as i64),
            })
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EINVAL) => CameraError::ControlNotSupported(id),
                _ => map_io(&self.path, e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_ids_follow_the_kernel_abi() {
        assert_eq!(cid(ControlId::Brightness), 0x0098_0900);
        assert_eq!(cid(ControlId::Gain), 0x0098_0913);
        assert_eq!(cid(ControlId::Exposure), 0x009A_0902);
        assert_eq!(cid(ControlId::Zoom), 0x009A_090D);
    }
}
