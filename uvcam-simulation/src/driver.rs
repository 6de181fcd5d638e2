use std::sync::{Arc, Mutex};

use uvcam_core::controls::DeviceControls;
use uvcam_core::device::DeviceDescriptor;
use uvcam_core::error::{CameraError, Result};
use uvcam_core::traits::{DeviceHandle, Driver};

use crate::camera::{SimCamera, SimControls, SimHandle};

/// 仿真 USB 总线
///
/// `plug`/`unplug` 模拟热插拔，之后的 `list_devices` 反映新的总线状态。
#[derive(Debug, Clone, Default)]
pub struct SimDriver {
    bus: Arc<Mutex<Vec<Arc<SimCamera>>>>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入摄像头
    pub fn plug(&self, camera: Arc<SimCamera>) {
        camera.set_connected(true);
        if let Ok(mut bus) = self.bus.lock() {
            bus.retain(|c| c.path() != camera.path());
            bus.push(camera);
        }
    }

    /// 拔出摄像头，正在进行的传输与控件访问随后失败
    pub fn unplug(&self, path: &str) -> Option<Arc<SimCamera>> {
        let mut bus = self.bus.lock().ok()?;
        let idx = bus.iter().position(|c| c.path() == path)?;
        let camera = bus.remove(idx);
        camera.set_connected(false);
        tracing::debug!(target: "uvcam::sim", "unplugged {}", path);
        Some(camera)
    }

    pub fn camera(&self, path: &str) -> Option<Arc<SimCamera>> {
        self.bus
            .lock()
            .ok()?
            .iter()
            .find(|c| c.path() == path)
            .cloned()
    }
}

impl Driver for SimDriver {
    fn name(&self) -> &'static str {
        "Simulation"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let bus = self
            .bus
            .lock()
            .map_err(|_| CameraError::Io(std::io::Error::other("simulated bus poisoned")))?;
        Ok(bus.iter().map(|c| c.descriptor()).collect())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<(Box<dyn DeviceHandle>, DeviceControls)> {
        let camera = self
            .camera(&device.path)
            .ok_or_else(|| CameraError::DeviceGone(device.path.clone()))?;
        camera.claim()?;

        let controls = DeviceControls {
            processing: Box::new(SimControls {
                camera: camera.clone(),
            }),
            camera: Box::new(SimControls {
                camera: camera.clone(),
            }),
        };

        Ok((Box::new(SimHandle::new(camera)), controls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvcam_core::controls::ControlId;
    use uvcam_core::device::FormatDescriptor;
    use uvcam_core::pixel_format::FourCC;

    #[test]
    fn plug_and_unplug_update_the_bus() {
        let driver = SimDriver::new();
        driver.plug(SimCamera::webcam("/dev/video0"));
        driver.plug(SimCamera::webcam("/dev/video2"));
        assert_eq!(driver.list_devices().unwrap().len(), 2);

        let gone = driver.unplug("/dev/video0").unwrap();
        assert!(!gone.is_connected());
        assert_eq!(driver.list_devices().unwrap().len(), 1);
        assert!(driver.unplug("/dev/video0").is_none());
    }

    #[test]
    fn second_open_is_busy_until_release() {
        let driver = SimDriver::new();
        let camera = SimCamera::webcam("/dev/video0");
        driver.plug(camera.clone());
        let desc = camera.descriptor();

        let (mut handle, _controls) = driver.open(&desc).unwrap();
        assert!(matches!(driver.open(&desc), Err(CameraError::DeviceBusy)));

        handle.release().unwrap();
        assert!(!camera.is_claimed());
        assert!(driver.open(&desc).is_ok());
    }

    #[test]
    fn hardware_rejects_out_of_range_writes() {
        let driver = SimDriver::new();
        let camera = SimCamera::webcam("/dev/video0");
        driver.plug(camera.clone());
        let (_handle, controls) = driver.open(&camera.descriptor()).unwrap();

        let unit = controls.unit(ControlId::Brightness);
        unit.set(ControlId::Brightness, 10).unwrap();
        assert!(unit.set(ControlId::Brightness, 1000).is_err());
        assert_eq!(camera.control_value(ControlId::Brightness), Some(10));
        assert!(matches!(
            controls.unit(ControlId::Zoom).get(ControlId::Zoom),
            Err(CameraError::ControlNotSupported(ControlId::Zoom))
        ));
    }

    #[tokio::test]
    async fn configure_rejects_unadvertised_format() {
        let driver = SimDriver::new();
        let camera = SimCamera::builder("/dev/video0")
            .format(FormatDescriptor::new(1280, 720, FourCC::YUYV))
            .build();
        driver.plug(camera.clone());
        let (mut handle, _controls) = driver.open(&camera.descriptor()).unwrap();

        let wanted = FormatDescriptor::new(1920, 1080, FourCC::MJPEG);
        assert!(matches!(
            handle.configure(&wanted, 4).await,
            Err(CameraError::UnsupportedFormat { .. })
        ));

        let mut stream = handle
            .configure(&FormatDescriptor::new(1280, 720, FourCC::YUYV), 4)
            .await
            .unwrap();
        stream.start().await.unwrap();
        let frame = stream.next_frame().await.unwrap();
        assert_eq!(frame.data.len(), 1280 * 720 * 2);
    }
}
