//! 设备枚举与热插拔监视

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use uvcam_core::device::{DeviceDescriptor, DeviceFilter};
use uvcam_core::error::{CameraError, Result};
use uvcam_core::traits::Driver;

use crate::internal::runtime;

/// 热插拔观察者
///
/// 回调在 rescan 的调用线程上执行 (监视器运行时为后台线程)，不持有枚举器的锁。
pub trait DeviceObserver: Send + Sync {
    fn on_attach(&self, device: &DeviceDescriptor);
    fn on_detach(&self, device: &DeviceDescriptor);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(DeviceDescriptor),
    Detached(DeviceDescriptor),
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceDescriptor {
        match self {
            Self::Attached(d) | Self::Detached(d) => d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 可重复遍历的设备序列，每次 `iter` 都重新查询系统
#[derive(Clone)]
pub struct Devices {
    driver: Arc<dyn Driver>,
    filter: DeviceFilter,
}

impl Devices {
    pub fn iter(&self) -> Result<std::vec::IntoIter<DeviceDescriptor>> {
        Ok(query(self.driver.as_ref(), &self.filter)?.into_iter())
    }
}

impl std::fmt::Debug for Devices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Devices")
            .field("driver", &self.driver.name())
            .field("filter", &self.filter)
            .finish()
    }
}

fn query(driver: &dyn Driver, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>> {
    Ok(driver
        .list_devices()?
        .into_iter()
        .filter(|d| filter.matches(d))
        .collect())
}

struct EnumInner {
    driver: Arc<dyn Driver>,
    filter: DeviceFilter,
    /// 上一次 rescan 时在场的设备，按路径
    present: Mutex<BTreeMap<String, DeviceDescriptor>>,
    observers: Mutex<Vec<(u64, Arc<dyn DeviceObserver>)>>,
    next_id: AtomicU64,
}

/// 设备枚举器
///
/// `list`/`devices` 是无状态查询；`rescan` 与当前在场集合比较，只上报边沿：
/// 设备持续在场时重复 rescan 不会再次触发 attach。
#[derive(Clone)]
pub struct DeviceEnumerator {
    inner: Arc<EnumInner>,
}

impl DeviceEnumerator {
    /// `filter` 用于 rescan 与监视器
    pub fn new(driver: Arc<dyn Driver>, filter: DeviceFilter) -> Self {
        Self {
            inner: Arc::new(EnumInner {
                driver,
                filter,
                present: Mutex::new(BTreeMap::new()),
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub fn list(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>> {
        query(self.inner.driver.as_ref(), filter)
    }

    pub fn devices(&self, filter: DeviceFilter) -> Devices {
        Devices {
            driver: self.inner.driver.clone(),
            filter,
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn DeviceObserver>) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.push((id, observer));
        }
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.inner.observers.lock() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(i, _)| *i != id.0);
                observers.len() != before
            }
            Err(_) => false,
        }
    }

    /// 当前已知在场的设备 (上一次 rescan 的结果)
    pub fn present(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .present
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 重新查询并通知观察者，先 detach 后 attach
    pub fn rescan(&self) -> Result<Vec<DeviceEvent>> {
        let current = query(self.inner.driver.as_ref(), &self.inner.filter)?;

        let mut events = Vec::new();
        {
            let mut present = self
                .inner
                .present
                .lock()
                .map_err(|_| CameraError::Io(std::io::Error::other("enumerator state poisoned")))?;

            let mut next = BTreeMap::new();
            for device in current {
                next.insert(device.key().to_string(), device);
            }

            for (key, device) in present.iter() {
                if !next.contains_key(key) {
                    events.push(DeviceEvent::Detached(device.clone()));
                }
            }
            for (key, device) in next.iter() {
                if !present.contains_key(key) {
                    events.push(DeviceEvent::Attached(device.clone()));
                }
            }
            *present = next;
        }

        if events.is_empty() {
            return Ok(events);
        }

        let observers: Vec<Arc<dyn DeviceObserver>> = self
            .inner
            .observers
            .lock()
            .map(|o| o.iter().map(|(_, obs)| obs.clone()).collect())
            .unwrap_or_default();

        for event in &events {
            match event {
                DeviceEvent::Attached(d) => {
                    tracing::info!(target: "uvcam::enumerator", "attached: {} [{:04x}:{:04x}] {}", d.path, d.vendor_id, d.product_id, d.name);
                    observers.iter().for_each(|o| o.on_attach(d));
                }
                DeviceEvent::Detached(d) => {
                    tracing::info!(target: "uvcam::enumerator", "detached: {}", d.path);
                    observers.iter().for_each(|o| o.on_detach(d));
                }
            }
        }
        Ok(events)
    }

    /// 在后台运行时上周期性 rescan，直到句柄被停止或 drop
    pub fn spawn_monitor(&self, interval: Duration) -> MonitorHandle {
        let this = self.clone();
        let task = runtime::get_runtime().spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let scanner = this.clone();
                // 后端查询与观察者回调都可能阻塞
                match tokio::task::spawn_blocking(move || scanner.rescan()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(target: "uvcam::enumerator", "rescan failed: {}", e),
                    Err(e) => tracing::error!(target: "uvcam::enumerator", "rescan task panicked: {}", e),
                }
            }
        });
        tracing::debug!(target: "uvcam::enumerator", "monitor started, interval {:?}", interval);
        MonitorHandle { task: Some(task) }
    }
}

impl std::fmt::Debug for DeviceEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEnumerator")
            .field("driver", &self.inner.driver.name())
            .field("filter", &self.inner.filter)
            .finish()
    }
}

/// 热插拔监视器句柄
#[derive(Debug)]
pub struct MonitorHandle {
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.abort();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(target: "uvcam::enumerator", "monitor stopped");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uvcam_core::device::DeviceCapabilities;
    use uvcam_simulation::{SimCamera, SimDriver};

    #[derive(Default)]
    struct Counter {
        attached: AtomicUsize,
        detached: AtomicUsize,
    }

    impl DeviceObserver for Counter {
        fn on_attach(&self, _device: &DeviceDescriptor) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }

        fn on_detach(&self, _device: &DeviceDescriptor) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rescan_reports_edges_only() {
        let driver = SimDriver::new();
        let enumerator = DeviceEnumerator::new(Arc::new(driver.clone()), DeviceFilter::uvc());
        let counter = Arc::new(Counter::default());
        enumerator.subscribe(counter.clone());

        driver.plug(SimCamera::webcam("/dev/video0"));
        assert_eq!(enumerator.rescan().unwrap().len(), 1);
        assert!(enumerator.rescan().unwrap().is_empty());
        assert!(enumerator.rescan().unwrap().is_empty());
        assert_eq!(counter.attached.load(Ordering::SeqCst), 1);

        driver.unplug("/dev/video0");
        let events = enumerator.rescan().unwrap();
        assert!(matches!(&events[..], [DeviceEvent::Detached(d)] if d.path == "/dev/video0"));
        assert_eq!(counter.detached.load(Ordering::SeqCst), 1);

        // 重新插入是新的 attach 边沿
        driver.plug(SimCamera::webcam("/dev/video0"));
        enumerator.rescan().unwrap();
        assert_eq!(counter.attached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn filter_applies_to_every_query() {
        let driver = SimDriver::new();
        driver.plug(SimCamera::builder("/dev/video0").vendor(0x046d).build());
        driver.plug(
            SimCamera::builder("/dev/video1")
                .vendor(0x1234)
                .capabilities(DeviceCapabilities::CONTROLS)
                .build(),
        );
        let enumerator = DeviceEnumerator::new(Arc::new(driver.clone()), DeviceFilter::uvc());

        assert_eq!(enumerator.list(&DeviceFilter::any()).unwrap().len(), 2);
        assert_eq!(enumerator.list(&DeviceFilter::uvc()).unwrap().len(), 1);
        assert!(enumerator
            .list(&DeviceFilter::any().vendor(0x046d).excluding())
            .unwrap()
            .iter()
            .all(|d| d.vendor_id != 0x046d));

        let devices = enumerator.devices(DeviceFilter::uvc());
        assert_eq!(devices.iter().unwrap().count(), 1);
        driver.plug(SimCamera::webcam("/dev/video2"));
        assert_eq!(devices.iter().unwrap().count(), 2);
    }

    #[test]
    fn unsubscribed_observer_is_not_called() {
        let driver = SimDriver::new();
        let enumerator = DeviceEnumerator::new(Arc::new(driver.clone()), DeviceFilter::uvc());
        let counter = Arc::new(Counter::default());
        let id = enumerator.subscribe(counter.clone());
        assert!(enumerator.unsubscribe(id));
        assert!(!enumerator.unsubscribe(id));

        driver.plug(SimCamera::webcam("/dev/video0"));
        enumerator.rescan().unwrap();
        assert_eq!(counter.attached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn monitor_picks_up_hotplug() {
        let driver = SimDriver::new();
        let enumerator = DeviceEnumerator::new(Arc::new(driver.clone()), DeviceFilter::uvc());
        let counter = Arc::new(Counter::default());
        enumerator.subscribe(counter.clone());

        let monitor = enumerator.spawn_monitor(Duration::from_millis(10));
        driver.plug(SimCamera::webcam("/dev/video0"));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.attached.load(Ordering::SeqCst), 1);

        monitor.stop();
        // 等可能还在执行的那次 rescan 结束
        std::thread::sleep(Duration::from_millis(50));
        driver.unplug("/dev/video0");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.detached.load(Ordering::SeqCst), 0);
    }
}
