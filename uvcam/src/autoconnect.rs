//! 插入即预览：设备插入时申请授权，授权后打开会话并开始预览，拔出时收尾

use std::sync::{Arc, Mutex};

use uvcam_core::device::{DeviceDescriptor, DeviceFilter};
use uvcam_core::traits::Driver;

use crate::enumerator::DeviceObserver;
use crate::internal::runtime;
use crate::permission::{AccessOutcome, PermissionGate};
use crate::session::{SessionState, UvcSession};
use crate::sink::FrameSink;

/// 热插拔协调者
///
/// 只在总线上恰好有一台符合过滤条件的设备、且会话空闲时自动连接。
/// 订阅到 [`DeviceEnumerator`](crate::enumerator::DeviceEnumerator) 上使用。
pub struct AutoConnect {
    driver: Arc<dyn Driver>,
    filter: DeviceFilter,
    gate: PermissionGate,
    session: Arc<UvcSession>,
    sink: Arc<dyn FrameSink>,
    /// 正在连接或已连接的设备路径
    active: Arc<Mutex<Option<String>>>,
}

impl AutoConnect {
    pub fn new(
        driver: Arc<dyn Driver>,
        filter: DeviceFilter,
        gate: PermissionGate,
        session: Arc<UvcSession>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            driver,
            filter,
            gate,
            session,
            sink,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session(&self) -> &Arc<UvcSession> {
        &self.session
    }

    pub fn active_device(&self) -> Option<String> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    fn filtered_count(&self) -> usize {
        match self.driver.list_devices() {
            Ok(devices) => devices.iter().filter(|d| self.filter.matches(d)).count(),
            Err(e) => {
                tracing::warn!(target: "uvcam::autoconnect", "device query failed: {}", e);
                0
            }
        }
    }

    /// 占住 active 槽位，已被占用时返回 false
    fn reserve(&self, path: &str) -> bool {
        match self.active.lock() {
            Ok(mut active) if active.is_none() => {
                *active = Some(path.to_string());
                true
            }
            _ => false,
        }
    }
}

fn release(active: &Mutex<Option<String>>, path: &str) {
    if let Ok(mut active) = active.lock() {
        if active.as_deref() == Some(path) {
            *active = None;
        }
    }
}

impl DeviceObserver for AutoConnect {
    fn on_attach(&self, device: &DeviceDescriptor) {
        if !self.filter.matches(device) {
            return;
        }
        let count = self.filtered_count();
        if count != 1 {
            tracing::debug!(target: "uvcam::autoconnect", "{} candidate devices, not connecting automatically", count);
            return;
        }
        if self.session.state() != SessionState::Closed || !self.reserve(&device.path) {
            return;
        }

        let session = self.session.clone();
        let sink = self.sink.clone();
        let active = self.active.clone();
        let path = device.path.clone();

        let requested = self.gate.request_access_with(device, move |outcome| match outcome {
            AccessOutcome::Granted(grant) => {
                // 命令先入队，结果在阻塞线程池里等，不占用运行时的工作线程
                let open = session.submit_open(grant);
                let preview = session.submit_start_preview(sink);
                runtime::get_runtime().spawn_blocking(move || {
                    let result = open.wait().and_then(|_| preview.wait());
                    match result {
                        Ok(state) => {
                            tracing::info!(target: "uvcam::autoconnect", "{} connected ({:?})", path, state)
                        }
                        Err(e) => {
                            tracing::warn!(target: "uvcam::autoconnect", "auto connect to {} failed: {}", path, e);
                            let _ = session.close();
                            release(&active, &path);
                        }
                    }
                });
            }
            AccessOutcome::Denied | AccessOutcome::Cancelled => {
                tracing::info!(target: "uvcam::autoconnect", "access to {} not granted", path);
                release(&active, &path);
            }
        });

        if let Err(e) = requested {
            tracing::debug!(target: "uvcam::autoconnect", "access request for {} not sent: {}", device.path, e);
            release(&self.active, &device.path);
        }
    }

    fn on_detach(&self, device: &DeviceDescriptor) {
        self.gate.device_detached(&device.path);
        release(&self.active, &device.path);
        if self.session.device_detached(&device.path) {
            tracing::info!(target: "uvcam::autoconnect", "{} removed, closing session", device.path);
        }
    }
}

impl std::fmt::Debug for AutoConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoConnect")
            .field("driver", &self.driver.name())
            .field("filter", &self.filter)
            .field("active", &self.active_device())
            .field("session", &self.session)
            .finish()
    }
}
