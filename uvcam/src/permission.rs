//! 设备访问授权
//!
//! 真正的授权界面不在本库里：调用方实现 [`PermissionPrompt`]，拿到
//! [`PermissionResponder`] 后在任意线程上回答。一个设备同时最多只有一个挂起请求，
//! 设备拔出时挂起的请求立即以 `Cancelled` 结束。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tokio::sync::oneshot;

use uvcam_core::device::DeviceDescriptor;
use uvcam_core::error::{CameraError, Result};

use crate::enumerator::DeviceObserver;
use crate::internal::runtime;

/// 打开会话的凭据，只能由 PermissionGate 签发
#[derive(Debug)]
pub struct AccessGrant {
    descriptor: DeviceDescriptor,
    request_id: u64,
}

impl AccessGrant {
    pub(crate) fn new(descriptor: DeviceDescriptor, request_id: u64) -> Self {
        Self {
            descriptor,
            request_id,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

#[derive(Debug)]
pub enum AccessOutcome {
    Granted(AccessGrant),
    Denied,
    /// 用户未作答、设备被拔出或授权方已退出
    Cancelled,
}

impl AccessOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn into_grant(self) -> Option<AccessGrant> {
        match self {
            Self::Granted(grant) => Some(grant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Grant,
    Deny,
    Cancel,
}

/// 授权界面
pub trait PermissionPrompt: Send + Sync {
    /// 向用户询问；responder 可以被移交到其他线程稍后回答
    fn prompt(&self, device: &DeviceDescriptor, responder: PermissionResponder);
}

impl<F> PermissionPrompt for F
where
    F: Fn(&DeviceDescriptor, PermissionResponder) + Send + Sync,
{
    fn prompt(&self, device: &DeviceDescriptor, responder: PermissionResponder) {
        self(device, responder)
    }
}

/// 对所有设备直接授权 (无界面的嵌入式场景、演示程序)
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoGrant;

impl PermissionPrompt for AutoGrant {
    fn prompt(&self, _device: &DeviceDescriptor, responder: PermissionResponder) {
        responder.grant();
    }
}

/// 对单个挂起请求的一次性回答
///
/// 未作答就被 drop 时，请求以 `Cancelled` 结束。
#[derive(Debug)]
pub struct PermissionResponder {
    gate: Weak<GateInner>,
    key: String,
    request_id: u64,
    answered: bool,
}

impl PermissionResponder {
    pub fn device_path(&self) -> &str {
        &self.key
    }

    pub fn grant(mut self) {
        self.answer(Decision::Grant);
    }

    pub fn deny(mut self) {
        self.answer(Decision::Deny);
    }

    fn answer(&mut self, decision: Decision) {
        self.answered = true;
        if let Some(gate) = self.gate.upgrade() {
            gate.resolve(&self.key, self.request_id, decision);
        }
    }
}

impl Drop for PermissionResponder {
    fn drop(&mut self) {
        if !self.answered {
            self.answer(Decision::Cancel);
        }
    }
}

/// 挂起中的授权请求
///
/// 可以 `.await`，也可以 `wait()`。`wait()` 经后台运行时转发结果，
/// 在 tokio 任务里调用也不会 panic，但会阻塞当前线程。
#[derive(Debug)]
pub struct AccessRequest {
    device: DeviceDescriptor,
    rx: oneshot::Receiver<AccessOutcome>,
}

impl AccessRequest {
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// 阻塞等待结果
    pub fn wait(self) -> AccessOutcome {
        self.forward().recv().unwrap_or(AccessOutcome::Cancelled)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<AccessOutcome> {
        match self.forward().recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => Err(CameraError::timeout("request_access", timeout)),
            Err(RecvTimeoutError::Disconnected) => Ok(AccessOutcome::Cancelled),
        }
    }

    // 在后台运行时上等 oneshot，结果转进 crossbeam 通道，和 Pending 一样在普通阻塞通道上等
    fn forward(self) -> Receiver<AccessOutcome> {
        let (tx, rx) = bounded(1);
        runtime::get_runtime().spawn(async move {
            let _ = tx.send(self.await);
        });
        rx
    }
}

impl Future for AccessRequest {
    type Output = AccessOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(AccessOutcome::Cancelled))
    }
}

struct PendingRequest {
    id: u64,
    descriptor: DeviceDescriptor,
    tx: oneshot::Sender<AccessOutcome>,
}

struct GateInner {
    prompt: Arc<dyn PermissionPrompt>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_id: AtomicU64,
}

impl GateInner {
    fn resolve(&self, key: &str, request_id: u64, decision: Decision) {
        let request = match self.pending.lock() {
            Ok(mut pending) => match pending.get(key) {
                // 过期的 responder (请求已因拔出而取消) 不影响新请求
                Some(req) if req.id == request_id => pending.remove(key),
                _ => None,
            },
            Err(_) => None,
        };

        let Some(request) = request else {
            return;
        };

        tracing::debug!(target: "uvcam::permission", "{} -> {:?}", key, decision);
        let outcome = match decision {
            Decision::Grant => AccessOutcome::Granted(AccessGrant::new(request.descriptor, request.id)),
            Decision::Deny => AccessOutcome::Denied,
            Decision::Cancel => AccessOutcome::Cancelled,
        };
        // 请求方可能已经不再等待
        let _ = request.tx.send(outcome);
    }
}

/// 授权门
#[derive(Clone)]
pub struct PermissionGate {
    inner: Arc<GateInner>,
}

impl PermissionGate {
    pub fn new(prompt: Arc<dyn PermissionPrompt>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                prompt,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// 发起授权请求
    ///
    /// 同一设备已有挂起请求时返回 `AlreadyPending`。
    pub fn request_access(&self, device: &DeviceDescriptor) -> Result<AccessRequest> {
        let key = device.key().to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .map_err(|_| CameraError::Io(std::io::Error::other("permission state poisoned")))?;
            if pending.contains_key(&key) {
                return Err(CameraError::AlreadyPending(key));
            }
            pending.insert(
                key.clone(),
                PendingRequest {
                    id,
                    descriptor: device.clone(),
                    tx,
                },
            );
        }

        tracing::info!(target: "uvcam::permission", "requesting access to {} ({})", device.name, key);
        let responder = PermissionResponder {
            gate: Arc::downgrade(&self.inner),
            key,
            request_id: id,
            answered: false,
        };
        // 不持锁调用，prompt 可以同步作答
        self.inner.prompt.prompt(device, responder);

        Ok(AccessRequest {
            device: device.clone(),
            rx,
        })
    }

    /// 发起请求，并在结果出来后于后台运行时上回调
    pub fn request_access_with<F>(&self, device: &DeviceDescriptor, callback: F) -> Result<()>
    where
        F: FnOnce(AccessOutcome) + Send + 'static,
    {
        let request = self.request_access(device)?;
        runtime::get_runtime().spawn(async move {
            callback(request.await);
        });
        Ok(())
    }

    /// 设备被拔出：挂起的请求立即以 Cancelled 结束
    pub fn device_detached(&self, path: &str) -> bool {
        let request = self
            .inner
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(path));

        match request {
            Some(request) => {
                tracing::info!(target: "uvcam::permission", "{} detached, pending request cancelled", path);
                let _ = request.tx.send(AccessOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.inner
            .pending
            .lock()
            .map(|p| p.contains_key(path))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl DeviceObserver for PermissionGate {
    fn on_attach(&self, _device: &DeviceDescriptor) {}

    fn on_detach(&self, device: &DeviceDescriptor) {
        self.device_detached(device.key());
    }
}
