use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::recording::RecordingSummary;
use crate::session::SessionState;

/// 会话事件，供 UI 层观察而不是维护平行的状态标志
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    StillSaved(PathBuf),
    StillFailed { path: PathBuf, reason: String },
    RecordingFinished(RecordingSummary),
    /// 传输层故障，随后会话进入 Error (或设备拔出时进入 Closed)
    TransferFault(String),
}

pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub(crate) struct EventHub {
    observers: Mutex<Vec<(u64, Arc<dyn SessionObserver>)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub(crate) fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, observer));
        }
        ObserverId(id)
    }

    pub(crate) fn unsubscribe(&self, id: ObserverId) -> bool {
        match self.observers.lock() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(i, _)| *i != id.0);
                observers.len() != before
            }
            Err(_) => false,
        }
    }

    /// 在调用线程上同步分发，不持锁
    pub(crate) fn emit(&self, event: SessionEvent) {
        let observers: Vec<Arc<dyn SessionObserver>> = match self.observers.lock() {
            Ok(o) if !o.is_empty() => o.iter().map(|(_, obs)| obs.clone()).collect(),
            _ => return,
        };
        for observer in observers {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.observers.lock().map(|o| o.len()).unwrap_or(0);
        f.debug_struct("EventHub").field("observers", &n).finish()
    }
}
