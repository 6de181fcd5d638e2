#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uvcam::prelude::*;
use uvcam_simulation::{SimCamera, SimDriver};

/// 插上一台摄像头的仿真总线
pub fn bus_with(camera: Arc<SimCamera>) -> (Arc<SimDriver>, Arc<SimCamera>) {
    let driver = Arc::new(SimDriver::new());
    driver.plug(camera.clone());
    (driver, camera)
}

/// 用 AutoGrant 走一遍授权，拿到 open 所需的凭据
pub fn grant(camera: &SimCamera) -> AccessGrant {
    let gate = PermissionGate::new(Arc::new(AutoGrant));
    gate.request_access(&camera.descriptor())
        .expect("request")
        .wait()
        .into_grant()
        .expect("granted")
}

pub fn config() -> SessionConfig {
    SessionConfig::new()
        .open_timeout(Duration::from_secs(2))
        .frame_timeout(Duration::from_millis(300))
}

/// 打开一个已授权的会话
pub fn open_session(driver: Arc<SimDriver>, camera: &SimCamera, config: SessionConfig) -> UvcSession {
    let session = UvcSession::new(driver, config).expect("session");
    assert_eq!(session.open(grant(camera)).expect("open"), SessionState::Opened);
    session
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// 记录所有会话事件
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<SessionEvent>>,
}

impl EventLog {
    pub fn attach(session: &UvcSession) -> Arc<Self> {
        let log = Arc::new(Self::default());
        session.subscribe(log.clone());
        log
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    pub fn recordings(&self) -> Vec<RecordingSummary> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::RecordingFinished(summary) => Some(summary.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn transfer_faults(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SessionEvent::TransferFault(_)))
            .count()
    }
}

impl SessionObserver for EventLog {
    fn on_event(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
