use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use uvcam_core::error::{CameraError, Result};

// 进程内已被会话占用的设备
static CLAIMS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn claims() -> &'static Mutex<HashSet<String>> {
    CLAIMS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// 设备独占凭据，drop 时释放
#[derive(Debug)]
pub(crate) struct ClaimGuard {
    key: String,
}

/// 一个物理设备同一时刻只能属于一个会话
pub(crate) fn claim(key: &str) -> Result<ClaimGuard> {
    let mut set = claims()
        .lock()
        .map_err(|_| CameraError::Io(std::io::Error::other("claim registry poisoned")))?;

    if !set.insert(key.to_string()) {
        tracing::warn!(target: "uvcam::session", "{} is already claimed by another session", key);
        return Err(CameraError::DeviceBusy);
    }
    Ok(ClaimGuard {
        key: key.to_string(),
    })
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = claims().lock() {
            set.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let key = "/dev/registry-test0";
        let guard = claim(key).unwrap();
        assert!(matches!(claim(key), Err(CameraError::DeviceBusy)));
        drop(guard);
        assert!(claim(key).is_ok());
    }
}
