use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::controls::ControlId;
use crate::pixel_format::PixelFormat;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Format negotiation failed: device does not advertise {width}x{height} {format:?}")]
    UnsupportedFormat {
        width: u32,
        height: u32,
        format: PixelFormat,
    },

    #[error("Device busy: Exclusive access required")]
    DeviceBusy,

    #[error("Device disconnected: {0}")]
    DeviceGone(String),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Session is not previewing")]
    NotPreviewing,

    #[error("Permission request already pending for {0}")]
    AlreadyPending(String),

    #[error("{control:?} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        control: ControlId,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("Control {0:?} is not exposed by this device")]
    ControlNotSupported(ControlId),

    #[error("Session is not open")]
    NotOpen,

    /// 会话处于 Error 状态，只接受 close
    #[error("Session faulted: {0}")]
    Faulted(String),

    #[error("Encoder error: {0}")]
    Encode(String),

    #[error("Session worker terminated")]
    SessionTerminated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CameraError {
    /// 超时统一表现为 `Io(TimedOut)`
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", operation, after),
        ))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// 传输层/硬件层故障：会话需要进入 Error 状态
    pub fn is_hardware_fault(&self) -> bool {
        matches!(self, Self::Io(_) | Self::DeviceGone(_))
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_an_io_error() {
        let err = CameraError::timeout("open", Duration::from_millis(250));
        assert!(err.is_timeout());
        assert!(err.is_hardware_fault());
        assert!(err.to_string().contains("open timed out"));
    }

    #[test]
    fn caller_errors_are_not_faults() {
        assert!(!CameraError::NotPreviewing.is_hardware_fault());
        assert!(!CameraError::AlreadyRecording.is_timeout());
        assert!(CameraError::DeviceGone("/dev/video0".into()).is_hardware_fault());
    }
}
