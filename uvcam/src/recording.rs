//! 录像：一次只有一个 RecordingJob，编码器在任何退出路径上都会被收尾

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uvcam_core::builder::EncoderKind;
use uvcam_core::error::{CameraError, Result};
use uvcam_core::frame::Frame;

use crate::imgcodecs;

/// 编码器：接收帧并写出到文件
pub trait FrameEncoder: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// 刷新并关闭输出，返回写出的字节数
    fn finish(&mut self) -> Result<u64>;
}

/// 负载原样写出
struct PassthroughEncoder {
    out: Option<BufWriter<File>>,
    bytes: u64,
}

impl FrameEncoder for PassthroughEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let out = self.out.as_mut().ok_or_else(finished)?;
        out.write_all(frame.data())?;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        Ok(self.bytes)
    }
}

/// 每帧转成 JPEG，输出 MJPEG 码流
struct TranscodeEncoder {
    out: Option<BufWriter<File>>,
    quality: u8,
    bytes: u64,
}

impl FrameEncoder for TranscodeEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let out = self.out.as_mut().ok_or_else(finished)?;
        self.bytes += imgcodecs::write_jpeg(out, frame, self.quality)? as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        Ok(self.bytes)
    }
}

fn finished() -> CameraError {
    CameraError::Encode("encoder already finalized".into())
}

fn create_encoder(path: &Path, kind: EncoderKind, quality: u8) -> Result<Box<dyn FrameEncoder>> {
    let out = Some(BufWriter::new(File::create(path)?));
    Ok(match kind {
        EncoderKind::Passthrough => Box::new(PassthroughEncoder { out, bytes: 0 }),
        EncoderKind::Transcode => Box::new(TranscodeEncoder {
            out,
            quality,
            bytes: 0,
        }),
    })
}

/// 录像结束后的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    pub duration: Duration,
    /// 录像因编码错误提前结束时的原因
    pub error: Option<String>,
}

/// 录像进行中的状态 (UI 的录像计时器读这个)
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStatus {
    pub path: PathBuf,
    pub elapsed: Duration,
    pub frames: u64,
}

/// 一次录像
///
/// 只在会话处于 Recording 时存在。drop 时若尚未 finish，会尽力收尾编码器。
pub struct RecordingJob {
    path: PathBuf,
    started: Instant,
    encoder: Box<dyn FrameEncoder>,
    frames: u64,
    error: Option<String>,
    finalized: bool,
}

impl RecordingJob {
    pub fn create(path: impl Into<PathBuf>, kind: EncoderKind, quality: u8) -> Result<Self> {
        let path = path.into();
        let encoder = create_encoder(&path, kind, quality)?;
        tracing::info!(target: "uvcam::recording", "recording started: {}", path.display());
        Ok(Self {
            path,
            started: Instant::now(),
            encoder,
            frames: 0,
            error: None,
            finalized: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.error.is_some() {
            return Ok(());
        }
        match self.encoder.write_frame(frame) {
            Ok(()) => {
                self.frames += 1;
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn status(&self) -> RecordingStatus {
        RecordingStatus {
            path: self.path.clone(),
            elapsed: self.started.elapsed(),
            frames: self.frames,
        }
    }

    /// 收尾：刷新并关闭输出
    pub fn finish(mut self) -> RecordingSummary {
        self.finalize()
    }

    fn finalize(&mut self) -> RecordingSummary {
        self.finalized = true;
        let bytes = match self.encoder.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.error.get_or_insert_with(|| e.to_string());
                0
            }
        };

        let summary = RecordingSummary {
            path: self.path.clone(),
            frames: self.frames,
            bytes,
            duration: self.started.elapsed(),
            error: self.error.clone(),
        };
        tracing::info!(
            target: "uvcam::recording",
            frames = summary.frames,
            bytes = summary.bytes,
            "recording finished: {}",
            summary.path.display()
        );
        summary
    }
}

impl Drop for RecordingJob {
    fn drop(&mut self) {
        if !self.finalized {
            tracing::warn!(target: "uvcam::recording", "recording {} dropped without stop, finalizing", self.path.display());
            let _ = self.finalize();
        }
    }
}

impl std::fmt::Debug for RecordingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingJob")
            .field("path", &self.path)
            .field("frames", &self.frames)
            .field("error", &self.error)
            .finish()
    }
}

/// 持有当前录像，投递线程经由它喂帧，会话 worker 经由它开始/结束
#[derive(Debug)]
pub struct RecordingController {
    encoder: EncoderKind,
    quality: u8,
    job: Mutex<Option<RecordingJob>>,
}

impl RecordingController {
    pub fn new(encoder: EncoderKind, quality: u8) -> Self {
        Self {
            encoder,
            quality,
            job: Mutex::new(None),
        }
    }

    pub fn start(&self, path: impl Into<PathBuf>) -> Result<()> {
        let mut job = self.lock()?;
        if job.is_some() {
            return Err(CameraError::AlreadyRecording);
        }
        *job = Some(RecordingJob::create(path, self.encoder, self.quality)?);
        Ok(())
    }

    /// 投递线程调用；编码失败后本次录像不再接收帧
    pub fn feed(&self, frame: &Frame) -> Result<()> {
        match self.lock()?.as_mut() {
            Some(job) => job.write(frame),
            None => Ok(()),
        }
    }

    /// 结束录像，未在录像时返回 None
    pub fn stop(&self) -> Option<RecordingSummary> {
        let job = self.lock().ok()?.take()?;
        Some(job.finish())
    }

    pub fn is_recording(&self) -> bool {
        self.lock().map(|j| j.is_some()).unwrap_or(false)
    }

    pub fn status(&self) -> Option<RecordingStatus> {
        self.lock().ok()?.as_ref().map(RecordingJob::status)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<RecordingJob>>> {
        self.job
            .lock()
            .map_err(|_| CameraError::Io(std::io::Error::other("recording state poisoned")))
    }
}
