use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use v4l::buffer::Type;

// 同时引入 Stream (用于 start/stop) 和 CaptureStream (用于 next)
use v4l::io::traits::{CaptureStream, Stream as V4lStream};

use uvcam_core::error::{CameraError, Result};
use uvcam_core::frame::RawFrame;
use uvcam_core::pixel_format::PixelFormat;
use uvcam_core::traits::Stream;

use crate::device::map_io;

/// 会话设置帧超时之前的 DQBUF 等待上限
const DEFAULT_DQBUF_TIMEOUT: Duration = Duration::from_millis(500);

pub struct V4l2Stream {
    inner: v4l::io::mmap::Stream<'static>,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    is_streaming: bool,
    // 缓冲区已全部入队并 STREAMON (由第一次 inner.next() 完成)
    primed: bool,
    rearm: bool,
    frame_timeout: Duration,
    dev: Arc<v4l::Device>,
}

// mmap 缓冲区只在持有 &mut self 时被访问
unsafe impl Send for V4l2Stream {}

impl V4l2Stream {
    pub fn new(dev: Arc<v4l::Device>, path: &str, fmt: &v4l::Format, buf_count: usize) -> Result<Self> {
        let mut stream =
            v4l::io::mmap::Stream::with_buffers(&dev, Type::VideoCapture, buf_count as u32)
                .map_err(|e| map_io(path, e))?;
        stream.set_timeout(DEFAULT_DQBUF_TIMEOUT);

        Ok(Self {
            inner: stream,
            path: path.to_string(),
            width: fmt.width,
            height: fmt.height,
            format: crate::pixel_map::from_v4l_fourcc(fmt.fourcc),
            is_streaming: false,
            primed: false,
            rearm: false,
            frame_timeout: DEFAULT_DQBUF_TIMEOUT,
            dev,
        })
    }
}

#[async_trait]
impl Stream for V4l2Stream {
    async fn start(&mut self) -> Result<()> {
        // STREAMON 推迟到第一次取帧：inner.next() 会先把全部缓冲区入队再开流
        self.is_streaming = true;
        self.primed = false;
        self.rearm = false;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.is_streaming = false;
        if self.primed || self.rearm {
            self.primed = false;
            self.rearm = false;
            V4lStream::stop(&mut self.inner).map_err(|e| map_io(&self.path, e))?;
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<RawFrame<'_>> {
        if !self.is_streaming {
            return Err(CameraError::Io(io::Error::other("Stream not started")));
        }

        if self.rearm {
            // 首帧超时后缓冲区仍在驱动队列里：STREAMOFF 全部收回，由 inner.next() 重新入队开流
            self.rearm = false;
            V4lStream::stop(&mut self.inner).map_err(|e| map_io(&self.path, e))?;
        }
        // inner.next() 会先把上一帧的缓冲区重新入队；DQBUF 超时后再调用就会重复入队。
        // 所以开流之后先自己等可读，超时直接返回，不碰 inner 的状态
        if self.primed {
            let handle = self.dev.handle();
            let timeout_ms = self.frame_timeout.as_millis().min(i32::MAX as u128) as i32;
            let ready = tokio::task::block_in_place(|| handle.poll(libc::POLLIN, timeout_ms))
                .map_err(|e| map_io(&self.path, e))?;
            if ready == 0 {
                return Err(CameraError::timeout("VIDIOC_DQBUF", self.frame_timeout));
            }
        }

        // DQBUF 是阻塞调用，让运行时把其他任务挪走
        let first = !self.primed;
        let path = &self.path;
        let inner = &mut self.inner;
        let (buf, meta) = match tokio::task::block_in_place(move || inner.next()) {
            Ok(v) => v,
            Err(e) => {
                if first && e.kind() == io::ErrorKind::TimedOut {
                    self.rearm = true;
                }
                return Err(map_io(path, e));
            }
        };
        self.primed = true;

        let hw_ns = (meta.timestamp.sec as u64 * 1_000_000_000) + (meta.timestamp.usec as u64 * 1_000);
        let used = (meta.bytesused as usize).min(buf.len());

        Ok(RawFrame {
            data: &buf[..used],
            width: self.width,
            height: self.height,
            format: self.format,
            sequence: meta.sequence as u64,
            hw_timestamp_ns: hw_ns,
        })
    }

    fn set_frame_timeout(&mut self, timeout: Duration) {
        // DQBUF 阻塞在 block_in_place 里，外层的 tokio 超时无法打断它
        self.frame_timeout = timeout;
        self.inner.set_timeout(timeout);
    }
}
