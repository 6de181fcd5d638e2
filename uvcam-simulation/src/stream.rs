use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use uvcam_core::device::FormatDescriptor;
use uvcam_core::error::{CameraError, Result};
use uvcam_core::frame::RawFrame;
use uvcam_core::pixel_format::{FourCC, PixelFormat};
use uvcam_core::time::monotonic_now;
use uvcam_core::traits::Stream;

use crate::camera::SimCamera;

/// 仿真传输流：按设定帧率产出合成帧
pub(crate) struct SimStream {
    camera: Arc<SimCamera>,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// MJPEG 模式下的固定 JPEG 负载
    jpeg: Vec<u8>,
    buf: Vec<u8>,
    started: bool,
}

impl SimStream {
    pub(crate) fn new(camera: Arc<SimCamera>, format: &FormatDescriptor) -> Result<Self> {
        let jpeg = if format.format == FourCC::MJPEG {
            encode_test_card(format.width, format.height)?
        } else {
            Vec::new()
        };

        Ok(Self {
            camera,
            width: format.width,
            height: format.height,
            format: format.format,
            jpeg,
            buf: Vec::new(),
            started: false,
        })
    }

    /// YUYV 合成帧：亮度随帧序号滚动，方便肉眼确认帧在刷新
    fn render_yuyv(&mut self, sequence: u64) {
        let size = self
            .format
            .frame_size(self.width, self.height)
            .unwrap_or(self.width as usize * self.height as usize * 2);
        self.buf.resize(size, 0);

        let shift = (sequence % 256) as u8;
        for (i, px) in self.buf.chunks_exact_mut(2).enumerate() {
            let x = (i % self.width.max(1) as usize) as u8;
            px[0] = x.wrapping_add(shift); // Y
            px[1] = 128; // U / V 交替，置中性色
        }
    }
}

fn encode_test_card(width: u32, height: u32) -> Result<Vec<u8>> {
    let gray: Vec<u8> = (0..width * height)
        .map(|i| ((i % width.max(1)) * 255 / width.max(1)) as u8)
        .collect();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, 75)
        .encode(&gray, width, height, ColorType::L8)
        .map_err(|e| CameraError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

#[async_trait]
impl Stream for SimStream {
    async fn start(&mut self) -> Result<()> {
        self.camera.ensure_connected()?;
        self.started = true;
        self.camera.set_streaming(true);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.camera.set_streaming(false);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<RawFrame<'_>> {
        if !self.started {
            return Err(CameraError::Io(std::io::Error::other("Stream not started")));
        }

        let behaviour = self.camera.behaviour();
        let interval = Duration::from_secs(1) / behaviour.fps.max(1);
        tokio::time::sleep(interval).await;

        self.camera.ensure_connected()?;
        if self.camera.take_timeout() {
            return Err(CameraError::timeout("VIDIOC_DQBUF", interval));
        }
        let sequence = self.camera.next_sequence();
        if let Some(limit) = behaviour.fail_after_frames {
            if sequence >= limit {
                return Err(CameraError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "simulated isochronous transfer failure",
                )));
            }
        }

        if self.format == FourCC::MJPEG {
            self.buf.clear();
            self.buf.extend_from_slice(&self.jpeg);
        } else {
            self.render_yuyv(sequence);
        }

        Ok(RawFrame {
            data: &self.buf,
            width: self.width,
            height: self.height,
            format: self.format,
            sequence,
            hw_timestamp_ns: monotonic_now().as_nanos() as u64,
        })
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        if self.started {
            self.camera.set_streaming(false);
        }
    }
}
