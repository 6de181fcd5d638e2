//! 帧到图像的转换与编码 (静态图、录像转码共用)

use std::io::Write;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageFormat, RgbImage};

use uvcam_core::error::{CameraError, Result};
use uvcam_core::frame::Frame;
use uvcam_core::pixel_format::FourCC;

fn encode_err(e: image::ImageError) -> CameraError {
    CameraError::Encode(e.to_string())
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 YCbCr -> RGB (整数近似)
#[inline]
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// 打包 4:2:2 (YUYV / UYVY) 转 RGB24
fn packed_422_to_rgb(data: &[u8], width: u32, height: u32, uyvy: bool) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 2 {
        return Err(CameraError::Encode(format!(
            "short 4:2:2 payload: {} bytes for {}x{}",
            data.len(),
            width,
            height
        )));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = if uyvy {
            (quad[1], quad[0], quad[3], quad[2])
        } else {
            (quad[0], quad[1], quad[2], quad[3])
        };
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

/// 把一帧解码/转换成 RGB 图像
pub fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    let (w, h) = (frame.width, frame.height);
    let rgb = match frame.format.fourcc() {
        Some(FourCC::YUYV) => packed_422_to_rgb(frame.data(), w, h, false)?,
        Some(FourCC::UYVY) => packed_422_to_rgb(frame.data(), w, h, true)?,
        Some(FourCC::RGB3) => frame.data().to_vec(),
        Some(FourCC::MJPEG) => {
            return image::load_from_memory_with_format(frame.data(), ImageFormat::Jpeg)
                .map(|img| img.to_rgb8())
                .map_err(encode_err);
        }
        _ => {
            return Err(CameraError::Encode(format!(
                "no decoder for {:?}",
                frame.format
            )))
        }
    };

    RgbImage::from_raw(w, h, rgb)
        .ok_or_else(|| CameraError::Encode("frame buffer does not match its dimensions".into()))
}

/// 以 JPEG 写出一帧；MJPEG 负载本身就是 JPEG，直接写
pub fn write_jpeg<W: Write>(out: &mut W, frame: &Frame, quality: u8) -> Result<usize> {
    if frame.format == FourCC::MJPEG {
        out.write_all(frame.data())?;
        return Ok(frame.len());
    }

    let rgb = frame_to_rgb(frame)?;
    let mut encoded = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut encoded, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(encode_err)?;
    out.write_all(&encoded)?;
    Ok(encoded.len())
}

fn is_jpeg_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// 保存静态图
///
/// 根据文件扩展名决定格式，JPEG 路径走 `write_jpeg`。
pub fn imwrite(path: &Path, frame: &Frame, quality: u8) -> Result<()> {
    if is_jpeg_path(path) {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        write_jpeg(&mut file, frame, quality)?;
        file.flush()?;
        return Ok(());
    }

    let rgb = frame_to_rgb(frame)?;
    rgb.save(path).map_err(encode_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uvcam_core::frame::{PooledBuffer, Timestamp};

    fn yuyv(width: u32, height: u32, y: u8) -> Frame {
        let data = [y, 128].repeat((width * height) as usize);
        Frame::new(
            0,
            Timestamp {
                hw_raw_ns: 0,
                arrival: Duration::ZERO,
            },
            width,
            height,
            FourCC::YUYV.into(),
            PooledBuffer::unpooled(data),
        )
    }

    #[test]
    fn neutral_chroma_is_gray() {
        let rgb = frame_to_rgb(&yuyv(4, 2, 235)).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 255, 255]);

        let rgb = frame_to_rgb(&yuyv(4, 2, 16)).unwrap();
        assert_eq!(rgb.get_pixel(3, 1).0, [0, 0, 0]);
    }

    #[test]
    fn short_payload_is_rejected() {
        let mut frame = yuyv(4, 2, 100);
        frame.height = 8;
        assert!(matches!(frame_to_rgb(&frame), Err(CameraError::Encode(_))));
    }

    #[test]
    fn jpeg_output_has_soi_marker() {
        let mut out = Vec::new();
        write_jpeg(&mut out, &yuyv(16, 16, 120), 80).unwrap();
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
    }
}
