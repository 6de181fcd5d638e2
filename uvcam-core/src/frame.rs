use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::pixel_format::PixelFormat;

/// 后端产出的借用帧
/// 生命周期 'a 绑定到底层传输缓冲区 (mmap ring buffer)，离开 next_frame 前必须拷出。
#[derive(Debug)]
pub struct RawFrame<'a> {
    /// 本帧有效负载 (已按 bytesused 截断)
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// 驱动侧帧序号
    pub sequence: u64,
    /// 硬件原始时间戳 (纳秒，来源各异，可能为 0)
    pub hw_timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// 硬件原始时间戳 (纳秒)
    pub hw_raw_ns: u64,
    /// 帧到达用户态的单调时间 (相对进程锚点)
    pub arrival: Duration,
}

/// 会话投递给 FrameSink 的帧，独占其缓冲区
///
/// 缓冲区来自 [`FramePool`]。Frame 被 drop 时缓冲区归还池子，
/// 之后任何人都无法再读到它。
pub struct Frame {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    buffer: PooledBuffer,
}

impl Frame {
    pub fn new(
        sequence: u64,
        timestamp: Timestamp,
        width: u32,
        height: u32,
        format: PixelFormat,
        buffer: PooledBuffer,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            width,
            height,
            format,
            buffer,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// 取走数据，脱离缓冲池
    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.detach()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.sequence)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("format", &self.format)
            .field("bytes", &self.buffer.len())
            .finish()
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    /// 池中最多保留的空闲缓冲区数
    capacity: usize,
}

/// 帧缓冲回收池
///
/// 传输管线每帧都需要一块与帧等大的内存，回收可以避免 1080p 下
/// 每秒几十次的大块分配。
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// 取一块缓冲区并填入 data
    pub fn fill(&self, data: &[u8]) -> PooledBuffer {
        let mut buf = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default();

        buf.clear();
        buf.extend_from_slice(data);

        PooledBuffer {
            data: buf,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// 当前空闲缓冲区数
    pub fn available(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// 池化缓冲区，drop 时自动归还
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// 不属于任何池的缓冲区 (测试与仿真用)
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self {
            data,
            pool: Weak::new(),
        }
    }

    fn detach(mut self) -> Vec<u8> {
        self.pool = Weak::new();
        std::mem::take(&mut self.data)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let Ok(mut free) = pool.free.lock() else {
            return;
        };
        if free.len() < pool.capacity {
            free.push(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBuffer({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel_format::FourCC;

    fn frame(pool: &FramePool, seq: u64) -> Frame {
        Frame::new(
            seq,
            Timestamp {
                hw_raw_ns: 0,
                arrival: Duration::ZERO,
            },
            2,
            1,
            FourCC::YUYV.into(),
            pool.fill(&[1, 2, 3, 4]),
        )
    }

    #[test]
    fn dropped_frames_return_buffers() {
        let pool = FramePool::new(2);
        let a = frame(&pool, 0);
        let b = frame(&pool, 1);
        let c = frame(&pool, 2);
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        drop(c);
        // 超出容量的那块直接释放
        assert_eq!(pool.available(), 2);

        let d = frame(&pool, 3);
        assert_eq!(d.data(), &[1, 2, 3, 4]);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn buffers_may_outlive_their_pool() {
        let pool = FramePool::new(2);
        let kept = frame(&pool, 0);
        let recycled = frame(&pool, 1);
        drop(recycled);
        assert_eq!(pool.available(), 1);

        drop(pool);
        assert_eq!(kept.data(), &[1, 2, 3, 4]);
        drop(kept);
    }

    #[test]
    fn detached_data_never_returns() {
        let pool = FramePool::new(4);
        let data = frame(&pool, 0).into_vec();
        assert_eq!(data.len(), 4);
        assert_eq!(pool.available(), 0);
    }
}
