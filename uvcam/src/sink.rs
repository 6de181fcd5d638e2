//! 帧的去向：FrameSink 能力接口与传输管线后的有界帧队列

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use uvcam_core::frame::Frame;

/// 帧消费者 (渲染面、编码器、网络推流...)
///
/// 在投递线程上调用，必须在有限时间内返回；拿到的 Frame 归消费者所有，
/// drop 即把缓冲区还给池子。
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Frame);
}

impl<F> FrameSink for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn on_frame(&self, frame: Frame) {
        self(frame)
    }
}

/// 把帧转发进有界通道的 Sink
///
/// 通道满时最多等待 `send_timeout`，仍送不进去就丢掉这一帧。
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<Frame>,
    send_timeout: Duration,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize, send_timeout: Duration) -> (Arc<Self>, Receiver<Frame>) {
        let (tx, rx) = bounded(capacity.max(1));
        let sink = Arc::new(Self {
            tx,
            send_timeout,
            dropped: AtomicU64::new(0),
        });
        (sink, rx)
    }

    /// 因超时被丢弃的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for ChannelSink {
    fn on_frame(&self, frame: Frame) {
        match self.tx.send_timeout(frame, self.send_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target: "uvcam::sink", seq = frame.sequence, "consumer too slow, frame dropped");
            }
            // 接收端已经不在了，静默丢弃
            Err(SendTimeoutError::Disconnected(_)) => {}
        }
    }
}

/// 传输管线与投递线程之间的有界队列，最新帧优先
///
/// 队列满时丢弃最旧的待投递帧，再放入新帧；传输端永远不会阻塞。
#[derive(Debug)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// 放入一帧，返回因此被挤掉的旧帧数
    pub fn push(&self, frame: Frame) -> u64 {
        let mut frame = frame;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    // 投递线程可能刚好取走一帧，取不到就直接重试
                    if let Ok(oldest) = self.rx.try_recv() {
                        tracing::trace!(target: "uvcam::pipeline", seq = oldest.sequence, "frame queue full, dropping oldest");
                        evicted += 1;
                    }
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        self.dropped.fetch_add(evicted, Ordering::Relaxed);
        evicted
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 丢弃所有待投递帧
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uvcam_core::frame::{PooledBuffer, Timestamp};
    use uvcam_core::pixel_format::FourCC;

    fn frame(seq: u64) -> Frame {
        Frame::new(
            seq,
            Timestamp {
                hw_raw_ns: seq,
                arrival: Duration::ZERO,
            },
            1,
            1,
            FourCC::YUYV.into(),
            PooledBuffer::unpooled(vec![0, 0]),
        )
    }

    #[test]
    fn queue_drops_oldest_and_keeps_newest() {
        let queue = FrameQueue::new(3);
        for seq in 0..10 {
            queue.push(frame(seq));
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.dropped(), 7);

        let remaining: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(remaining, vec![7, 8, 9]);
    }

    #[test]
    fn closure_is_a_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let sink = move |f: Frame| log.lock().unwrap().push(f.sequence);
        sink.on_frame(frame(4));
        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }

    #[test]
    fn channel_sink_drops_after_timeout() {
        let (sink, rx) = ChannelSink::new(1, Duration::from_millis(5));
        sink.on_frame(frame(0));
        sink.on_frame(frame(1));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().unwrap().sequence, 0);
    }
}
