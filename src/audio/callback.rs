//! 硬件回调上下文
//!
//! 按方向分成两种实现，构造时选定：
//! - `RenderContext`: 播放，从 ring 消费，经转换器（可选）交给设备
//! - `CaptureContext`: 录音，设备数据经转换器（可选）写入 ring
//!
//! 实时线程规则：
//! - 不加锁、不分配、不打日志
//! - 状态不是 Initialized 时什么都不做
//! - 失败只记计数，由 transfer 在模拟线程上报告
//!
//! ring 的游标总是按流格式的整帧推进，所以区域长度也总是整帧。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::converter::SampleConverter;
use super::ring_buffer::{Consumer, Producer};
use super::stats::StreamStats;
use super::watcher::{StreamState, StreamStatus};
use crate::host::{HostError, IoHandler, Pull, PullSource};

/// 流控制器、设备监视器与回调共享的状态
pub struct StreamShared {
    pub status: Arc<StreamStatus>,
    pub stats: Arc<StreamStats>,
    converter_reset: AtomicBool,
}

impl StreamShared {
    pub fn new(status: Arc<StreamStatus>, stats: Arc<StreamStats>) -> Self {
        Self {
            status,
            stats,
            converter_reset: AtomicBool::new(false),
        }
    }

    /// 让回调在下一次运行时先清空转换器历史
    pub fn request_converter_reset(&self) {
        self.converter_reset.store(true, Ordering::Release);
    }

    #[inline]
    fn take_converter_reset(&self) -> bool {
        self.converter_reset.swap(false, Ordering::AcqRel)
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.status.load() == StreamState::Initialized
    }
}

/// 按方向区分的回调上下文
pub enum CallbackContext {
    Render(RenderContext),
    Capture(CaptureContext),
}

impl IoHandler for CallbackContext {
    #[inline]
    fn render(&mut self, out: &mut [u8], frames: usize) -> usize {
        match self {
            Self::Render(ctx) => ctx.render(out, frames),
            Self::Capture(_) => 0,
        }
    }

    #[inline]
    fn capture(&mut self, input: &[u8], frames: usize) {
        if let Self::Capture(ctx) = self {
            ctx.capture(input, frames);
        }
    }
}

// === 播放 ===

pub struct RenderContext {
    consumer: Consumer,
    converter: Option<SampleConverter>,
    /// 转换器拉取的数据先拷到这里，ring 区域当场释放
    staging: Vec<u8>,
    shared: Arc<StreamShared>,
    /// 设备回调一侧（客户端格式）每帧字节数
    client_bpf: usize,
    /// ring 中流格式每帧字节数
    stream_bpf: usize,
}

impl RenderContext {
    pub fn new(
        consumer: Consumer,
        converter: Option<SampleConverter>,
        shared: Arc<StreamShared>,
        client_bpf: usize,
        stream_bpf: usize,
    ) -> Self {
        // 回调里不分配，按 ring 容量一次备好
        let staging = if converter.is_some() {
            vec![0u8; consumer.ring().capacity()]
        } else {
            Vec::new()
        };
        Self {
            consumer,
            converter,
            staging,
            shared,
            client_bpf,
            stream_bpf,
        }
    }

    fn render(&mut self, out: &mut [u8], frames: usize) -> usize {
        if !self.shared.is_active() {
            return 0;
        }

        let stats = &self.shared.stats;
        stats.on_callback(self.consumer.ring().used_bytes());

        if self.shared.take_converter_reset() {
            if let Some(converter) = self.converter.as_mut() {
                if converter.reset().is_err() {
                    stats.record_transfer_failure();
                }
            }
        }

        let want = (frames * self.client_bpf).min(out.len());
        let out = &mut out[..want];

        let written = match self.converter.as_mut() {
            None => self.consumer.pop_slice(out),
            Some(converter) => {
                let mut source =
                    RingSource::new(&mut self.consumer, &mut self.staging, self.stream_bpf);
                match converter.fill_output_buffer(out, &mut source) {
                    Ok(n) => n,
                    Err(_) => {
                        stats.record_transfer_failure();
                        0
                    }
                }
            }
        };

        if written < want {
            stats.record_underrun((want - written) / self.client_bpf.max(1));
        }
        written
    }
}

/// 以 ring 为数据源的转换器拉取端
///
/// 每次 pull 把数据拷进 staging 并立即释放 ring 区域。
/// 转换器可以在两次 fill 之间继续引用上一次交出的数据，
/// staging 属于回调上下文，直到下一次 pull 才会被覆盖。
struct RingSource<'a> {
    consumer: &'a mut Consumer,
    staging: &'a mut [u8],
    bpf: usize,
}

impl<'a> RingSource<'a> {
    fn new(consumer: &'a mut Consumer, staging: &'a mut [u8], bpf: usize) -> Self {
        Self {
            consumer,
            staging,
            bpf: bpf.max(1),
        }
    }
}

impl PullSource for RingSource<'_> {
    fn pull(&mut self, max_frames: usize) -> Result<Pull<'_>, HostError> {
        let want = max_frames.saturating_mul(self.bpf).min(self.staging.len());
        let want = want - want % self.bpf;
        // ring 游标总是整帧推进，拷出的也是整帧
        let n = self.consumer.pop_slice(&mut self.staging[..want]);
        if n == 0 {
            return Ok(Pull::EndOfData);
        }
        Ok(Pull::Data(&self.staging[..n]))
    }
}

// === 录音 ===

pub struct CaptureContext {
    producer: Producer,
    converter: Option<SampleConverter>,
    shared: Arc<StreamShared>,
    client_bpf: usize,
    stream_bpf: usize,
}

impl CaptureContext {
    pub fn new(
        producer: Producer,
        converter: Option<SampleConverter>,
        shared: Arc<StreamShared>,
        client_bpf: usize,
        stream_bpf: usize,
    ) -> Self {
        Self {
            producer,
            converter,
            shared,
            client_bpf,
            stream_bpf,
        }
    }

    fn capture(&mut self, input: &[u8], frames: usize) {
        if !self.shared.is_active() {
            return;
        }

        let stats = &self.shared.stats;
        stats.on_callback(self.producer.ring().used_bytes());

        if self.shared.take_converter_reset() {
            if let Some(converter) = self.converter.as_mut() {
                if converter.reset().is_err() {
                    stats.record_transfer_failure();
                }
            }
        }

        let len = (frames * self.client_bpf).min(input.len());
        let input = &input[..len - len % self.client_bpf.max(1)];
        let stream_bpf = self.stream_bpf.max(1);

        match self.converter.as_mut() {
            None => {
                // 只写整帧
                let free = self.producer.ring().free_bytes();
                let fit = input.len().min(free - free % stream_bpf);
                let pushed = self.producer.push_slice(&input[..fit]);
                if pushed < input.len() {
                    stats.record_overrun(input.len() - pushed);
                }
            }
            Some(converter) => {
                let mut source = SliceSource { data: input, pos: 0, bpf: self.client_bpf };
                loop {
                    let region = self.producer.acquire_write_region(usize::MAX);
                    let whole = region.len() - region.len() % stream_bpf;
                    if whole == 0 {
                        self.producer.release_write_region(0);
                        break;
                    }
                    match converter.fill_output_buffer(&mut region[..whole], &mut source) {
                        Ok(n) => {
                            self.producer.release_write_region(n);
                            if n < whole {
                                break;
                            }
                        }
                        Err(_) => {
                            self.producer.release_write_region(0);
                            stats.record_transfer_failure();
                            break;
                        }
                    }
                }
                if source.remaining() > 0 {
                    stats.record_overrun(source.remaining());
                }
            }
        }
    }
}

/// 以硬件送来的一段数据为源
struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
    bpf: usize,
}

impl SliceSource<'_> {
    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl PullSource for SliceSource<'_> {
    fn pull(&mut self, max_frames: usize) -> Result<Pull<'_>, HostError> {
        let n = (max_frames * self.bpf).min(self.remaining());
        if n == 0 {
            return Ok(Pull::EndOfData);
        }
        let start = self.pos;
        self.pos += n;
        Ok(Pull::Data(&self.data[start..start + n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{to_native_format, PcmFormat};
    use crate::audio::ring_buffer::RingBuffer;
    use crate::audio::watcher::ReinitCause;
    use crate::host::{SimHost, SimOp};

    fn shared_active() -> Arc<StreamShared> {
        let status = Arc::new(StreamStatus::new());
        status.store(StreamState::Initialized);
        Arc::new(StreamShared::new(status, Arc::new(StreamStats::new())))
    }

    #[test]
    fn test_render_passthrough_and_underrun() {
        let (mut producer, consumer) = RingBuffer::with_capacity(16);
        let shared = shared_active();
        let mut ctx = CallbackContext::Render(RenderContext::new(
            consumer,
            None,
            shared.clone(),
            4,
            4,
        ));

        producer.push_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut out = [0u8; 16];
        assert_eq!(ctx.render(&mut out, 4), 8);
        assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(shared.stats.snapshot().underrun_frames, 2);
    }

    #[test]
    fn test_render_inactive_is_silent() {
        let (mut producer, consumer) = RingBuffer::with_capacity(16);
        let shared = shared_active();
        shared.status.request_reinit(ReinitCause::Unknown);
        let mut ctx = CallbackContext::Render(RenderContext::new(consumer, None, shared, 4, 4));

        producer.push_slice(&[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        assert_eq!(ctx.render(&mut out, 1), 0);
        assert_eq!(producer.ring().used_bytes(), 4);
    }

    #[test]
    fn test_render_through_converter() {
        let host = SimHost::new();
        let mono = to_native_format(&PcmFormat::new(44100, 1, 8));
        let stereo = to_native_format(&PcmFormat::new(44100, 2, 8));
        let converter = SampleConverter::create(&host, &mono, &stereo).unwrap();

        let (mut producer, consumer) = RingBuffer::with_capacity(8);
        let shared = shared_active();
        let mut ctx = CallbackContext::Render(RenderContext::new(
            consumer,
            Some(converter),
            shared,
            2,
            1,
        ));

        producer.push_slice(&[10, 20, 30]);
        let mut out = [0u8; 6];
        assert_eq!(ctx.render(&mut out, 3), 6);
        assert_eq!(out, [10, 10, 20, 20, 30, 30]);
        assert_eq!(producer.ring().used_bytes(), 0);
    }

    #[test]
    fn test_ring_source_releases_region_on_pull() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(8);
        let mut staging = vec![0u8; 8];
        producer.push_slice(&[1, 2, 3, 4, 5, 6]);

        let mut source = RingSource::new(&mut consumer, &mut staging, 2);
        let Pull::Data(data) = source.pull(2).unwrap() else {
            panic!("expected data");
        };

        // 交出数据时 ring 区域已经归还，生产者可以立刻覆盖
        assert_eq!(producer.ring().used_bytes(), 2);
        assert_eq!(producer.push_slice(&[9; 6]), 6);
        assert_eq!(data, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_ring_source_wraps_and_ends() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(8);
        let mut staging = vec![0u8; 8];
        producer.push_slice(&[0; 6]);
        let mut drain = [0u8; 6];
        consumer.pop_slice(&mut drain);
        producer.push_slice(&[1, 2, 3, 4]);

        // 跨越环绕点的数据一次拷出
        let mut source = RingSource::new(&mut consumer, &mut staging, 2);
        match source.pull(4).unwrap() {
            Pull::Data(data) => assert_eq!(data, &[1, 2, 3, 4]),
            Pull::EndOfData => panic!("expected data"),
        }
        assert!(matches!(source.pull(4).unwrap(), Pull::EndOfData));
    }

    #[test]
    fn test_render_converter_failure_is_counted() {
        let host = SimHost::new();
        let mono = to_native_format(&PcmFormat::new(44100, 1, 8));
        let stereo = to_native_format(&PcmFormat::new(44100, 2, 8));
        let converter = SampleConverter::create(&host, &mono, &stereo).unwrap();

        let (mut producer, consumer) = RingBuffer::with_capacity(8);
        let shared = shared_active();
        let mut ctx = CallbackContext::Render(RenderContext::new(
            consumer,
            Some(converter),
            shared.clone(),
            2,
            1,
        ));

        host.fail(SimOp::ConvertFill);
        producer.push_slice(&[10, 20]);
        let mut out = [0u8; 4];
        assert_eq!(ctx.render(&mut out, 2), 0);
        assert_eq!(shared.stats.snapshot().transfer_failures, 1);
    }

    #[test]
    fn test_capture_overrun_counts_dropped_bytes() {
        let (producer, mut consumer) = RingBuffer::with_capacity(8);
        let shared = shared_active();
        let mut ctx = CallbackContext::Capture(CaptureContext::new(
            producer,
            None,
            shared.clone(),
            4,
            4,
        ));

        ctx.capture(&[1; 12], 3);
        assert_eq!(shared.stats.snapshot().overrun_bytes, 4);

        let mut out = [0u8; 8];
        assert_eq!(consumer.pop_slice(&mut out), 8);
    }

    #[test]
    fn test_capture_through_converter_wraps() {
        let host = SimHost::new();
        let stereo = to_native_format(&PcmFormat::new(48000, 2, 16));
        let mono = to_native_format(&PcmFormat::new(48000, 1, 16));
        let converter = SampleConverter::create(&host, &stereo, &mono).unwrap();

        let (producer, mut consumer) = RingBuffer::with_capacity(6);
        let shared = shared_active();
        let mut ctx = CallbackContext::Capture(CaptureContext::new(
            producer,
            Some(converter),
            shared,
            4,
            2,
        ));

        let frame = |l: i16| [l.to_le_bytes(), 0i16.to_le_bytes()].concat();
        let mut input = Vec::new();
        for v in [1i16, 2] {
            input.extend(frame(v));
        }
        ctx.capture(&input, 2);

        let mut out = [0u8; 2];
        consumer.pop_slice(&mut out);
        assert_eq!(i16::from_le_bytes(out), 1);

        // 下一次写入跨越环绕点
        let mut input = Vec::new();
        for v in [3i16, 4] {
            input.extend(frame(v));
        }
        ctx.capture(&input, 2);

        let mut rest = [0u8; 6];
        assert_eq!(consumer.pop_slice(&mut rest), 6);
        let samples: Vec<i16> = rest
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![2, 3, 4]);
    }

    #[test]
    fn test_converter_reset_request_is_consumed() {
        let shared = shared_active();
        shared.request_converter_reset();
        assert!(shared.take_converter_reset());
        assert!(!shared.take_converter_reset());
    }
}
