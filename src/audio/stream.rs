//! 流控制器
//!
//! 状态机：
//! Uninitialized → Initializing → Initialized → {Reinitializing → Initializing | Uninitializing → Uninitialized}
//!
//! init / control / transfer / fini 只能在同一个（模拟）线程上调用；
//! 硬件回调只读状态字，设备监视只请求 Reinitializing。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::callback::{CallbackContext, CaptureContext, RenderContext, StreamShared};
use super::config::{DeviceSelector, StreamConfig};
use super::converter::SampleConverter;
use super::error::AudioError;
use super::format::{
    from_native_format, needs_conversion, to_native_format, NativeFormat, PcmFormat,
    StreamDirection,
};
use super::ring_buffer::{Consumer, Producer, RingBuffer};
use super::stats::{StatsSnapshot, StreamStats};
use super::watcher::{DeviceWatcher, Registration, ReinitCause, StreamState, StreamStatus};
use crate::backend::mixer::{CaptureSink, MixerPort, PlaybackSource};
use crate::host::{
    set_frame_buffer_size, AudioHost, DeviceId, HostError, ListenTarget, NativeUnit, Property,
    PropertyListener, UNKNOWN_DEVICE,
};

/// 流控制命令
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    Enable,
    Disable,
    Pause,
    Resume,
}

/// 模拟线程持有的 ring 一端
enum RingHalf {
    /// 播放：transfer 生产
    Producer(Producer),
    /// 录音：transfer 消费
    Consumer(Consumer),
}

impl RingHalf {
    fn ring(&self) -> &RingBuffer {
        match self {
            Self::Producer(p) => p.ring(),
            Self::Consumer(c) => c.ring(),
        }
    }
}

/// init 成功后持有的全部原生资源
struct StreamIo {
    unit: Box<dyn NativeUnit>,
    half: RingHalf,
    shared: Arc<StreamShared>,
    registrations: Vec<Registration>,
    device_format: NativeFormat,
    has_converter: bool,
    /// 设备由默认设备解析而来
    track_default: bool,
    frame_capacity: usize,
    stream_bpf: usize,
}

/// 重建失败后的指数退避
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            next_attempt: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }

    /// 记录一次失败，返回下一次重试前的等待时间
    fn failed(&mut self, now: Instant) -> Duration {
        let wait = self.current;
        self.next_attempt = Some(now + wait);
        self.current = (self.current * 2).min(self.max);
        wait
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
    }
}

/// 一个输入或输出流
pub struct Stream {
    host: Arc<dyn AudioHost>,
    direction: StreamDirection,
    config: StreamConfig,
    status: Arc<StreamStatus>,
    stats: Arc<StreamStats>,
    requested: Option<PcmFormat>,
    selector: DeviceSelector,
    device: DeviceId,
    io: Option<StreamIo>,
    /// 调用方最近一次的启停意图，重建后据此恢复
    enabled: bool,
    backoff: Backoff,
    reinit_attempts: u64,
    reported: StatsSnapshot,
}

impl Stream {
    pub fn new(host: Arc<dyn AudioHost>, direction: StreamDirection, config: StreamConfig) -> Self {
        let backoff = Backoff::new(config.reinit_backoff_initial, config.reinit_backoff_max);
        Self {
            host,
            direction,
            config,
            status: Arc::new(StreamStatus::new()),
            stats: Arc::new(StreamStats::new()),
            requested: None,
            selector: DeviceSelector::Default,
            device: UNKNOWN_DEVICE,
            io: None,
            enabled: false,
            backoff,
            reinit_attempts: 0,
            reported: StatsSnapshot::default(),
        }
    }

    #[inline]
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        self.status.load()
    }

    /// 当前使用的设备，未初始化时为 `UNKNOWN_DEVICE`
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn requested_format(&self) -> Option<&PcmFormat> {
        self.requested.as_ref()
    }

    /// 协商得到的设备格式
    pub fn device_format(&self) -> Option<&NativeFormat> {
        self.io.as_ref().map(|io| &io.device_format)
    }

    pub fn has_converter(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.has_converter)
    }

    /// ring 容量（流格式帧数）
    pub fn frame_capacity(&self) -> usize {
        self.io.as_ref().map_or(0, |io| io.frame_capacity)
    }

    /// ring 内存是否已 mlock
    pub fn is_memory_locked(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.half.ring().is_memory_locked())
    }

    pub fn is_running(&self) -> bool {
        self.io
            .as_ref()
            .is_some_and(|io| io.unit.is_running().unwrap_or(false))
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn reinit_attempts(&self) -> u64 {
        self.reinit_attempts
    }

    // === init ===

    /// 初始化流，返回 ring 容量（帧）
    ///
    /// 任何一步失败都会释放已获取的资源并回到 Uninitialized
    pub fn init(&mut self, format: PcmFormat, selector: DeviceSelector) -> Result<usize, AudioError> {
        if self.status.load() != StreamState::Uninitialized {
            return Err(AudioError::init_step("stream already initialized"));
        }

        self.status.store(StreamState::Initializing);
        self.requested = Some(format);
        self.selector = selector;

        match self.try_init(&format) {
            Ok(io) => {
                let frames = io.frame_capacity;
                let track_default = io.track_default;
                self.io = Some(io);
                self.status.store(StreamState::Initialized);
                // 注册监听到进入 Initialized 之间的通知会被 request_reinit 忽略，这里补查一次
                self.recheck_device(track_default);
                Ok(frames)
            }
            Err(e) => {
                log::warn!("Failed to initialize {} stream: {}", self.direction, e);
                self.device = UNKNOWN_DEVICE;
                self.status.store(StreamState::Uninitialized);
                Err(e)
            }
        }
    }

    fn try_init(&mut self, format: &PcmFormat) -> Result<StreamIo, AudioError> {
        let direction = self.direction;
        format
            .validate()
            .map_err(|_| AudioError::ConversionUnsupported(format!("requested format {format}")))?;

        let (device, track_default) = self.resolve_device()?;
        self.device = device;

        let host = self.host.clone();
        let name = host.device_name(device).unwrap_or_else(|_| "<unknown>".into());
        let uid = host.device_uid(device).unwrap_or_else(|_| "<unknown>".into());
        log::info!("Using {} device {} '{}' (uid {})", direction, device, name, uid);

        // 硬件缓冲帧数
        let requested_frames = match self.config.buffer_frames {
            Some(frames) => frames,
            None => host
                .buffer_frame_size(device, direction)
                .map_err(|e| AudioError::init("query buffer frame size", e))?,
        };
        let buffer_frames = set_frame_buffer_size(host.as_ref(), device, direction, requested_frames)
            .map_err(|e| AudioError::init("set buffer frame size", e))?;
        log::debug!("Buffer frame size: {} (requested {})", buffer_frames, requested_frames);

        // 打开单元并协商格式
        let mut unit = host
            .open_unit(device, direction)
            .map_err(|e| AudioError::init("open unit", e))?;
        let device_format = unit
            .device_format()
            .map_err(|e| AudioError::init("query device format", e))?;
        from_native_format(&device_format)?;

        let stream_format = to_native_format(format);
        let converter = if needs_conversion(&stream_format, &device_format) {
            let (source, target) = match direction {
                StreamDirection::Output => (&stream_format, &device_format),
                StreamDirection::Input => (&device_format, &stream_format),
            };
            Some(SampleConverter::create(host.as_ref(), source, target)?)
        } else {
            None
        };
        let has_converter = converter.is_some();
        let client_format = if has_converter { device_format } else { stream_format };

        unit.set_client_format(&client_format)
            .map_err(|e| AudioError::init("set client format", e))?;
        unit.set_max_frames_per_slice(buffer_frames)
            .map_err(|e| AudioError::init("set max frames per slice", e))?;
        unit.initialize()
            .map_err(|e| AudioError::init("initialize unit", e))?;

        // 设备不一定采纳请求的值，以读回为准
        let slice_frames = unit
            .max_frames_per_slice()
            .map_err(|e| AudioError::init("query max frames per slice", e))?
            as usize;

        // ring
        let frame_capacity = ring_frames(direction, slice_frames, &stream_format, &device_format);
        let stream_bpf = stream_format.bytes_per_frame();
        if frame_capacity == 0 || stream_bpf == 0 {
            return Err(AudioError::init_step("size ring buffer"));
        }
        let (producer, consumer) = RingBuffer::with_capacity(frame_capacity * stream_bpf);
        if self.config.lock_memory {
            producer.ring().lock_memory();
        }

        // 回调上下文
        let shared = Arc::new(StreamShared::new(self.status.clone(), self.stats.clone()));
        let client_bpf = client_format.bytes_per_frame();
        let (handler, half) = match direction {
            StreamDirection::Output => (
                CallbackContext::Render(RenderContext::new(
                    consumer,
                    converter,
                    shared.clone(),
                    client_bpf,
                    stream_bpf,
                )),
                RingHalf::Producer(producer),
            ),
            StreamDirection::Input => (
                CallbackContext::Capture(CaptureContext::new(
                    producer,
                    converter,
                    shared.clone(),
                    client_bpf,
                    stream_bpf,
                )),
                RingHalf::Consumer(consumer),
            ),
        };
        unit.set_io_handler(Box::new(handler))
            .map_err(|e| AudioError::init("install io handler", e))?;

        let registrations = self.register_listeners(device, track_default);

        log::info!(
            "{} stream initialized: stream {} / device {}, {} frames/slice, ring {} frames{}",
            direction,
            format,
            device_format,
            slice_frames,
            frame_capacity,
            if has_converter { ", converting" } else { "" }
        );

        Ok(StreamIo {
            unit,
            half,
            shared,
            registrations,
            device_format,
            has_converter,
            track_default,
            frame_capacity,
            stream_bpf,
        })
    }

    /// 解析设备，返回 (设备, 是否跟随默认设备)
    fn resolve_device(&self) -> Result<(DeviceId, bool), AudioError> {
        let direction = self.direction;
        let mut wanted_uid = None;

        if let DeviceSelector::ByUid(uid) = &self.selector {
            match self.host.device_for_uid(uid) {
                Ok(id) if id != UNKNOWN_DEVICE => return self.check_alive(id).map(|_| (id, false)),
                Ok(_) => log::warn!(
                    "No {} device with uid '{}', falling back to the default device",
                    direction,
                    uid
                ),
                Err(e) => log::warn!(
                    "Failed to look up {} device '{}': {}, falling back to the default device",
                    direction,
                    uid,
                    e
                ),
            }
            wanted_uid = Some(uid.clone());
        }

        let id = self
            .host
            .default_device(direction)
            .map_err(|e| AudioError::init("query default device", e))?;
        if id == UNKNOWN_DEVICE {
            return Err(AudioError::DeviceNotFound {
                direction,
                uid: wanted_uid,
            });
        }
        self.check_alive(id).map(|_| (id, true))
    }

    /// 进入 Initialized 后重新确认设备状态，错过的变化转为 Reinitializing
    fn recheck_device(&self, track_default: bool) {
        let device = self.device;
        if let Err(AudioError::DeviceInvalidated) = self.check_alive(device) {
            self.status.request_reinit(ReinitCause::DeviceNotAlive);
            return;
        }
        if track_default {
            if let Ok(current) = self.host.default_device(self.direction) {
                if current != UNKNOWN_DEVICE && current != device {
                    self.status.request_reinit(ReinitCause::DefaultDeviceChanged);
                }
            }
        }
    }

    /// 设备仍在列表中但已失效
    fn check_alive(&self, device: DeviceId) -> Result<(), AudioError> {
        match self.host.is_alive(device) {
            Ok(false) | Err(HostError::BadDevice) => Err(AudioError::DeviceInvalidated),
            _ => Ok(()),
        }
    }

    /// 注册设备监听；每一项都可选，失败只记日志
    fn register_listeners(&self, device: DeviceId, track_default: bool) -> Vec<Registration> {
        let watcher: Arc<dyn PropertyListener> = Arc::new(DeviceWatcher::new(
            &self.host,
            self.direction,
            device,
            self.status.clone(),
            self.stats.clone(),
        ));

        let mut targets = vec![
            ListenTarget::Device(device, Property::NominalSampleRate),
            ListenTarget::Device(device, Property::DeviceIsAlive),
        ];
        if track_default {
            targets.push(ListenTarget::System(Property::DefaultDevice(self.direction)));
        }
        if self.config.watch_overload {
            targets.push(ListenTarget::Device(device, Property::ProcessorOverload));
        }

        targets
            .into_iter()
            .filter_map(|target| {
                match Registration::subscribe(&self.host, target, watcher.clone()) {
                    Ok(registration) => Some(registration),
                    Err(e) => {
                        log::warn!(
                            "Failed to register listener {:?}: {} (device changes will not be tracked)",
                            target,
                            e
                        );
                        None
                    }
                }
            })
            .collect()
    }

    // === control ===

    /// 启动/停止硬件流，两个方向都幂等
    pub fn control(&mut self, command: StreamCommand) -> Result<(), AudioError> {
        match self.status.load() {
            StreamState::Initialized | StreamState::Reinitializing => {}
            _ => return Ok(()),
        }

        self.enabled = matches!(command, StreamCommand::Enable | StreamCommand::Resume);
        let Some(io) = self.io.as_mut() else {
            // 重建失败后没有资源，意图留到重建成功时恢复
            return Ok(());
        };
        let running = io.unit.is_running().unwrap_or(false);

        match command {
            StreamCommand::Enable | StreamCommand::Resume => {
                if running {
                    return Ok(());
                }
                if let Err(e) = io.unit.reset() {
                    log::warn!("Failed to reset {} unit: {}", self.direction, e);
                }
                // 单元未运行，回调不会并发访问 ring
                unsafe { io.half.ring().reset() };
                io.shared.request_converter_reset();

                io.unit
                    .start()
                    .map_err(|e| AudioError::init("start unit", e))?;
                log::debug!("{} stream started", self.direction);
            }
            StreamCommand::Disable | StreamCommand::Pause => {
                if !running {
                    return Ok(());
                }
                io.unit
                    .stop()
                    .map_err(|e| AudioError::init("stop unit", e))?;
                if let Err(e) = io.unit.reset() {
                    log::warn!("Failed to reset {} unit: {}", self.direction, e);
                }
                log::debug!("{} stream stopped", self.direction);
            }
        }
        Ok(())
    }

    // === transfer ===

    /// 在 ring 与混音器缓冲之间搬运数据，返回帧数
    ///
    /// 被标记为 Reinitializing 时先在本线程上重建
    pub fn transfer(&mut self, port: MixerPort<'_>) -> Result<usize, AudioError> {
        match self.status.load() {
            StreamState::Initialized => {}
            StreamState::Reinitializing => {
                let cause = self.status.take_cause();
                if cause != ReinitCause::Unknown {
                    log::info!("{} stream: {}, reinitializing", self.direction, cause);
                }
                if !self.reinit() {
                    return Ok(0);
                }
            }
            _ => return Ok(0),
        }

        self.report_stats();

        let Some(io) = self.io.as_mut() else {
            return Ok(0);
        };
        let bpf = io.stream_bpf;

        let frames = match (&mut io.half, port) {
            (RingHalf::Producer(producer), MixerPort::Playback(source)) => {
                fill_from_mixer(producer, source, bpf)
            }
            (RingHalf::Consumer(consumer), MixerPort::Capture(sink)) => {
                drain_to_mixer(consumer, sink, bpf)
            }
            _ => {
                log::warn!("Mixer port does not match {} stream", self.direction);
                return Ok(0);
            }
        };

        self.stats.add_frames_transferred(frames);
        Ok(frames)
    }

    /// 完整的 fini + init + 恢复启停状态；返回是否成功
    fn reinit(&mut self) -> bool {
        let now = Instant::now();
        if !self.backoff.ready(now) {
            return false;
        }
        let Some(format) = self.requested else {
            return false;
        };

        self.reinit_attempts += 1;
        let enabled = self.enabled;
        log::info!("Reinitializing {} stream (attempt {})", self.direction, self.reinit_attempts);

        self.fini();
        let selector = self.selector.clone();
        match self.init(format, selector) {
            Ok(_) => {
                self.backoff.reset();
                if enabled {
                    if let Err(e) = self.control(StreamCommand::Enable) {
                        log::warn!("Failed to restart {} stream: {}", self.direction, e);
                    }
                }
                true
            }
            Err(e) => {
                let wait = self.backoff.failed(now);
                log::warn!(
                    "Reinitialization of {} stream failed: {}, retrying in {:?}",
                    self.direction,
                    e,
                    wait
                );
                self.enabled = enabled;
                self.status.store(StreamState::Reinitializing);
                false
            }
        }
    }

    /// 报告回调里累计的异常事件
    fn report_stats(&mut self) {
        let now = self.stats.snapshot();
        let delta = now.since(&self.reported);
        self.reported = now;

        if delta.underrun_frames > 0 {
            log::warn!("{} stream underrun: {} frames", self.direction, delta.underrun_frames);
        }
        if delta.overrun_bytes > 0 {
            log::warn!("{} stream overrun: {} bytes dropped", self.direction, delta.overrun_bytes);
        }
        if delta.transfer_failures > 0 {
            let err = AudioError::TransferFailure {
                failures: delta.transfer_failures,
            };
            log::warn!("{} stream: {}", self.direction, err);
        }
        if delta.overloads > 0 {
            log::warn!("{} device reported {} IO overloads", self.direction, delta.overloads);
        }
    }

    // === fini ===

    /// 释放全部资源，回到 Uninitialized
    ///
    /// 先同步停止硬件回调，再释放转换器和 ring
    pub fn fini(&mut self) {
        match self.status.load() {
            StreamState::Initialized | StreamState::Reinitializing => {}
            _ => return,
        }

        if let Err(e) = self.control(StreamCommand::Disable) {
            log::warn!("Failed to stop {} stream: {}", self.direction, e);
        }
        self.status.store(StreamState::Uninitializing);

        if let Some(mut io) = self.io.take() {
            for registration in &mut io.registrations {
                if let Err(e) = registration.release() {
                    log::warn!("Failed to remove listener {:?}: {}", registration.target(), e);
                }
            }

            // stop 已经同步返回，取回回调上下文（转换器与 ring 的实时端）
            drop(io.unit.take_io_handler());

            if let Err(e) = io.unit.uninitialize() {
                log::warn!("Failed to uninitialize {} unit: {}", self.direction, e);
            }
            io.half.ring().unlock_memory();
        }

        self.device = UNKNOWN_DEVICE;
        self.status.store(StreamState::Uninitialized);
        log::info!("{} stream uninitialized", self.direction);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.fini();
    }
}

/// ring 容量（流格式帧数）
///
/// 至少容纳一次硬件回调的帧数，按采样率比例换算到流格式
fn ring_frames(
    direction: StreamDirection,
    slice_frames: usize,
    stream: &NativeFormat,
    device: &NativeFormat,
) -> usize {
    if device.sample_rate <= 0.0 || stream.bytes_per_frame == 0 {
        return 0;
    }
    let ratio = stream.sample_rate / device.sample_rate;
    let scaled = match direction {
        StreamDirection::Input => {
            (slice_frames as f64 * device.bytes_per_frame as f64 * ratio
                / stream.bytes_per_frame as f64) as usize
        }
        StreamDirection::Output => (slice_frames as f64 * ratio).ceil() as usize,
    };
    slice_frames.max(scaled)
}

/// 播放：混音器 → ring，只搬整帧
fn fill_from_mixer(producer: &mut Producer, source: &mut dyn PlaybackSource, bpf: usize) -> usize {
    let bpf = bpf.max(1);
    let mut left = source.available_bytes().min(producer.ring().free_bytes());
    left -= left % bpf;

    let mut total = 0;
    while left > 0 {
        let region = producer.acquire_write_region(left);
        let whole = region.len() - region.len() % bpf;
        if whole == 0 {
            producer.release_write_region(0);
            break;
        }
        let n = source.read(&mut region[..whole]).min(whole);
        producer.release_write_region(n);
        total += n;
        left -= n;
        if n < whole {
            break;
        }
    }

    let frames = total / bpf;
    source.finish(frames);
    frames
}

/// 录音：ring → 混音器
fn drain_to_mixer(consumer: &mut Consumer, sink: &mut dyn CaptureSink, bpf: usize) -> usize {
    let bpf = bpf.max(1);
    let mut left = sink.free_bytes().min(consumer.ring().used_bytes());
    left -= left % bpf;

    let mut total = 0;
    while left > 0 {
        let region = consumer.acquire_read_region(left);
        let whole = region.len() - region.len() % bpf;
        if whole == 0 {
            consumer.release_read_region(0);
            break;
        }
        let n = sink.write(&region[..whole]).min(whole);
        consumer.release_read_region(n);
        total += n;
        left -= n;
        if n < whole {
            break;
        }
    }

    sink.mix_in(total / bpf)
}
