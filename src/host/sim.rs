//! 进程内模拟宿主
//!
//! 行为尽量贴近 Core Audio HAL：
//! - 设备可以插拔、失效、改采样率、切换默认设备，通知同步投递给监听者
//! - 硬件回调由调用方显式驱动（`render_cycle` / `capture_cycle`）
//! - `ResourceCounters` 记录仍然存活的原生资源，用于验证失败路径不泄漏
//!
//! 也用作非 macOS 平台上 CLI 的后端。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::{
    AudioHost, DeviceId, FrameRange, HostError, IoHandler, ListenTarget, ListenerKey,
    NativeConverter, NativeUnit, Property, PropertyListener, Pull, PullSource, UNKNOWN_DEVICE,
};
use crate::audio::format::{
    from_native_format, NativeFormat, PcmFormat, StreamDirection, FORMAT_FLAG_IS_BIG_ENDIAN,
    FORMAT_FLAG_IS_NON_INTERLEAVED, FORMAT_LINEAR_PCM,
};

/// 系统对象 ID（默认设备通知的发送者）
pub const SYSTEM_OBJECT: DeviceId = 1;

const FIRST_DEVICE_ID: DeviceId = 100;
const DEFAULT_FRAME_SIZE: u32 = 512;
const DEFAULT_FRAME_RANGE: FrameRange = FrameRange { min: 14, max: 4096 };

/// 可注入失败的原生操作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    OpenUnit,
    SetClientFormat,
    Initialize,
    /// initialize 之后读回每片最大帧数
    QuerySliceFrames,
    Start,
    NewConverter,
    AddListener,
    SetChannelMap,
    /// 回调里的格式转换
    ConvertFill,
}

/// 仍然存活的原生资源
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceCounters {
    pub open_units: usize,
    pub initialized_units: usize,
    pub running_units: usize,
    pub converters: usize,
    pub listeners: usize,
}

/// 模拟设备描述
#[derive(Clone, Debug)]
pub struct SimDevice {
    pub name: String,
    pub uid: String,
    pub sample_rate: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    pub frame_size: u32,
    pub frame_ranges: Vec<FrameRange>,
    is_input: bool,
    is_output: bool,
    alive: bool,
}

impl SimDevice {
    fn new(name: &str, sample_rate: u32) -> Self {
        Self {
            name: name.to_string(),
            uid: format!("sim:{name}"),
            sample_rate,
            input_channels: 0,
            output_channels: 0,
            frame_size: DEFAULT_FRAME_SIZE,
            frame_ranges: vec![DEFAULT_FRAME_RANGE],
            is_input: false,
            is_output: false,
            alive: true,
        }
    }

    /// 播放设备
    pub fn output(name: &str, sample_rate: u32, channels: u32) -> Self {
        Self {
            output_channels: channels,
            is_output: true,
            ..Self::new(name, sample_rate)
        }
    }

    /// 录音设备（声道数可以为 0，模拟报告异常的设备）
    pub fn input(name: &str, sample_rate: u32, channels: u32) -> Self {
        Self {
            input_channels: channels,
            is_input: true,
            ..Self::new(name, sample_rate)
        }
    }

    /// 双工设备
    pub fn duplex(name: &str, sample_rate: u32, input_channels: u32, output_channels: u32) -> Self {
        Self {
            input_channels,
            output_channels,
            is_input: true,
            is_output: true,
            ..Self::new(name, sample_rate)
        }
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    pub fn with_frame_size(mut self, frames: u32) -> Self {
        self.frame_size = frames;
        self
    }

    pub fn with_frame_ranges(mut self, ranges: &[(u32, u32)]) -> Self {
        self.frame_ranges = ranges
            .iter()
            .map(|&(min, max)| FrameRange { min, max })
            .collect();
        self
    }

    fn serves(&self, direction: StreamDirection) -> bool {
        match direction {
            StreamDirection::Input => self.is_input,
            StreamDirection::Output => self.is_output,
        }
    }

    fn channels(&self, direction: StreamDirection) -> u32 {
        match direction {
            StreamDirection::Input => self.input_channels,
            StreamDirection::Output => self.output_channels,
        }
    }

    /// 设备一侧格式：与 Core Audio 一样使用 32-bit float
    fn native_format(&self, direction: StreamDirection) -> NativeFormat {
        let channels = self.channels(direction);
        let mut format =
            crate::audio::format::to_native_format(&PcmFormat::float32(self.sample_rate, 1));
        format.channels_per_frame = channels;
        format.bytes_per_frame = 4 * channels;
        format.bytes_per_packet = 4 * channels;
        format
    }
}

/// 单元的 IO 槽：回调线程和控制线程共享
struct UnitIo {
    device: DeviceId,
    direction: StreamDirection,
    client_format: NativeFormat,
    handler: Option<Box<dyn IoHandler>>,
    running: bool,
}

struct SimState {
    devices: BTreeMap<DeviceId, SimDevice>,
    next_device: DeviceId,
    default_input: DeviceId,
    default_output: DeviceId,
    listeners: HashMap<u64, (ListenTarget, Arc<dyn PropertyListener>)>,
    next_key: u64,
    units: Vec<Weak<Mutex<UnitIo>>>,
    failures: HashSet<SimOp>,
}

struct Shared {
    state: Mutex<SimState>,
    open_units: AtomicUsize,
    initialized_units: AtomicUsize,
    running_units: AtomicUsize,
    converters: AtomicUsize,
    start_calls: AtomicUsize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        // 监听者 panic 不应该让宿主永久不可用
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, op: SimOp) -> Result<(), HostError> {
        if self.state().failures.contains(&op) {
            Err(HostError::Status(-50))
        } else {
            Ok(())
        }
    }
}

/// 模拟宿主
#[derive(Clone)]
pub struct SimHost {
    shared: Arc<Shared>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    devices: BTreeMap::new(),
                    next_device: FIRST_DEVICE_ID,
                    default_input: UNKNOWN_DEVICE,
                    default_output: UNKNOWN_DEVICE,
                    listeners: HashMap::new(),
                    next_key: 1,
                    units: Vec::new(),
                    failures: HashSet::new(),
                }),
                open_units: AtomicUsize::new(0),
                initialized_units: AtomicUsize::new(0),
                running_units: AtomicUsize::new(0),
                converters: AtomicUsize::new(0),
                start_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// 一个输入 + 一个输出设备的常见配置
    pub fn with_default_devices() -> Self {
        let host = Self::new();
        host.add_device(SimDevice::output("Built-in Output", 44100, 2));
        host.add_device(SimDevice::input("Built-in Microphone", 44100, 2));
        host
    }

    // === 设备事件注入 ===

    /// 插入设备；对应方向还没有默认设备时成为默认设备
    pub fn add_device(&self, device: SimDevice) -> DeviceId {
        let mut state = self.shared.state();
        let id = state.next_device;
        state.next_device += 1;

        if device.is_output && state.default_output == UNKNOWN_DEVICE {
            state.default_output = id;
        }
        if device.is_input && state.default_input == UNKNOWN_DEVICE {
            state.default_input = id;
        }

        log::debug!("sim: device {} added ({})", id, device.name);
        state.devices.insert(id, device);
        id
    }

    /// 切换系统默认设备并通知
    pub fn set_default_device(&self, direction: StreamDirection, device: DeviceId) {
        {
            let mut state = self.shared.state();
            match direction {
                StreamDirection::Input => state.default_input = device,
                StreamDirection::Output => state.default_output = device,
            }
        }
        self.notify(SYSTEM_OBJECT, ListenTarget::System(Property::DefaultDevice(direction)));
    }

    /// 重新广播默认设备变化（设备 ID 不变）
    pub fn touch_default_device(&self, direction: StreamDirection) {
        self.notify(SYSTEM_OBJECT, ListenTarget::System(Property::DefaultDevice(direction)));
    }

    /// 拔出设备：通知 device-is-alive，移除设备上的监听；
    /// 如果是默认设备，默认设备切换到下一个可用设备
    pub fn remove_device(&self, device: DeviceId) {
        let mut changed = Vec::new();
        {
            let mut state = self.shared.state();
            let Some(dev) = state.devices.get_mut(&device) else {
                return;
            };
            dev.alive = false;

            for direction in [StreamDirection::Input, StreamDirection::Output] {
                let current = match direction {
                    StreamDirection::Input => state.default_input,
                    StreamDirection::Output => state.default_output,
                };
                if current != device {
                    continue;
                }
                let next = state
                    .devices
                    .iter()
                    .find(|(&id, d)| id != device && d.alive && d.serves(direction))
                    .map(|(&id, _)| id)
                    .unwrap_or(UNKNOWN_DEVICE);
                match direction {
                    StreamDirection::Input => state.default_input = next,
                    StreamDirection::Output => state.default_output = next,
                }
                changed.push(direction);
            }
        }

        self.notify(device, ListenTarget::Device(device, Property::DeviceIsAlive));

        {
            let mut state = self.shared.state();
            state.devices.remove(&device);
            state
                .listeners
                .retain(|_, (target, _)| !matches!(target, ListenTarget::Device(d, _) if *d == device));
        }

        for direction in changed {
            self.notify(SYSTEM_OBJECT, ListenTarget::System(Property::DefaultDevice(direction)));
        }
        log::debug!("sim: device {} removed", device);
    }

    /// 设备失效但仍在列表中
    pub fn kill_device(&self, device: DeviceId) {
        if let Some(dev) = self.shared.state().devices.get_mut(&device) {
            dev.alive = false;
        }
        self.notify(device, ListenTarget::Device(device, Property::DeviceIsAlive));
    }

    /// 改变设备名义采样率
    pub fn set_sample_rate(&self, device: DeviceId, sample_rate: u32) {
        if let Some(dev) = self.shared.state().devices.get_mut(&device) {
            dev.sample_rate = sample_rate;
        }
        self.notify(device, ListenTarget::Device(device, Property::NominalSampleRate));
    }

    /// 设备 IO 线程过载
    pub fn report_overload(&self, device: DeviceId) {
        self.notify(device, ListenTarget::Device(device, Property::ProcessorOverload));
    }

    /// 让某个原生操作持续失败，直到 `clear_failures`
    pub fn fail(&self, op: SimOp) {
        self.shared.state().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.shared.state().failures.clear();
    }

    // === 硬件回调驱动 ===

    /// 驱动 `device` 上正在运行的输出单元执行一次 render，返回客户端格式数据
    pub fn render_cycle(&self, device: DeviceId, frames: usize) -> Option<Vec<u8>> {
        let io = self.running_unit(device, StreamDirection::Output)?;
        let mut io = io.lock().unwrap_or_else(|e| e.into_inner());
        if !io.running {
            return None;
        }

        let mut out = vec![0u8; frames * io.client_format.bytes_per_frame()];
        let handler = io.handler.as_mut()?;
        let written = handler.render(&mut out, frames);
        let len = out.len();
        out[written.min(len)..].fill(0);
        Some(out)
    }

    /// 向 `device` 上正在运行的输入单元送入一次客户端格式数据
    pub fn capture_cycle(&self, device: DeviceId, input: &[u8]) -> bool {
        let Some(io) = self.running_unit(device, StreamDirection::Input) else {
            return false;
        };
        let mut io = io.lock().unwrap_or_else(|e| e.into_inner());
        if !io.running {
            return false;
        }

        let bpf = io.client_format.bytes_per_frame().max(1);
        let frames = input.len() / bpf;
        match io.handler.as_mut() {
            Some(handler) => {
                handler.capture(&input[..frames * bpf], frames);
                true
            }
            None => false,
        }
    }

    /// 以输入单元的客户端格式生成一段正弦测试音并送入（CLI 模拟模式使用）
    pub fn capture_tone(&self, device: DeviceId, frames: usize, hz: f64, phase: &mut f64) -> bool {
        let Some(io) = self.running_unit(device, StreamDirection::Input) else {
            return false;
        };
        let client = io.lock().unwrap_or_else(|e| e.into_inner()).client_format;
        let Ok(pcm) = from_native_format(&client) else {
            return false;
        };

        let channels = pcm.channels as usize;
        let step = hz / pcm.sample_rate_hz as f64;
        let mut samples = vec![0i32; frames * channels];
        for frame in samples.chunks_exact_mut(channels) {
            let value = (0.25 * (*phase * std::f64::consts::TAU).sin() * i32::MAX as f64) as i32;
            frame.fill(value);
            *phase = (*phase + step).fract();
        }

        let mut bytes = vec![0u8; frames * pcm.bytes_per_frame()];
        pcm.samples_to_bytes(&samples, &mut bytes);
        self.capture_cycle(device, &bytes)
    }

    fn running_unit(&self, device: DeviceId, direction: StreamDirection) -> Option<Arc<Mutex<UnitIo>>> {
        let mut state = self.shared.state();
        state.units.retain(|w| w.strong_count() > 0);
        state.units.iter().filter_map(Weak::upgrade).find(|io| {
            let io = io.lock().unwrap_or_else(|e| e.into_inner());
            io.device == device && io.direction == direction && io.running
        })
    }

    // === 观测 ===

    pub fn counters(&self) -> ResourceCounters {
        ResourceCounters {
            open_units: self.shared.open_units.load(Ordering::SeqCst),
            initialized_units: self.shared.initialized_units.load(Ordering::SeqCst),
            running_units: self.shared.running_units.load(Ordering::SeqCst),
            converters: self.shared.converters.load(Ordering::SeqCst),
            listeners: self.shared.state().listeners.len(),
        }
    }

    /// 累计 start 调用次数
    pub fn start_calls(&self) -> usize {
        self.shared.start_calls.load(Ordering::SeqCst)
    }

    pub fn buffer_frames(&self, device: DeviceId) -> Option<u32> {
        self.shared.state().devices.get(&device).map(|d| d.frame_size)
    }

    fn notify(&self, object: DeviceId, target: ListenTarget) {
        // 先收集再释放锁，监听者会回调宿主查询属性
        let listeners: Vec<Arc<dyn PropertyListener>> = self
            .shared
            .state()
            .listeners
            .values()
            .filter(|(t, _)| *t == target)
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener.property_changed(object, target.property());
        }
    }

    fn with_device<T>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&SimDevice) -> T,
    ) -> Result<T, HostError> {
        self.shared
            .state()
            .devices
            .get(&device)
            .map(f)
            .ok_or(HostError::BadObject)
    }
}

impl AudioHost for SimHost {
    fn devices(&self) -> Result<Vec<DeviceId>, HostError> {
        Ok(self.shared.state().devices.keys().copied().collect())
    }

    fn default_device(&self, direction: StreamDirection) -> Result<DeviceId, HostError> {
        let state = self.shared.state();
        Ok(match direction {
            StreamDirection::Input => state.default_input,
            StreamDirection::Output => state.default_output,
        })
    }

    fn device_for_uid(&self, uid: &str) -> Result<DeviceId, HostError> {
        Ok(self
            .shared
            .state()
            .devices
            .iter()
            .find(|(_, d)| d.uid == uid)
            .map(|(&id, _)| id)
            .unwrap_or(UNKNOWN_DEVICE))
    }

    fn device_name(&self, device: DeviceId) -> Result<String, HostError> {
        self.with_device(device, |d| d.name.clone())
    }

    fn device_uid(&self, device: DeviceId) -> Result<String, HostError> {
        self.with_device(device, |d| d.uid.clone())
    }

    fn channel_count(&self, device: DeviceId, direction: StreamDirection) -> Result<u32, HostError> {
        self.with_device(device, |d| d.channels(direction))
    }

    fn is_alive(&self, device: DeviceId) -> Result<bool, HostError> {
        self.with_device(device, |d| d.alive)
            .map_err(|_| HostError::BadDevice)
    }

    fn buffer_frame_size(&self, device: DeviceId, _direction: StreamDirection) -> Result<u32, HostError> {
        self.with_device(device, |d| d.frame_size)
    }

    fn set_buffer_frame_size(
        &self,
        device: DeviceId,
        _direction: StreamDirection,
        frames: u32,
    ) -> Result<(), HostError> {
        let mut state = self.shared.state();
        let dev = state.devices.get_mut(&device).ok_or(HostError::BadObject)?;
        if dev.frame_ranges.iter().any(|r| (r.min..=r.max).contains(&frames)) {
            dev.frame_size = frames;
            Ok(())
        } else {
            Err(HostError::Unsupported)
        }
    }

    fn buffer_frame_size_ranges(
        &self,
        device: DeviceId,
        _direction: StreamDirection,
    ) -> Result<Vec<FrameRange>, HostError> {
        self.with_device(device, |d| d.frame_ranges.clone())
    }

    fn open_unit(
        &self,
        device: DeviceId,
        direction: StreamDirection,
    ) -> Result<Box<dyn NativeUnit>, HostError> {
        self.shared.check(SimOp::OpenUnit)?;

        let alive = self.with_device(device, |d| d.alive)?;
        if !alive {
            return Err(HostError::BadDevice);
        }

        let io = Arc::new(Mutex::new(UnitIo {
            device,
            direction,
            client_format: NativeFormat::default(),
            handler: None,
            running: false,
        }));
        self.shared.state().units.push(Arc::downgrade(&io));
        self.shared.open_units.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SimUnit {
            host: self.clone(),
            io,
            device,
            direction,
            max_frames: DEFAULT_FRAME_SIZE,
            initialized: false,
        }))
    }

    fn new_converter(
        &self,
        source: &NativeFormat,
        target: &NativeFormat,
    ) -> Result<Box<dyn NativeConverter>, HostError> {
        self.shared.check(SimOp::NewConverter)?;

        let converter = SimConverter::new(self.shared.clone(), source, target)?;
        self.shared.converters.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(converter))
    }

    fn add_listener(
        &self,
        target: ListenTarget,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<ListenerKey, HostError> {
        self.shared.check(SimOp::AddListener)?;

        let mut state = self.shared.state();
        if let ListenTarget::Device(device, _) = target {
            if !state.devices.contains_key(&device) {
                return Err(HostError::BadObject);
            }
        }
        let key = state.next_key;
        state.next_key += 1;
        state.listeners.insert(key, (target, listener));
        Ok(ListenerKey(key))
    }

    fn remove_listener(&self, key: ListenerKey) -> Result<(), HostError> {
        match self.shared.state().listeners.remove(&key.0) {
            Some(_) => Ok(()),
            None => Err(HostError::BadObject),
        }
    }
}

// === 单元 ===

struct SimUnit {
    host: SimHost,
    io: Arc<Mutex<UnitIo>>,
    device: DeviceId,
    direction: StreamDirection,
    max_frames: u32,
    initialized: bool,
}

impl SimUnit {
    fn io(&self) -> MutexGuard<'_, UnitIo> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NativeUnit for SimUnit {
    fn device_format(&self) -> Result<NativeFormat, HostError> {
        let direction = self.direction;
        self.host
            .with_device(self.device, |d| d.native_format(direction))
            .map_err(|_| HostError::BadDevice)
    }

    fn set_client_format(&mut self, format: &NativeFormat) -> Result<(), HostError> {
        self.host.shared.check(SimOp::SetClientFormat)?;
        self.io().client_format = *format;
        Ok(())
    }

    fn set_max_frames_per_slice(&mut self, frames: u32) -> Result<(), HostError> {
        self.max_frames = frames;
        Ok(())
    }

    fn max_frames_per_slice(&self) -> Result<u32, HostError> {
        self.host.shared.check(SimOp::QuerySliceFrames)?;
        Ok(self.max_frames)
    }

    fn initialize(&mut self) -> Result<(), HostError> {
        self.host.shared.check(SimOp::Initialize)?;
        if !self.initialized {
            self.initialized = true;
            self.host.shared.initialized_units.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<(), HostError> {
        if self.initialized {
            self.initialized = false;
            self.host.shared.initialized_units.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_io_handler(&mut self, handler: Box<dyn IoHandler>) -> Result<(), HostError> {
        self.io().handler = Some(handler);
        Ok(())
    }

    fn take_io_handler(&mut self) -> Option<Box<dyn IoHandler>> {
        self.io().handler.take()
    }

    fn start(&mut self) -> Result<(), HostError> {
        self.host.shared.check(SimOp::Start)?;
        if !self.initialized {
            return Err(HostError::Status(-10867)); // kAudioUnitErr_Uninitialized
        }
        let alive = self.host.with_device(self.device, |d| d.alive).unwrap_or(false);
        if !alive {
            return Err(HostError::BadDevice);
        }

        self.host.shared.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut io = self.io();
        if !io.running {
            io.running = true;
            self.host.shared.running_units.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HostError> {
        // 持有 IO 锁即保证没有回调正在执行
        let mut io = self.io();
        if io.running {
            io.running = false;
            self.host.shared.running_units.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    fn is_running(&self) -> Result<bool, HostError> {
        Ok(self.io().running)
    }
}

impl Drop for SimUnit {
    fn drop(&mut self) {
        let _ = self.stop();
        let _ = self.uninitialize();
        self.io().handler = None;
        self.host.shared.open_units.fetch_sub(1, Ordering::SeqCst);
    }
}

// === 软件转换器 ===

/// 声道映射 + 线性插值重采样
struct SimConverter {
    shared: Arc<Shared>,
    source: PcmFormat,
    target: PcmFormat,
    map: Vec<i32>,
    /// 源采样率 / 目标采样率
    step: f64,
    phase: f64,
    loaded: u8,
    prev: Vec<i32>,
    next: Vec<i32>,
    scratch: Vec<i32>,
    mixed: Vec<i32>,
    out_frame: Vec<i32>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl SimConverter {
    fn new(shared: Arc<Shared>, source: &NativeFormat, target: &NativeFormat) -> Result<Self, HostError> {
        let source = Self::supported(source)?;
        let target = Self::supported(target)?;

        let src_ch = source.channels as usize;
        let dst_ch = target.channels as usize;

        Ok(Self {
            shared,
            source,
            target,
            // 原生默认行为：按序号对应，多余的源声道丢弃
            map: (0..dst_ch)
                .map(|c| if c < src_ch { c as i32 } else { -1 })
                .collect(),
            step: source.sample_rate_hz as f64 / target.sample_rate_hz as f64,
            phase: 0.0,
            loaded: 0,
            prev: vec![0; src_ch],
            next: vec![0; src_ch],
            scratch: vec![0; src_ch],
            mixed: vec![0; src_ch],
            out_frame: vec![0; dst_ch],
            pending: Vec::with_capacity(4096 * source.bytes_per_frame()),
            pending_pos: 0,
        })
    }

    fn supported(format: &NativeFormat) -> Result<PcmFormat, HostError> {
        if format.format_id != FORMAT_LINEAR_PCM
            || format.format_flags & (FORMAT_FLAG_IS_BIG_ENDIAN | FORMAT_FLAG_IS_NON_INTERLEAVED) != 0
        {
            return Err(HostError::FormatUnsupported);
        }
        let pcm = from_native_format(format).map_err(|_| HostError::FormatUnsupported)?;
        match (pcm.bits_per_sample, pcm.float) {
            (8 | 16 | 24 | 32, false) | (32, true) => {}
            _ => return Err(HostError::FormatUnsupported),
        }
        if pcm.bytes_per_frame() != format.bytes_per_frame() {
            return Err(HostError::FormatUnsupported);
        }
        Ok(pcm)
    }

    #[inline]
    fn passthrough(&self) -> bool {
        self.source.sample_rate_hz == self.target.sample_rate_hz
    }

    /// 读入下一源帧：prev ← next ← 新帧。源已结束返回 false
    fn load_frame(&mut self, source: &mut dyn PullSource, wanted: usize) -> Result<bool, HostError> {
        let bpf = self.source.bytes_per_frame();

        if self.pending_pos + bpf > self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
            match source.pull(wanted.max(1))? {
                Pull::Data(data) if data.len() >= bpf => {
                    let whole = data.len() - data.len() % bpf;
                    self.pending.extend_from_slice(&data[..whole]);
                }
                Pull::Data(_) | Pull::EndOfData => return Ok(false),
            }
        }

        let frame = &self.pending[self.pending_pos..self.pending_pos + bpf];
        self.source.bytes_to_samples(frame, &mut self.scratch);
        self.pending_pos += bpf;

        std::mem::swap(&mut self.prev, &mut self.next);
        std::mem::swap(&mut self.next, &mut self.scratch);
        self.loaded = (self.loaded + 1).min(2);
        Ok(true)
    }
}

impl NativeConverter for SimConverter {
    fn set_channel_map(&mut self, map: &[i32]) -> Result<(), HostError> {
        self.shared.check(SimOp::SetChannelMap)?;
        if map.len() != self.target.channels as usize
            || map.iter().any(|&c| c >= self.source.channels as i32 || c < -1)
        {
            return Err(HostError::Unsupported);
        }
        self.map = map.to_vec();
        Ok(())
    }

    fn fill(&mut self, out: &mut [u8], source: &mut dyn PullSource) -> Result<usize, HostError> {
        self.shared.check(SimOp::ConvertFill)?;
        let out_bpf = self.target.bytes_per_frame();
        let out_frames = out.len() / out_bpf;
        let mut produced = 0;

        while produced < out_frames {
            let wanted = ((out_frames - produced) as f64 * self.step).ceil() as usize + 1;

            if self.passthrough() {
                if !self.load_frame(source, wanted)? {
                    break;
                }
                self.mixed.copy_from_slice(&self.next);
            } else {
                let mut exhausted = false;
                while self.loaded < 2 {
                    if !self.load_frame(source, wanted)? {
                        exhausted = true;
                        break;
                    }
                }
                while !exhausted && self.phase >= 1.0 {
                    if !self.load_frame(source, wanted)? {
                        exhausted = true;
                        break;
                    }
                    self.phase -= 1.0;
                }
                if exhausted {
                    break;
                }

                for c in 0..self.mixed.len() {
                    let a = self.prev[c] as f64;
                    let b = self.next[c] as f64;
                    self.mixed[c] = (a + (b - a) * self.phase) as i32;
                }
                self.phase += self.step;
            }

            for (c, dst) in self.out_frame.iter_mut().enumerate() {
                *dst = match self.map[c] {
                    src if src >= 0 => self.mixed[src as usize],
                    _ => 0,
                };
            }

            let offset = produced * out_bpf;
            self.target
                .samples_to_bytes(&self.out_frame, &mut out[offset..offset + out_bpf]);
            produced += 1;
        }

        Ok(produced * out_bpf)
    }

    fn reset(&mut self) -> Result<(), HostError> {
        self.phase = 0.0;
        self.loaded = 0;
        self.pending.clear();
        self.pending_pos = 0;
        self.prev.fill(0);
        self.next.fill(0);
        Ok(())
    }
}

impl Drop for SimConverter {
    fn drop(&mut self) {
        self.shared.converters.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::to_native_format;
    use std::sync::atomic::AtomicU32;

    struct SliceSource<'a> {
        data: &'a [u8],
        pos: usize,
        bpf: usize,
    }

    impl PullSource for SliceSource<'_> {
        fn pull(&mut self, max_frames: usize) -> Result<Pull<'_>, HostError> {
            let n = (max_frames * self.bpf).min(self.data.len() - self.pos);
            if n == 0 {
                return Ok(Pull::EndOfData);
            }
            let chunk = &self.data[self.pos..self.pos + n];
            self.pos += n;
            Ok(Pull::Data(chunk))
        }
    }

    struct Counter(AtomicU32);

    impl PropertyListener for Counter {
        fn property_changed(&self, _object: DeviceId, _property: Property) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_devices_follow_add_order() {
        let host = SimHost::new();
        let out = host.add_device(SimDevice::output("a", 48000, 2));
        let inp = host.add_device(SimDevice::input("b", 48000, 1));
        host.add_device(SimDevice::output("c", 48000, 2));

        assert_eq!(host.default_device(StreamDirection::Output).unwrap(), out);
        assert_eq!(host.default_device(StreamDirection::Input).unwrap(), inp);
        assert_eq!(host.device_for_uid("sim:c").unwrap(), out + 2);
        assert_eq!(host.device_for_uid("nope").unwrap(), UNKNOWN_DEVICE);
    }

    #[test]
    fn test_remove_device_moves_default_and_drops_listeners() {
        let host = SimHost::new();
        let a = host.add_device(SimDevice::output("a", 48000, 2));
        let b = host.add_device(SimDevice::output("b", 44100, 2));

        let counter = Arc::new(Counter(AtomicU32::new(0)));
        let key = host
            .add_listener(ListenTarget::Device(a, Property::DeviceIsAlive), counter.clone())
            .unwrap();
        host.add_listener(
            ListenTarget::System(Property::DefaultDevice(StreamDirection::Output)),
            counter.clone(),
        )
        .unwrap();

        host.remove_device(a);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(host.default_device(StreamDirection::Output).unwrap(), b);
        assert_eq!(host.remove_listener(key), Err(HostError::BadObject));
        assert_eq!(host.counters().listeners, 1);
    }

    #[test]
    fn test_unit_counters() {
        let host = SimHost::with_default_devices();
        let dev = host.default_device(StreamDirection::Output).unwrap();

        let mut unit = host.open_unit(dev, StreamDirection::Output).unwrap();
        unit.initialize().unwrap();
        unit.start().unwrap();
        assert_eq!(
            host.counters(),
            ResourceCounters {
                open_units: 1,
                initialized_units: 1,
                running_units: 1,
                converters: 0,
                listeners: 0,
            }
        );

        drop(unit);
        assert_eq!(host.counters(), ResourceCounters::default());
    }

    /// 把整个缓冲写满 0xAA，却只报告写了 3 个字节
    struct ShortRender;

    impl IoHandler for ShortRender {
        fn render(&mut self, out: &mut [u8], _frames: usize) -> usize {
            out.fill(0xAA);
            3
        }

        fn capture(&mut self, _input: &[u8], _frames: usize) {}
    }

    #[test]
    fn test_render_cycle_zero_fills_short_render() {
        let host = SimHost::with_default_devices();
        let dev = host.default_device(StreamDirection::Output).unwrap();

        let mut unit = host.open_unit(dev, StreamDirection::Output).unwrap();
        unit.set_client_format(&to_native_format(&PcmFormat::new(48000, 2, 16)))
            .unwrap();
        unit.initialize().unwrap();
        unit.set_io_handler(Box::new(ShortRender)).unwrap();
        unit.start().unwrap();

        // 报告之外的部分必须是静音
        let out = host.render_cycle(dev, 4).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..3], &[0xAA; 3]);
        assert!(out[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_query_slice_frames_failure() {
        let host = SimHost::with_default_devices();
        let dev = host.default_device(StreamDirection::Output).unwrap();

        let mut unit = host.open_unit(dev, StreamDirection::Output).unwrap();
        unit.set_max_frames_per_slice(256).unwrap();
        assert_eq!(unit.max_frames_per_slice().unwrap(), 256);

        host.fail(SimOp::QuerySliceFrames);
        assert_eq!(unit.max_frames_per_slice(), Err(HostError::Status(-50)));
    }

    #[test]
    fn test_converter_mono_to_stereo_with_map() {
        let host = SimHost::new();
        let mono = to_native_format(&PcmFormat::new(44100, 1, 8));
        let stereo = to_native_format(&PcmFormat::new(44100, 2, 8));
        let mut conv = host.new_converter(&mono, &stereo).unwrap();
        conv.set_channel_map(&[0, 0]).unwrap();

        let mut src = SliceSource { data: &[10, 20, 30], pos: 0, bpf: 1 };
        let mut out = [0u8; 8];
        let n = conv.fill(&mut out, &mut src).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&out[..6], &[10, 10, 20, 20, 30, 30]);
    }

    #[test]
    fn test_converter_resamples_by_ratio() {
        let host = SimHost::new();
        let from = to_native_format(&PcmFormat::new(24000, 1, 16));
        let to = to_native_format(&PcmFormat::new(48000, 1, 16));
        let mut conv = host.new_converter(&from, &to).unwrap();

        let ramp: Vec<u8> = (0..100i16)
            .flat_map(|i| (i * 100).to_le_bytes())
            .collect();
        let mut src = SliceSource { data: &ramp, pos: 0, bpf: 2 };
        let mut out = vec![0u8; 400];
        let n = conv.fill(&mut out, &mut src).unwrap();

        // 2 倍上采样：约 2 * 99 帧
        assert!(n / 2 >= 190, "produced {} frames", n / 2);
        let s1 = i16::from_le_bytes([out[2], out[3]]);
        assert_eq!(s1, 50); // 0 与 100 的中点
    }

    #[test]
    fn test_converter_rejects_64bit_float() {
        let host = SimHost::new();
        let mut f64_fmt = to_native_format(&PcmFormat::float32(48000, 2));
        f64_fmt.bits_per_channel = 64;
        f64_fmt.bytes_per_frame = 16;
        f64_fmt.bytes_per_packet = 16;
        let s16 = to_native_format(&PcmFormat::new(48000, 2, 16));

        assert_eq!(
            host.new_converter(&f64_fmt, &s16).err(),
            Some(HostError::FormatUnsupported)
        );
        assert_eq!(host.counters().converters, 0);
    }

    #[test]
    fn test_injected_failure() {
        let host = SimHost::with_default_devices();
        let dev = host.default_device(StreamDirection::Output).unwrap();
        host.fail(SimOp::OpenUnit);
        assert!(host.open_unit(dev, StreamDirection::Output).is_err());
        host.clear_failures();
        assert!(host.open_unit(dev, StreamDirection::Output).is_ok());
    }
}
