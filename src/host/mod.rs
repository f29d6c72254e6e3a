//! 宿主原生音频 API 抽象
//!
//! 原生 API 被视为黑盒，只需要满足：
//! - 设备枚举与属性查询
//! - 输出单元的打开/配置/启动/停止/关闭
//! - render/capture 回调注册
//! - 属性变化监听
//!
//! 实现：
//! - `coreaudio`: macOS Core Audio (AUHAL + AudioConverter)
//! - `sim`: 进程内模拟宿主，测试和非 macOS 平台使用

use std::sync::Arc;

use thiserror::Error;

use crate::audio::format::{NativeFormat, StreamDirection};

#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod sim;

#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioHost;
pub use sim::{ResourceCounters, SimDevice, SimHost, SimOp};

/// 宿主设备 ID
pub type DeviceId = u32;

/// 「未知设备」，与 kAudioDeviceUnknown 相同
pub const UNKNOWN_DEVICE: DeviceId = 0;

/// 原生 API 错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// 对象已不存在（设备被拔出后移除监听等）
    #[error("bad object")]
    BadObject,
    /// 设备无效或已断开
    #[error("bad device")]
    BadDevice,
    /// 转换器不支持该格式
    #[error("format not supported")]
    FormatUnsupported,
    /// 属性或操作不支持
    #[error("operation not supported")]
    Unsupported,
    /// 其他原生错误码
    #[error("native status {0}")]
    Status(i32),
}

/// 缓冲帧数范围（闭区间）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRange {
    pub min: u32,
    pub max: u32,
}

/// 监听的属性
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    /// 系统默认输入/输出设备变化
    DefaultDevice(StreamDirection),
    /// 设备是否存活
    DeviceIsAlive,
    /// 设备名义采样率
    NominalSampleRate,
    /// 设备 IO 线程过载
    ProcessorOverload,
}

/// 监听目标
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenTarget {
    /// 系统对象上的属性（默认设备变化）
    System(Property),
    /// 某设备上的属性
    Device(DeviceId, Property),
}

impl ListenTarget {
    pub fn property(&self) -> Property {
        match *self {
            Self::System(p) | Self::Device(_, p) => p,
        }
    }
}

/// 宿主分配的监听句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerKey(pub u64);

/// 属性变化回调
///
/// 在宿主通知线程上调用，绝不能阻塞
pub trait PropertyListener: Send + Sync {
    fn property_changed(&self, object: DeviceId, property: Property);
}

/// 转换器拉取的数据
pub enum Pull<'a> {
    /// 下一段源格式数据（整帧）
    Data(&'a [u8]),
    /// 源已经没有数据了：转换器应返回部分结果而不是失败
    EndOfData,
}

/// 转换器的数据源（拉模式）
pub trait PullSource {
    /// 提供最多 `max_frames` 帧源数据
    ///
    /// 返回的切片在下一次调用 `pull` 之前有效，且不会超过本次 `fill`；
    /// 要跨 fill 引用源数据的转换器必须自己拷贝
    fn pull(&mut self, max_frames: usize) -> Result<Pull<'_>, HostError>;
}

/// 原生格式转换器（重采样 + 声道映射）
pub trait NativeConverter: Send {
    /// 设置声道映射：`map[目标声道] = 源声道`，-1 表示静音
    fn set_channel_map(&mut self, map: &[i32]) -> Result<(), HostError>;

    /// 用目标格式数据填满 `out`（按整帧），从 `source` 拉取源数据
    ///
    /// 返回产出的字节数；源报告 EndOfData 时可能少于 `out.len()`
    fn fill(&mut self, out: &mut [u8], source: &mut dyn PullSource) -> Result<usize, HostError>;

    /// 清空内部滤波/历史状态
    fn reset(&mut self) -> Result<(), HostError>;
}

/// 硬件回调处理器
///
/// 在实时线程上调用：不能加锁、不能分配、不能做 I/O
pub trait IoHandler: Send {
    /// 播放：用客户端格式填充 `out`（`frames` 帧），返回写入的字节数。
    /// 未写入的部分由宿主填充静音。
    fn render(&mut self, out: &mut [u8], frames: usize) -> usize;

    /// 录音：`input` 为设备送来的 `frames` 帧客户端格式数据
    fn capture(&mut self, input: &[u8], frames: usize);
}

/// 一个打开的原生输出单元（AUHAL 实例），Drop 时关闭
pub trait NativeUnit: Send {
    /// 设备一侧的流格式
    fn device_format(&self) -> Result<NativeFormat, HostError>;

    /// 设置回调一侧（客户端）的流格式
    fn set_client_format(&mut self, format: &NativeFormat) -> Result<(), HostError>;

    fn set_max_frames_per_slice(&mut self, frames: u32) -> Result<(), HostError>;

    fn max_frames_per_slice(&self) -> Result<u32, HostError>;

    fn initialize(&mut self) -> Result<(), HostError>;

    fn uninitialize(&mut self) -> Result<(), HostError>;

    /// 安装回调处理器（替换旧的）
    fn set_io_handler(&mut self, handler: Box<dyn IoHandler>) -> Result<(), HostError>;

    /// 取回回调处理器；只能在 `stop` 之后调用
    fn take_io_handler(&mut self) -> Option<Box<dyn IoHandler>>;

    /// 启动硬件回调
    fn start(&mut self) -> Result<(), HostError>;

    /// 同步停止：返回后不会再有回调正在执行
    fn stop(&mut self) -> Result<(), HostError>;

    /// 清空单元内部状态
    fn reset(&mut self) -> Result<(), HostError>;

    fn is_running(&self) -> Result<bool, HostError>;
}

/// 宿主音频 API
pub trait AudioHost: Send + Sync {
    /// 所有设备 ID（每次实时查询）
    fn devices(&self) -> Result<Vec<DeviceId>, HostError>;

    /// 系统默认设备，没有时返回 `UNKNOWN_DEVICE`
    fn default_device(&self, direction: StreamDirection) -> Result<DeviceId, HostError>;

    /// UID → 设备 ID，找不到时返回 `UNKNOWN_DEVICE`
    fn device_for_uid(&self, uid: &str) -> Result<DeviceId, HostError>;

    fn device_name(&self, device: DeviceId) -> Result<String, HostError>;

    fn device_uid(&self, device: DeviceId) -> Result<String, HostError>;

    /// 设备在某方向上的声道总数
    fn channel_count(&self, device: DeviceId, direction: StreamDirection) -> Result<u32, HostError>;

    fn is_alive(&self, device: DeviceId) -> Result<bool, HostError>;

    fn buffer_frame_size(&self, device: DeviceId, direction: StreamDirection) -> Result<u32, HostError>;

    fn set_buffer_frame_size(
        &self,
        device: DeviceId,
        direction: StreamDirection,
        frames: u32,
    ) -> Result<(), HostError>;

    fn buffer_frame_size_ranges(
        &self,
        device: DeviceId,
        direction: StreamDirection,
    ) -> Result<Vec<FrameRange>, HostError>;

    /// 打开一个绑定到 `device` 的单元，按方向开启 IO
    fn open_unit(
        &self,
        device: DeviceId,
        direction: StreamDirection,
    ) -> Result<Box<dyn NativeUnit>, HostError>;

    fn new_converter(
        &self,
        source: &NativeFormat,
        target: &NativeFormat,
    ) -> Result<Box<dyn NativeConverter>, HostError>;

    fn add_listener(
        &self,
        target: ListenTarget,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<ListenerKey, HostError>;

    fn remove_listener(&self, key: ListenerKey) -> Result<(), HostError>;
}

/// 按设备范围设置硬件缓冲帧数
///
/// 先直接设置并读回；不一致时在所有范围里找绝对最小值和
/// 严格小于请求值的最大上限，用该上限（没有则用最小值）重试。
/// 返回设备实际采用的帧数。
pub fn set_frame_buffer_size(
    host: &dyn AudioHost,
    device: DeviceId,
    direction: StreamDirection,
    requested: u32,
) -> Result<u32, HostError> {
    // 第一次设置失败无所谓，以读回的值为准
    let _ = host.set_buffer_frame_size(device, direction, requested);

    let actual = host.buffer_frame_size(device, direction)?;
    if actual == requested {
        return Ok(actual);
    }

    let ranges = host.buffer_frame_size_ranges(device, direction)?;
    let min = ranges.iter().map(|r| r.min).min();
    let best_max = ranges
        .iter()
        .map(|r| r.max)
        .filter(|&max| max < requested)
        .max();

    let Some(size) = best_max.or(min) else {
        return Ok(actual);
    };

    log::debug!(
        "Buffer size {} not accepted (got {}), retrying with {}",
        requested,
        actual,
        size
    );

    host.set_buffer_frame_size(device, direction, size)?;
    host.buffer_frame_size(device, direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_exact_match() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("spk", 44100, 2));
        assert_eq!(
            set_frame_buffer_size(&host, dev, StreamDirection::Output, 512).unwrap(),
            512
        );
    }

    #[test]
    fn test_frame_size_picks_best_max_below_request() {
        let host = SimHost::new();
        let dev = host.add_device(
            SimDevice::output("usb", 48000, 2).with_frame_ranges(&[(64, 256), (300, 1024)]),
        );
        // 4096 超出所有范围：选 < 4096 的最大上限 1024
        assert_eq!(
            set_frame_buffer_size(&host, dev, StreamDirection::Output, 4096).unwrap(),
            1024
        );
    }

    #[test]
    fn test_frame_size_falls_back_to_min() {
        let host = SimHost::new();
        let dev = host.add_device(
            SimDevice::output("bt", 48000, 2).with_frame_ranges(&[(128, 2048)]),
        );
        // 32 低于所有上限且不在范围内：使用绝对最小值
        assert_eq!(
            set_frame_buffer_size(&host, dev, StreamDirection::Output, 32).unwrap(),
            128
        );
    }
}
