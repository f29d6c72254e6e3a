//! 后端门面
//!
//! 混音器/连接器通过 `Backend` 打开、控制、搬运和关闭流。
//! 设备列表总是实时查询，不做缓存。

pub mod mixer;

use std::collections::HashMap;
use std::sync::Arc;

use crate::audio::config::{BackendConfig, DeviceSelector};
use crate::audio::error::AudioError;
use crate::audio::format::{PcmFormat, StreamDirection};
use crate::audio::stream::{Stream, StreamCommand};
use crate::host::{AudioHost, DeviceId, HostError};

pub use mixer::{CaptureSink, MixBuffer, MixerPort, PlaybackSource};

/// 流句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(u32);

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// 后端能力
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCfg {
    /// 可用输入设备数
    pub max_input_streams: usize,
    /// 可用输出设备数
    pub max_output_streams: usize,
    /// 每个流的上下文大小（字节）
    pub per_stream_context_size: usize,
}

/// 设备信息（CLI 展示用）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub uid: String,
    pub channels: u32,
    pub is_default: bool,
}

/// 宿主音频后端
pub struct Backend {
    host: Arc<dyn AudioHost>,
    config: BackendConfig,
    streams: HashMap<StreamHandle, Stream>,
    next_handle: u32,
}

impl Backend {
    pub fn new(host: Arc<dyn AudioHost>, config: BackendConfig) -> Self {
        Self {
            host,
            config,
            streams: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// 统计在该方向上至少有一个声道的设备
    pub fn enumerate_devices(&self, direction: StreamDirection) -> Result<usize, AudioError> {
        Ok(self.list_devices(direction)?.len())
    }

    /// 列出该方向上可用的设备
    pub fn list_devices(&self, direction: StreamDirection) -> Result<Vec<DeviceInfo>, AudioError> {
        let devices = self
            .host
            .devices()
            .map_err(|e| AudioError::init("enumerate devices", e))?;
        let default = self.host.default_device(direction).unwrap_or_default();

        let mut infos = Vec::new();
        for id in devices {
            let channels = match self.host.channel_count(id, direction) {
                Ok(n) => n,
                // 枚举期间被拔出
                Err(HostError::BadObject | HostError::BadDevice) => continue,
                Err(e) => {
                    log::warn!("Failed to query {} channels of device {}: {}", direction, id, e);
                    continue;
                }
            };
            if channels == 0 {
                continue;
            }

            infos.push(DeviceInfo {
                id,
                name: self.host.device_name(id).unwrap_or_default(),
                uid: self.host.device_uid(id).unwrap_or_default(),
                channels,
                is_default: id == default,
            });
        }

        log::debug!("Found {} {} devices", infos.len(), direction);
        Ok(infos)
    }

    pub fn query_capabilities(&self) -> BackendCfg {
        let count = |direction: StreamDirection| {
            self.enumerate_devices(direction).unwrap_or_else(|e| {
                log::warn!("Failed to enumerate {} devices: {}", direction, e);
                0
            })
        };

        BackendCfg {
            max_input_streams: count(StreamDirection::Input),
            max_output_streams: count(StreamDirection::Output),
            per_stream_context_size: std::mem::size_of::<Stream>(),
        }
    }

    /// 没有全局静音，两个方向总是启用
    pub fn is_direction_enabled(&self, _direction: StreamDirection) -> bool {
        true
    }

    /// 打开并初始化一个流
    pub fn open(
        &mut self,
        direction: StreamDirection,
        format: PcmFormat,
        selector: DeviceSelector,
    ) -> Result<StreamHandle, AudioError> {
        let mut stream = Stream::new(self.host.clone(), direction, self.config.stream.clone());
        stream.init(format, selector)?;

        let handle = StreamHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.streams.insert(handle, stream);
        Ok(handle)
    }

    /// 使用配置里该方向的设备选择打开流
    pub fn open_configured(
        &mut self,
        direction: StreamDirection,
        format: PcmFormat,
    ) -> Result<StreamHandle, AudioError> {
        let selector = self.config.device(direction).clone();
        self.open(direction, format, selector)
    }

    pub fn control(&mut self, handle: StreamHandle, command: StreamCommand) -> Result<(), AudioError> {
        self.stream_mut(handle)?.control(command)
    }

    pub fn transfer(&mut self, handle: StreamHandle, port: MixerPort<'_>) -> Result<usize, AudioError> {
        self.stream_mut(handle)?.transfer(port)
    }

    /// 关闭流；未知句柄忽略
    pub fn close(&mut self, handle: StreamHandle) {
        if let Some(mut stream) = self.streams.remove(&handle) {
            stream.fini();
        }
    }

    pub fn stream(&self, handle: StreamHandle) -> Option<&Stream> {
        self.streams.get(&handle)
    }

    fn stream_mut(&mut self, handle: StreamHandle) -> Result<&mut Stream, AudioError> {
        self.streams
            .get_mut(&handle)
            .ok_or(AudioError::InvalidHandle(handle.0))
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            stream.fini();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::watcher::StreamState;
    use crate::host::{ResourceCounters, SimDevice, SimHost};

    fn backend(host: &SimHost) -> Backend {
        Backend::new(Arc::new(host.clone()), BackendConfig::default())
    }

    #[test]
    fn test_enumerate_filters_by_direction() {
        let host = SimHost::new();
        host.add_device(SimDevice::output("spk", 48000, 2));
        host.add_device(SimDevice::duplex("usb", 48000, 1, 2));
        host.add_device(SimDevice::input("broken", 48000, 0));
        let backend = backend(&host);

        assert_eq!(backend.enumerate_devices(StreamDirection::Output).unwrap(), 2);
        assert_eq!(backend.enumerate_devices(StreamDirection::Input).unwrap(), 1);

        let caps = backend.query_capabilities();
        assert_eq!(caps.max_output_streams, 2);
        assert_eq!(caps.max_input_streams, 1);
        assert_eq!(caps.per_stream_context_size, std::mem::size_of::<Stream>());
        assert!(backend.is_direction_enabled(StreamDirection::Input));
    }

    #[test]
    fn test_enumeration_is_live() {
        let host = SimHost::new();
        let backend = backend(&host);
        assert_eq!(backend.enumerate_devices(StreamDirection::Output).unwrap(), 0);

        let dev = host.add_device(SimDevice::output("spk", 48000, 2));
        assert_eq!(backend.enumerate_devices(StreamDirection::Output).unwrap(), 1);

        let list = backend.list_devices(StreamDirection::Output).unwrap();
        assert_eq!(list[0].id, dev);
        assert_eq!(list[0].uid, "sim:spk");
        assert!(list[0].is_default);

        host.remove_device(dev);
        assert_eq!(backend.enumerate_devices(StreamDirection::Output).unwrap(), 0);
    }

    #[test]
    fn test_open_transfer_close() {
        let host = SimHost::with_default_devices();
        let mut backend = backend(&host);
        let format = PcmFormat::new(44100, 2, 16);

        let handle = backend
            .open(StreamDirection::Output, format, DeviceSelector::Default)
            .unwrap();
        backend.control(handle, StreamCommand::Enable).unwrap();
        assert_eq!(
            backend.stream(handle).map(|s| s.state()),
            Some(StreamState::Initialized)
        );

        let mut mixer = MixBuffer::new(format, 256);
        mixer.push(&[3; 128]);
        let frames = backend
            .transfer(handle, MixerPort::Playback(&mut mixer))
            .unwrap();
        assert_eq!(frames, 32);

        backend.close(handle);
        assert!(matches!(
            backend.control(handle, StreamCommand::Disable),
            Err(AudioError::InvalidHandle(_))
        ));
        assert_eq!(host.counters(), ResourceCounters::default());
    }

    #[test]
    fn test_failed_open_keeps_no_stream() {
        let host = SimHost::new();
        let mut backend = backend(&host);
        let err = backend
            .open(
                StreamDirection::Input,
                PcmFormat::new(44100, 2, 16),
                DeviceSelector::Default,
            )
            .unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound { .. }));
        assert_eq!(host.counters(), ResourceCounters::default());
    }

    #[test]
    fn test_drop_closes_streams() {
        let host = SimHost::with_default_devices();
        {
            let mut backend = backend(&host);
            let format = PcmFormat::new(48000, 1, 16);
            let out = backend.open(StreamDirection::Output, format, DeviceSelector::Default).unwrap();
            let inp = backend.open(StreamDirection::Input, format, DeviceSelector::Default).unwrap();
            backend.control(out, StreamCommand::Enable).unwrap();
            backend.control(inp, StreamCommand::Enable).unwrap();
            assert_eq!(host.counters().running_units, 2);
        }
        assert_eq!(host.counters(), ResourceCounters::default());
    }
}
