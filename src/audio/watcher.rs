//! 设备监视
//!
//! 宿主通知线程上的回调只做一件事：把流状态原子地标记为
//! Reinitializing。真正的 fini + init 在下一次 transfer 时由
//! 拥有流的线程完成，通知线程从不阻塞，也不碰原生资源。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;

use super::format::StreamDirection;
use super::stats::StreamStats;
use crate::host::{
    AudioHost, DeviceId, HostError, ListenTarget, ListenerKey, Property, PropertyListener,
};

/// 流生命周期状态
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Reinitializing = 3,
    Uninitializing = 4,
}

impl StreamState {
    #[inline]
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Initialized,
            3 => Self::Reinitializing,
            4 => Self::Uninitializing,
            _ => Self::Uninitialized,
        }
    }
}

/// 请求重新初始化的原因，留给流控制器打日志
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReinitCause {
    Unknown = 0,
    DefaultDeviceChanged = 1,
    DeviceNotAlive = 2,
    FormatChanged = 3,
}

impl ReinitCause {
    #[inline]
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::DefaultDeviceChanged,
            2 => Self::DeviceNotAlive,
            3 => Self::FormatChanged,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ReinitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Unknown => "unknown cause",
            Self::DefaultDeviceChanged => "default device changed",
            Self::DeviceNotAlive => "device no longer alive",
            Self::FormatChanged => "device format changed",
        };
        f.write_str(text)
    }
}

/// 每个流一个的状态字
///
/// 唯一的写者是流控制器；设备监视只能请求 Initialized → Reinitializing
pub struct StreamStatus {
    state: CachePadded<AtomicU32>,
    cause: AtomicU32,
}

impl StreamStatus {
    pub fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU32::new(StreamState::Uninitialized as u32)),
            cause: AtomicU32::new(ReinitCause::Unknown as u32),
        }
    }

    #[inline]
    pub fn load(&self) -> StreamState {
        StreamState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store(&self, state: StreamState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// 请求重新初始化；只有 Initialized 状态会被改写
    ///
    /// 返回本次是否真的改变了状态
    #[inline]
    pub fn request_reinit(&self, cause: ReinitCause) -> bool {
        let changed = self
            .state
            .compare_exchange(
                StreamState::Initialized as u32,
                StreamState::Reinitializing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if changed {
            self.cause.store(cause as u32, Ordering::Release);
        }
        changed
    }

    /// 取走最近一次请求的原因
    pub(crate) fn take_cause(&self) -> ReinitCause {
        ReinitCause::from_u32(self.cause.swap(ReinitCause::Unknown as u32, Ordering::AcqRel))
    }
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::new()
    }
}

// === 监听注册 ===

/// 一个已注册的属性监听
///
/// `release` 恰好移除一次；其余退出路径由 Drop 兜底。
/// 对象已不存在（设备被拔出）视为移除成功。
pub struct Registration {
    host: Arc<dyn AudioHost>,
    target: ListenTarget,
    key: Option<ListenerKey>,
}

impl Registration {
    pub fn subscribe(
        host: &Arc<dyn AudioHost>,
        target: ListenTarget,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<Self, HostError> {
        let key = host.add_listener(target, listener)?;
        Ok(Self {
            host: host.clone(),
            target,
            key: Some(key),
        })
    }

    pub fn target(&self) -> ListenTarget {
        self.target
    }

    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }

    pub fn release(&mut self) -> Result<(), HostError> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        match self.host.remove_listener(key) {
            Ok(()) | Err(HostError::BadObject) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to remove listener {:?}: {}", self.target, e);
        }
    }
}

// === 监视器 ===

/// 某个流的设备监视器，作为 `PropertyListener` 注册给宿主
///
/// 每次 init 针对解析出的设备新建一个，设备 ID 不会变
pub struct DeviceWatcher {
    host: Weak<dyn AudioHost>,
    direction: StreamDirection,
    device: DeviceId,
    status: Arc<StreamStatus>,
    stats: Arc<StreamStats>,
}

impl DeviceWatcher {
    pub fn new(
        host: &Arc<dyn AudioHost>,
        direction: StreamDirection,
        device: DeviceId,
        status: Arc<StreamStatus>,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            host: Arc::downgrade(host),
            direction,
            device,
            status,
            stats,
        }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// 系统默认设备变化：只有真的换了设备才请求重建
    pub fn on_default_device_changed(&self, direction: StreamDirection) {
        if direction != self.direction {
            return;
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };

        match host.default_device(direction) {
            Ok(new) if new != self.device() => {
                self.status.request_reinit(ReinitCause::DefaultDeviceChanged);
            }
            // 读不到默认设备时保持现状，设备真的失效会有存活通知
            Ok(_) | Err(_) => {}
        }
    }

    /// 设备存活状态变化：不再存活（或已无法查询）则请求重建
    pub fn on_device_state_changed(&self, device: DeviceId) {
        if device != self.device() {
            return;
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };

        match host.is_alive(device) {
            Ok(false) | Err(HostError::BadDevice) => {
                self.status.request_reinit(ReinitCause::DeviceNotAlive);
            }
            Ok(true) | Err(_) => {}
        }
    }

    /// 设备格式（名义采样率）变化
    pub fn on_format_property_changed(&self, device: DeviceId) {
        if device != self.device() {
            return;
        }
        self.status.request_reinit(ReinitCause::FormatChanged);
    }
}

impl PropertyListener for DeviceWatcher {
    fn property_changed(&self, object: DeviceId, property: Property) {
        match property {
            Property::DefaultDevice(direction) => self.on_default_device_changed(direction),
            Property::DeviceIsAlive => self.on_device_state_changed(object),
            Property::NominalSampleRate => self.on_format_property_changed(object),
            Property::ProcessorOverload => {
                if object == self.device() {
                    self.stats.record_overload();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SimDevice, SimHost};

    type Fixture = (Arc<dyn AudioHost>, Arc<DeviceWatcher>, Arc<StreamStatus>);

    /// 监视器只持有宿主的 Weak，返回的 Arc 需要在测试期间保持存活
    fn watcher_on(host: &SimHost, device: DeviceId) -> Fixture {
        let shared: Arc<dyn AudioHost> = Arc::new(host.clone());
        let status = Arc::new(StreamStatus::new());
        status.store(StreamState::Initialized);
        let watcher = Arc::new(DeviceWatcher::new(
            &shared,
            StreamDirection::Output,
            device,
            status.clone(),
            Arc::new(StreamStats::new()),
        ));
        (shared, watcher, status)
    }

    #[test]
    fn test_request_reinit_only_from_initialized() {
        let status = StreamStatus::new();
        assert!(!status.request_reinit(ReinitCause::Unknown));
        assert_eq!(status.load(), StreamState::Uninitialized);

        status.store(StreamState::Initialized);
        assert!(status.request_reinit(ReinitCause::Unknown));
        assert_eq!(status.load(), StreamState::Reinitializing);
        assert!(!status.request_reinit(ReinitCause::Unknown));
    }

    #[test]
    fn test_default_change_to_same_device_is_ignored() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("a", 48000, 2));
        let (_shared, watcher, status) = watcher_on(&host, dev);

        watcher.on_default_device_changed(StreamDirection::Output);
        assert_eq!(status.load(), StreamState::Initialized);

        // 另一方向的通知也不相关
        watcher.on_default_device_changed(StreamDirection::Input);
        assert_eq!(status.load(), StreamState::Initialized);
    }

    #[test]
    fn test_default_change_to_other_device() {
        let host = SimHost::new();
        let a = host.add_device(SimDevice::output("a", 48000, 2));
        let b = host.add_device(SimDevice::output("b", 48000, 2));
        let (shared, watcher, status) = watcher_on(&host, a);

        let _reg = Registration::subscribe(
            &shared,
            ListenTarget::System(Property::DefaultDevice(StreamDirection::Output)),
            watcher.clone(),
        )
        .unwrap();

        host.set_default_device(StreamDirection::Output, b);
        assert_eq!(status.load(), StreamState::Reinitializing);
    }

    #[test]
    fn test_dead_device_requests_reinit() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("a", 48000, 2));
        let (_shared, watcher, status) = watcher_on(&host, dev);

        watcher.on_device_state_changed(dev);
        assert_eq!(status.load(), StreamState::Initialized);

        host.kill_device(dev);
        watcher.on_device_state_changed(dev);
        assert_eq!(status.load(), StreamState::Reinitializing);
    }

    #[test]
    fn test_cause_is_recorded_for_controller() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("a", 48000, 2));
        let (_shared, watcher, status) = watcher_on(&host, dev);

        // 通知线程只记原因，日志由流控制器在 transfer 里打
        watcher.on_format_property_changed(dev);
        assert_eq!(status.load(), StreamState::Reinitializing);
        assert_eq!(status.take_cause(), ReinitCause::FormatChanged);
        assert_eq!(status.take_cause(), ReinitCause::Unknown);

        // 已在 Reinitializing 时后来的原因不覆盖
        host.kill_device(dev);
        watcher.on_device_state_changed(dev);
        assert_eq!(status.take_cause(), ReinitCause::Unknown);
    }

    #[test]
    fn test_overload_only_counts() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("a", 48000, 2));
        let (_shared, watcher, status) = watcher_on(&host, dev);

        watcher.property_changed(dev, Property::ProcessorOverload);
        assert_eq!(status.load(), StreamState::Initialized);
        assert_eq!(watcher.stats.snapshot().overloads, 1);
    }

    #[test]
    fn test_registration_releases_once() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("a", 48000, 2));
        let (shared, watcher, _) = watcher_on(&host, dev);

        let mut reg = Registration::subscribe(
            &shared,
            ListenTarget::Device(dev, Property::DeviceIsAlive),
            watcher,
        )
        .unwrap();
        assert_eq!(host.counters().listeners, 1);

        reg.release().unwrap();
        assert!(!reg.is_active());
        assert_eq!(host.counters().listeners, 0);
        reg.release().unwrap();
        drop(reg);
        assert_eq!(host.counters().listeners, 0);
    }

    #[test]
    fn test_release_after_device_removed_is_ok() {
        let host = SimHost::new();
        let dev = host.add_device(SimDevice::output("a", 48000, 2));
        let (shared, watcher, _) = watcher_on(&host, dev);

        let mut reg = Registration::subscribe(
            &shared,
            ListenTarget::Device(dev, Property::NominalSampleRate),
            watcher,
        )
        .unwrap();
        host.remove_device(dev);
        assert!(reg.release().is_ok());
    }
}
