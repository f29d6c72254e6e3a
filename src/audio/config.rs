//! 流与后端配置

use std::time::Duration;

use super::format::StreamDirection;

/// 输出设备 UID 环境变量
pub const ENV_OUTPUT_DEVICE_UID: &str = "HOST_AUDIO_OUTPUT_DEVICE_UID";
/// 输入设备 UID 环境变量
pub const ENV_INPUT_DEVICE_UID: &str = "HOST_AUDIO_INPUT_DEVICE_UID";

/// 设备选择
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// 系统默认设备，跟随默认设备变化
    #[default]
    Default,
    /// 按 UID 固定设备；找不到时回退到默认设备
    ByUid(String),
}

impl DeviceSelector {
    /// 空字符串视为默认设备
    pub fn from_uid(uid: Option<&str>) -> Self {
        match uid.map(str::trim) {
            Some(uid) if !uid.is_empty() => Self::ByUid(uid.to_string()),
            _ => Self::Default,
        }
    }
}

/// 单个流的配置
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// 请求的硬件缓冲帧数（None 表示沿用设备当前值）
    pub buffer_frames: Option<u32>,
    /// 是否 mlock ring buffer 内存
    pub lock_memory: bool,
    /// 是否监听设备 IO 过载
    pub watch_overload: bool,
    /// 重建失败后的首次重试间隔
    pub reinit_backoff_initial: Duration,
    /// 重试间隔上限
    pub reinit_backoff_max: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_frames: None,
            lock_memory: false,
            watch_overload: true,
            reinit_backoff_initial: Duration::from_millis(50),
            reinit_backoff_max: Duration::from_secs(2),
        }
    }
}

/// 后端配置
#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    pub output_device: DeviceSelector,
    pub input_device: DeviceSelector,
    pub stream: StreamConfig,
}

impl BackendConfig {
    /// 默认配置 + 环境变量里的设备 UID
    pub fn from_env() -> Self {
        let output = std::env::var(ENV_OUTPUT_DEVICE_UID).ok();
        let input = std::env::var(ENV_INPUT_DEVICE_UID).ok();

        let config = Self {
            output_device: DeviceSelector::from_uid(output.as_deref()),
            input_device: DeviceSelector::from_uid(input.as_deref()),
            ..Self::default()
        };

        log::debug!(
            "Backend config: output={:?} input={:?}",
            config.output_device,
            config.input_device
        );
        config
    }

    pub fn device(&self, direction: StreamDirection) -> &DeviceSelector {
        match direction {
            StreamDirection::Input => &self.input_device,
            StreamDirection::Output => &self.output_device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_from_uid() {
        assert_eq!(DeviceSelector::from_uid(None), DeviceSelector::Default);
        assert_eq!(DeviceSelector::from_uid(Some("  ")), DeviceSelector::Default);
        assert_eq!(
            DeviceSelector::from_uid(Some("AppleHDAEngineOutput:1")),
            DeviceSelector::ByUid("AppleHDAEngineOutput:1".into())
        );
    }

    #[test]
    fn test_default_backoff_bounds() {
        let config = StreamConfig::default();
        assert!(config.reinit_backoff_initial < config.reinit_backoff_max);
        assert_eq!(config.buffer_frames, None);
    }

    #[test]
    fn test_device_by_direction() {
        let config = BackendConfig {
            input_device: DeviceSelector::ByUid("mic".into()),
            ..BackendConfig::default()
        };
        assert_eq!(config.device(StreamDirection::Output), &DeviceSelector::Default);
        assert_eq!(
            config.device(StreamDirection::Input),
            &DeviceSelector::ByUid("mic".into())
        );
    }
}
