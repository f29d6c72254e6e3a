//! 错误分类
//!
//! 原生 API 错误在 Stream Controller 边界翻译为 `AudioError`。
//! 实时回调从不返回错误，只更新原子计数。

use thiserror::Error;

use super::format::StreamDirection;
use crate::host::HostError;

/// 流引擎错误
#[derive(Debug, Error)]
pub enum AudioError {
    /// 没有可用的默认设备或指定 UID 的设备
    #[error("no usable {direction} device{}", .uid.as_deref().map(|u| format!(" (uid {u})")).unwrap_or_default())]
    DeviceNotFound {
        direction: StreamDirection,
        uid: Option<String>,
    },

    /// 原生资源获取或配置失败（已释放所有部分资源）
    #[error("backend init failed: {step}")]
    BackendInitFailed {
        step: &'static str,
        #[source]
        source: Option<HostError>,
    },

    /// 设备报告了 0 声道或 0 采样率
    #[error("device format invalid: {0}")]
    DeviceFormatInvalid(String),

    /// 无法在设备格式和请求格式之间转换
    #[error("conversion unsupported: {0}")]
    ConversionUnsupported(String),

    /// 回调里的 render/capture 转换失败；只在 transfer 时汇总报告
    #[error("{failures} transfer failures in callback")]
    TransferFailure { failures: u64 },

    /// 设备已失效，等待下一次 transfer 重新初始化
    #[error("device invalidated, reinitialization pending")]
    DeviceInvalidated,

    /// 流句柄不存在（已关闭或从未打开）
    #[error("invalid stream handle {0}")]
    InvalidHandle(u32),
}

impl AudioError {
    /// 包装某一步骤的原生错误
    pub(crate) fn init(step: &'static str, source: HostError) -> Self {
        Self::BackendInitFailed {
            step,
            source: Some(source),
        }
    }

    /// 没有原生错误码的初始化失败
    pub(crate) fn init_step(step: &'static str) -> Self {
        Self::BackendInitFailed { step, source: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_not_found_message() {
        let err = AudioError::DeviceNotFound {
            direction: StreamDirection::Output,
            uid: Some("BuiltInSpeakerDevice".into()),
        };
        assert_eq!(
            err.to_string(),
            "no usable output device (uid BuiltInSpeakerDevice)"
        );

        let err = AudioError::DeviceNotFound {
            direction: StreamDirection::Input,
            uid: None,
        };
        assert_eq!(err.to_string(), "no usable input device");
    }

    #[test]
    fn test_transfer_failure_message() {
        let err = AudioError::TransferFailure { failures: 3 };
        assert_eq!(err.to_string(), "3 transfer failures in callback");
    }

    #[test]
    fn test_init_error_keeps_source() {
        use std::error::Error as _;

        let err = AudioError::init("initialize unit", HostError::Status(-10863));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "backend init failed: initialize unit");
    }
}
