//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 数据传递
//! - Format: PCM 格式与原生格式描述
//! - Converter: 采样率/声道转换
//! - Callback: 实时回调上下文
//! - Watcher: 设备变化监听
//! - Stream: 流状态机
//! - Stats: 流统计

pub mod callback;
pub mod config;
pub mod converter;
pub mod error;
pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod stream;
pub mod watcher;

pub use config::{BackendConfig, DeviceSelector, StreamConfig};
pub use error::AudioError;
pub use format::{PcmFormat, StreamDirection};
pub use ring_buffer::RingBuffer;
pub use stats::{StatsReport, StatsSnapshot, StreamStats};
pub use stream::{Stream, StreamCommand};
pub use watcher::{ReinitCause, StreamState};
