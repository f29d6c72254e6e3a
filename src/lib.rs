//! Host Audio Bridge Library
//!
//! 宿主音频后端：把虚拟机混音器的流桥接到宿主音频设备。
//! 设备切换、拔出和采样率变化时自动重建流。

pub mod audio;
pub mod backend;
pub mod host;
