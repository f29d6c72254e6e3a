//! 流统计模块
//!
//! 在硬件回调中收集统计信息（回调里不能打日志），由 transfer 在
//! 非实时线程上读取并报告。水位采用降频采样策略减少开销。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 统计采样间隔：每 N 次 callback 才采样一次水位
const SAMPLE_INTERVAL: u64 = 16;

/// 水位缓冲区大小
const WATER_LEVEL_BUFFER_SIZE: usize = 256;

/// 流统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct StreamStats {
    callback_count: AtomicU64,

    // 水位（字节，降频采样）
    water_level_buffer: Box<[AtomicUsize; WATER_LEVEL_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    /// 播放：ring 数据不足，输出了静音的帧数
    underrun_frames: AtomicU64,
    /// 录音：ring 已满被丢弃的字节数
    overrun_bytes: AtomicU64,
    /// 回调内原生转换失败次数
    transfer_failures: AtomicU64,
    /// 设备 IO 线程过载通知次数
    overloads: AtomicU64,
    /// transfer 累计搬运的帧数
    frames_transferred: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_frames: AtomicU64::new(0),
            overrun_bytes: AtomicU64::new(0),
            transfer_failures: AtomicU64::new(0),
            overloads: AtomicU64::new(0),
            frames_transferred: AtomicU64::new(0),
        }
    }

    /// 在回调入口调用
    ///
    /// 只在采样点才记录水位
    #[inline]
    pub fn on_callback(&self, used_bytes: usize) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count.is_multiple_of(SAMPLE_INTERVAL) {
            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % WATER_LEVEL_BUFFER_SIZE;
            self.water_level_buffer[idx].store(used_bytes, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_underrun(&self, frames: usize) {
        self.underrun_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overrun(&self, bytes: usize) {
        self.overrun_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer_failure(&self) {
        self.transfer_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overload(&self) {
        self.overloads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frames_transferred(&self, frames: usize) {
        self.frames_transferred.fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    /// 当前计数快照（不含水位）
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            callbacks: self.callback_count.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
            overrun_bytes: self.overrun_bytes.load(Ordering::Relaxed),
            transfer_failures: self.transfer_failures.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
            frames_transferred: self.frames_transferred.load(Ordering::Relaxed),
        }
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let written = self
            .water_level_write_idx
            .load(Ordering::Relaxed)
            .min(WATER_LEVEL_BUFFER_SIZE);
        let water_levels: Vec<usize> = self.water_level_buffer[..written]
            .iter()
            .map(|l| l.load(Ordering::Relaxed))
            .collect();

        StatsReport {
            counters: self.snapshot(),
            sample_interval: SAMPLE_INTERVAL,
            water_stats: WaterLevelStats {
                min: water_levels.iter().copied().min().unwrap_or(0),
                max: water_levels.iter().copied().max().unwrap_or(0),
            },
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.overrun_bytes.store(0, Ordering::Relaxed);
        self.transfer_failures.store(0, Ordering::Relaxed);
        self.overloads.store(0, Ordering::Relaxed);
        self.frames_transferred.store(0, Ordering::Relaxed);

        for level in self.water_level_buffer.iter() {
            level.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 计数快照；两次快照相减得到区间内的事件
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub callbacks: u64,
    pub underrun_frames: u64,
    pub overrun_bytes: u64,
    pub transfer_failures: u64,
    pub overloads: u64,
    pub frames_transferred: u64,
}

impl StatsSnapshot {
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            callbacks: self.callbacks.saturating_sub(earlier.callbacks),
            underrun_frames: self.underrun_frames.saturating_sub(earlier.underrun_frames),
            overrun_bytes: self.overrun_bytes.saturating_sub(earlier.overrun_bytes),
            transfer_failures: self.transfer_failures.saturating_sub(earlier.transfer_failures),
            overloads: self.overloads.saturating_sub(earlier.overloads),
            frames_transferred: self
                .frames_transferred
                .saturating_sub(earlier.frames_transferred),
        }
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub counters: StatsSnapshot,
    pub sample_interval: u64,
    pub water_stats: WaterLevelStats,
}

#[derive(Debug)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Total callbacks: {}", self.counters.callbacks)?;
        writeln!(f, "Frames transferred: {}", self.counters.frames_transferred)?;
        writeln!(f)?;

        writeln!(
            f,
            "Ring Buffer Water Level (every {} callbacks):",
            self.sample_interval
        )?;
        writeln!(f, "  Min: {} bytes", self.water_stats.min)?;
        writeln!(f, "  Max: {} bytes", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underrun frames: {}", self.counters.underrun_frames)?;
        writeln!(f, "Overrun bytes: {}", self.counters.overrun_bytes)?;
        writeln!(f, "Transfer failures: {}", self.counters.transfer_failures)?;
        writeln!(f, "Processor overloads: {}", self.counters.overloads)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_level_sampled_every_interval() {
        let stats = StreamStats::new();
        for i in 0..(SAMPLE_INTERVAL * 3) {
            stats.on_callback(100 + i as usize);
        }
        let report = stats.report();
        assert_eq!(report.counters.callbacks, SAMPLE_INTERVAL * 3);
        assert_eq!(report.water_stats.min, 100);
        assert_eq!(report.water_stats.max, 100 + 2 * SAMPLE_INTERVAL as usize);
    }

    #[test]
    fn test_snapshot_delta() {
        let stats = StreamStats::new();
        stats.record_underrun(10);
        let before = stats.snapshot();
        stats.record_underrun(5);
        stats.record_overload();

        let delta = stats.snapshot().since(&before);
        assert_eq!(delta.underrun_frames, 5);
        assert_eq!(delta.overloads, 1);
        assert_eq!(delta.overrun_bytes, 0);
    }

    #[test]
    fn test_reset() {
        let stats = StreamStats::new();
        stats.on_callback(1);
        stats.record_transfer_failure();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert_eq!(stats.report().water_stats.max, 0);
    }
}
