//! 混音器一侧的缓冲接口
//!
//! 混音器本身不在本 crate 范围内，这里只定义 transfer 需要的最小接口，
//! 以及一个内存实现 `MixBuffer`（CLI 和测试使用）。

use std::collections::VecDeque;

use crate::audio::format::PcmFormat;

/// 播放：流控制器从混音器取数据填 ring
pub trait PlaybackSource {
    /// 当前可读字节数
    fn available_bytes(&self) -> usize;

    /// 读取到 `buf`，返回读取的字节数（整帧）
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// 本次 transfer 结束，通知消费掉的帧数
    fn finish(&mut self, frames: usize);
}

/// 录音：流控制器把 ring 中的数据交给混音器
pub trait CaptureSink {
    /// 当前可写字节数
    fn free_bytes(&self) -> usize;

    /// 写入数据，返回接受的字节数
    fn write(&mut self, data: &[u8]) -> usize;

    /// 提交本次写入的帧，返回混音器实际采纳的帧数
    fn mix_in(&mut self, frames: usize) -> usize;
}

/// transfer 的对端，方向必须与流一致
pub enum MixerPort<'a> {
    Playback(&'a mut dyn PlaybackSource),
    Capture(&'a mut dyn CaptureSink),
}

/// 固定容量的内存混音缓冲
pub struct MixBuffer {
    format: PcmFormat,
    data: VecDeque<u8>,
    capacity: usize,
    frames_finished: u64,
    frames_mixed: u64,
}

impl MixBuffer {
    pub fn new(format: PcmFormat, capacity_frames: usize) -> Self {
        let capacity = capacity_frames * format.bytes_per_frame();
        Self {
            format,
            data: VecDeque::with_capacity(capacity),
            capacity,
            frames_finished: 0,
            frames_mixed: 0,
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    /// 追加数据（整帧），返回写入的字节数
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let bpf = self.format.bytes_per_frame().max(1);
        let room = self.capacity - self.data.len();
        let n = bytes.len().min(room);
        let n = n - n % bpf;
        self.data.extend(&bytes[..n]);
        n
    }

    /// 取出数据（整帧），返回读取的字节数
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let bpf = self.format.bytes_per_frame().max(1);
        let n = out.len().min(self.data.len());
        let n = n - n % bpf;
        for (dst, src) in out[..n].iter_mut().zip(self.data.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// 播放方向累计被消费的帧数
    pub fn frames_finished(&self) -> u64 {
        self.frames_finished
    }

    /// 录音方向累计混入的帧数
    pub fn frames_mixed(&self) -> u64 {
        self.frames_mixed
    }
}

impl PlaybackSource for MixBuffer {
    fn available_bytes(&self) -> usize {
        self.data.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.pop(buf)
    }

    fn finish(&mut self, frames: usize) {
        self.frames_finished += frames as u64;
    }
}

impl CaptureSink for MixBuffer {
    fn free_bytes(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.push(data)
    }

    fn mix_in(&mut self, frames: usize) -> usize {
        self.frames_mixed += frames as u64;
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_whole_frames() {
        let mut buf = MixBuffer::new(PcmFormat::new(48000, 2, 16), 2);
        assert_eq!(buf.capacity_bytes(), 8);

        // 10 字节只能放下两帧
        assert_eq!(buf.push(&[1; 10]), 8);
        assert_eq!(CaptureSink::free_bytes(&buf), 0);

        let mut out = [0u8; 6];
        assert_eq!(buf.pop(&mut out), 4);
        assert_eq!(buf.available_bytes(), 4);
    }

    #[test]
    fn test_counters() {
        let mut buf = MixBuffer::new(PcmFormat::new(48000, 1, 16), 16);
        buf.finish(3);
        assert_eq!(buf.mix_in(5), 5);
        assert_eq!(buf.frames_finished(), 3);
        assert_eq!(buf.frames_mixed(), 5);
    }
}
