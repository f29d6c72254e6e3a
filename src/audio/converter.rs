//! 采样转换器
//!
//! 重采样和位深转换交给原生转换器，这里只负责：
//! - 创建时把不支持的格式翻译成 `ConversionUnsupported`
//! - 声道数不一致时安装显式声道映射
//! - 停止后重启时清空转换器历史

use super::error::AudioError;
use super::format::NativeFormat;
use crate::host::{AudioHost, HostError, NativeConverter, PullSource};

/// 声道映射策略：`map[目标声道] = 源声道`，-1 为静音
///
/// - mono → N：所有目标声道都取声道 0
/// - 其他：目标声道 i 取源声道 i，源里没有则静音（降混时丢弃多余的源声道）
pub fn channel_map(source_channels: u32, target_channels: u32) -> Vec<i32> {
    (0..target_channels)
        .map(|i| {
            if source_channels == 1 {
                0
            } else if i < source_channels {
                i as i32
            } else {
                -1
            }
        })
        .collect()
}

/// 一个已配置好的转换器
pub struct SampleConverter {
    inner: Box<dyn NativeConverter>,
    /// 输出格式，fill 只写整帧
    target: NativeFormat,
}

impl SampleConverter {
    /// 创建 source → target 的转换器
    pub fn create(
        host: &dyn AudioHost,
        source: &NativeFormat,
        target: &NativeFormat,
    ) -> Result<Self, AudioError> {
        let mut inner = host.new_converter(source, target).map_err(|e| match e {
            HostError::FormatUnsupported | HostError::Unsupported => {
                AudioError::ConversionUnsupported(format!("{source} -> {target}"))
            }
            other => AudioError::init("create converter", other),
        })?;

        if source.channels_per_frame != target.channels_per_frame {
            let map = channel_map(source.channels_per_frame, target.channels_per_frame);
            inner.set_channel_map(&map).map_err(|e| {
                AudioError::ConversionUnsupported(format!(
                    "channel map {map:?} for {} -> {} channels: {e}",
                    source.channels_per_frame, target.channels_per_frame
                ))
            })?;
            log::debug!("Converter channel map {:?}", map);
        }

        log::info!("Sample converter: {} -> {}", source, target);

        Ok(Self {
            inner,
            target: *target,
        })
    }

    /// 用目标格式数据填充 `out`，返回产出的字节数
    ///
    /// 源报告 EndOfData 时返回部分结果而不是失败
    #[inline]
    pub fn fill_output_buffer(
        &mut self,
        out: &mut [u8],
        source: &mut dyn PullSource,
    ) -> Result<usize, HostError> {
        let whole = out.len() - out.len() % self.target.bytes_per_frame().max(1);
        self.inner.fill(&mut out[..whole], source)
    }

    /// 清空历史状态
    pub fn reset(&mut self) -> Result<(), HostError> {
        self.inner.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{to_native_format, PcmFormat};
    use crate::host::{Pull, SimHost};

    struct Chunks {
        data: Vec<u8>,
        pos: usize,
        bpf: usize,
    }

    impl PullSource for Chunks {
        fn pull(&mut self, max_frames: usize) -> Result<Pull<'_>, HostError> {
            let n = (max_frames * self.bpf).min(self.data.len() - self.pos);
            if n == 0 {
                return Ok(Pull::EndOfData);
            }
            let start = self.pos;
            self.pos += n;
            Ok(Pull::Data(&self.data[start..start + n]))
        }
    }

    fn convert(src: PcmFormat, dst: PcmFormat, input: &[u8], out_len: usize) -> Vec<u8> {
        let host = SimHost::new();
        let mut conv =
            SampleConverter::create(&host, &to_native_format(&src), &to_native_format(&dst))
                .unwrap();
        let mut source = Chunks {
            data: input.to_vec(),
            pos: 0,
            bpf: src.bytes_per_frame(),
        };
        let mut out = vec![0u8; out_len];
        let n = conv.fill_output_buffer(&mut out, &mut source).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn test_channel_map_policy() {
        assert_eq!(channel_map(1, 2), vec![0, 0]);
        assert_eq!(channel_map(1, 4), vec![0, 0, 0, 0]);
        assert_eq!(channel_map(2, 1), vec![0]);
        assert_eq!(channel_map(2, 4), vec![0, 1, -1, -1]);
        assert_eq!(channel_map(6, 2), vec![0, 1]);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let out = convert(
            PcmFormat::new(44100, 1, 8),
            PcmFormat::new(44100, 2, 8),
            &[10, 20, 30],
            64,
        );
        assert_eq!(out, vec![10, 10, 20, 20, 30, 30]);
    }

    #[test]
    fn test_stereo_to_mono_keeps_first_channel() {
        let input: Vec<u8> = [100i16, -5, 200, -6]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = convert(
            PcmFormat::new(48000, 2, 16),
            PcmFormat::new(48000, 1, 16),
            &input,
            64,
        );
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![100, 200]);
    }

    #[test]
    fn test_stereo_to_quad_silences_extra_channels() {
        let input: Vec<u8> = [1000i16, 2000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = convert(
            PcmFormat::new(48000, 2, 16),
            PcmFormat::new(48000, 4, 16),
            &input,
            64,
        );
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![1000, 2000, 0, 0]);
    }

    #[test]
    fn test_partial_buffer_is_whole_frames() {
        let out = convert(
            PcmFormat::new(44100, 1, 16),
            PcmFormat::new(44100, 2, 16),
            &[1, 0, 2, 0],
            7, // 不足两帧，只能产出一帧
        );
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_unsupported_format() {
        let host = SimHost::new();
        let src = to_native_format(&PcmFormat::new(44100, 2, 12));
        let dst = to_native_format(&PcmFormat::new(48000, 2, 16));
        assert!(matches!(
            SampleConverter::create(&host, &src, &dst),
            Err(AudioError::ConversionUnsupported(_))
        ));
        assert_eq!(host.counters().converters, 0);
    }

    #[test]
    fn test_reset_clears_pending_input() {
        let host = SimHost::new();
        let src = to_native_format(&PcmFormat::new(44100, 1, 8));
        let dst = to_native_format(&PcmFormat::new(44100, 1, 8));
        let mut conv = SampleConverter::create(&host, &src, &dst).unwrap();

        let mut source = Chunks { data: vec![1, 2, 3, 4], pos: 0, bpf: 1 };
        let mut out = [0u8; 2];
        assert_eq!(conv.fill_output_buffer(&mut out, &mut source).unwrap(), 2);

        conv.reset().unwrap();
        let mut fresh = Chunks { data: vec![9], pos: 0, bpf: 1 };
        assert_eq!(conv.fill_output_buffer(&mut out, &mut fresh).unwrap(), 1);
        assert_eq!(out[0], 9);
    }
}
