//! 音频格式与格式协商
//!
//! - `PcmFormat`: 混音器一侧请求的抽象 PCM 格式
//! - `NativeFormat`: 设备/原生 API 使用的格式描述（与 AudioStreamBasicDescription 对应）
//!
//! 样本内部表示：所有位深统一左对齐到 i32 的高位
//! - 8-bit:  占据 bit[31:24]
//! - 16-bit: 占据 bit[31:16]
//! - 24-bit: 占据 bit[31:8]
//! - 32-bit: 占据 bit[31:0]

use std::fmt;

use super::error::AudioError;

/// 流方向，流实例创建后不可变
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Input,
    Output,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// 请求的 PCM 格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub signed: bool,
    pub float: bool,
}

impl PcmFormat {
    /// 有符号整数 PCM
    pub fn new(sample_rate_hz: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate_hz,
            channels,
            bits_per_sample,
            signed: bits_per_sample > 8,
            float: false,
        }
    }

    /// 32-bit 浮点 PCM
    pub fn float32(sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            sample_rate_hz,
            channels,
            bits_per_sample: 32,
            signed: true,
            float: true,
        }
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 兼容 = 采样率和声道数完全一致（位深由原生 API 打包处理）
    #[inline]
    pub fn is_compatible(&self, other: &PcmFormat) -> bool {
        self.sample_rate_hz == other.sample_rate_hz && self.channels == other.channels
    }

    /// 0 声道 / 0 采样率 / 0 位深都视为无效
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.channels == 0 {
            return Err(AudioError::DeviceFormatInvalid("zero channels".into()));
        }
        if self.sample_rate_hz == 0 {
            return Err(AudioError::DeviceFormatInvalid("zero sample rate".into()));
        }
        if self.bits_per_sample == 0 {
            return Err(AudioError::DeviceFormatInvalid("zero bits per sample".into()));
        }
        Ok(())
    }

    /// 将原始字节解码为 i32 样本（左对齐到 32-bit）
    ///
    /// 返回解码的样本数；不支持的编码返回 0
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut [i32]) -> usize {
        let width = self.bytes_per_sample();
        if width == 0 {
            return 0;
        }
        let count = (bytes.len() / width).min(output.len());

        for (i, chunk) in bytes.chunks_exact(width).take(count).enumerate() {
            output[i] = match (width, self.float) {
                (1, _) if self.signed => (chunk[0] as i8 as i32) << 24,
                (1, _) => (chunk[0] as i32 - 128) << 24,
                (2, _) => (i16::from_le_bytes([chunk[0], chunk[1]]) as i32) << 16,
                (3, _) => {
                    let raw = (chunk[0] as i32) | ((chunk[1] as i32) << 8) | ((chunk[2] as i32) << 16);
                    // 符号扩展 24-bit → 32-bit 后左对齐
                    ((raw << 8) >> 8) << 8
                }
                (4, false) => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                (4, true) => {
                    let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    (v.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32
                }
                _ => return 0,
            };
        }
        count
    }

    /// 将 i32 样本（左对齐）打包为字节
    ///
    /// 返回写入的字节数
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut [u8]) -> usize {
        let width = self.bytes_per_sample();
        if width == 0 {
            return 0;
        }
        let count = samples.len().min(output.len() / width);

        for (i, &sample) in samples.iter().take(count).enumerate() {
            let dst = &mut output[i * width..(i + 1) * width];
            match (width, self.float) {
                (1, _) if self.signed => dst[0] = (sample >> 24) as i8 as u8,
                (1, _) => dst[0] = ((sample >> 24) + 128) as u8,
                (2, _) => dst.copy_from_slice(&((sample >> 16) as i16).to_le_bytes()),
                (3, _) => {
                    let v = sample >> 8;
                    dst[0] = (v & 0xFF) as u8;
                    dst[1] = ((v >> 8) & 0xFF) as u8;
                    dst[2] = ((v >> 16) & 0xFF) as u8;
                }
                (4, false) => dst.copy_from_slice(&sample.to_le_bytes()),
                (4, true) => {
                    let v = (sample as f64 / i32::MAX as f64) as f32;
                    dst.copy_from_slice(&v.to_le_bytes());
                }
                _ => return 0,
            }
        }
        count * width
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit{}",
            self.sample_rate_hz,
            self.channels,
            self.bits_per_sample,
            if self.float { " float" } else if self.signed { " signed" } else { " unsigned" }
        )
    }
}

// === 原生格式描述 ===

pub const FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
pub const FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
pub const FORMAT_FLAG_IS_BIG_ENDIAN: u32 = 1 << 1;
pub const FORMAT_FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
pub const FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;
pub const FORMAT_FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

/// 原生格式描述，字段与 AudioStreamBasicDescription 一一对应
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NativeFormat {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
}

impl NativeFormat {
    #[inline]
    pub fn is_float(&self) -> bool {
        self.format_flags & FORMAT_FLAG_IS_FLOAT != 0
    }

    #[inline]
    pub fn is_signed(&self) -> bool {
        self.format_flags & FORMAT_FLAG_IS_SIGNED_INTEGER != 0
    }

    #[inline]
    pub fn is_non_interleaved(&self) -> bool {
        self.format_flags & FORMAT_FLAG_IS_NON_INTERLEAVED != 0
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame as usize
    }
}

impl fmt::Display for NativeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit flags={:#x} {}B/frame",
            self.sample_rate,
            self.channels_per_frame,
            self.bits_per_channel,
            self.format_flags,
            self.bytes_per_frame
        )
    }
}

/// 抽象 PCM 格式 → 原生格式（交织、packed、little-endian）
pub fn to_native_format(format: &PcmFormat) -> NativeFormat {
    let mut flags = FORMAT_FLAG_IS_PACKED;
    if format.float {
        flags |= FORMAT_FLAG_IS_FLOAT;
    } else if format.signed {
        flags |= FORMAT_FLAG_IS_SIGNED_INTEGER;
    }

    let bytes_per_frame = format.bytes_per_frame() as u32;
    NativeFormat {
        sample_rate: format.sample_rate_hz as f64,
        format_id: FORMAT_LINEAR_PCM,
        format_flags: flags,
        bytes_per_packet: bytes_per_frame,
        frames_per_packet: 1,
        bytes_per_frame,
        channels_per_frame: format.channels as u32,
        bits_per_channel: format.bits_per_sample as u32,
    }
}

/// 原生格式 → 抽象 PCM 格式
///
/// 设备报告 0 声道或 0 采样率时协商失败
pub fn from_native_format(native: &NativeFormat) -> Result<PcmFormat, AudioError> {
    if native.channels_per_frame == 0 {
        return Err(AudioError::DeviceFormatInvalid(format!(
            "device reports zero channels ({native})"
        )));
    }
    if native.sample_rate <= 0.0 || !native.sample_rate.is_finite() {
        return Err(AudioError::DeviceFormatInvalid(format!(
            "device reports sample rate {} ({native})",
            native.sample_rate
        )));
    }
    if native.bytes_per_frame == 0 {
        return Err(AudioError::DeviceFormatInvalid(format!(
            "device reports zero bytes per frame ({native})"
        )));
    }

    let channels = u16::try_from(native.channels_per_frame)
        .map_err(|_| AudioError::DeviceFormatInvalid(format!("too many channels ({native})")))?;

    Ok(PcmFormat {
        sample_rate_hz: native.sample_rate.round() as u32,
        channels,
        bits_per_sample: native.bits_per_channel as u16,
        signed: native.is_signed() || native.is_float(),
        float: native.is_float(),
    })
}

/// 采样率或声道数不同时需要转换器
pub fn needs_conversion(requested: &NativeFormat, device: &NativeFormat) -> bool {
    requested.sample_rate != device.sample_rate
        || requested.channels_per_frame != device.channels_per_frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_native_format_s16_stereo() {
        let native = to_native_format(&PcmFormat::new(44100, 2, 16));
        assert_eq!(native.sample_rate, 44100.0);
        assert_eq!(native.format_id, FORMAT_LINEAR_PCM);
        assert_eq!(native.bytes_per_frame, 4);
        assert_eq!(native.bytes_per_packet, 4);
        assert_eq!(native.frames_per_packet, 1);
        assert!(native.is_signed());
        assert!(!native.is_float());
    }

    #[test]
    fn test_native_round_trip_keeps_float_flag() {
        let fmt = PcmFormat::float32(48000, 2);
        let back = from_native_format(&to_native_format(&fmt)).unwrap();
        assert_eq!(back, fmt);
    }

    #[test]
    fn test_needs_conversion() {
        let a = to_native_format(&PcmFormat::new(48000, 2, 16));
        let b = to_native_format(&PcmFormat::new(44100, 2, 16));
        let c = to_native_format(&PcmFormat::float32(48000, 2));
        let d = to_native_format(&PcmFormat::new(48000, 1, 16));

        assert!(needs_conversion(&a, &b));
        assert!(needs_conversion(&a, &d));
        // 位深不同不需要转换器，由原生 API 打包
        assert!(!needs_conversion(&a, &c));
    }

    #[test]
    fn test_zero_channels_is_invalid() {
        let mut native = to_native_format(&PcmFormat::new(44100, 2, 16));
        native.channels_per_frame = 0;
        assert!(matches!(
            from_native_format(&native),
            Err(AudioError::DeviceFormatInvalid(_))
        ));
    }

    #[test]
    fn test_zero_rate_is_invalid() {
        let mut native = to_native_format(&PcmFormat::new(44100, 2, 16));
        native.sample_rate = 0.0;
        assert!(matches!(
            from_native_format(&native),
            Err(AudioError::DeviceFormatInvalid(_))
        ));
        assert!(PcmFormat::new(0, 2, 16).validate().is_err());
    }

    #[test]
    fn test_u8_codec() {
        let fmt = PcmFormat::new(8000, 1, 8);
        assert!(!fmt.signed);

        let mut samples = [0i32; 3];
        assert_eq!(fmt.bytes_to_samples(&[10, 128, 255], &mut samples), 3);
        assert_eq!(samples[1], 0);

        let mut bytes = [0u8; 3];
        assert_eq!(fmt.samples_to_bytes(&samples, &mut bytes), 3);
        assert_eq!(bytes, [10, 128, 255]);
    }

    #[test]
    fn test_s24_sign_extension() {
        let fmt = PcmFormat::new(48000, 1, 24);
        let mut samples = [0i32; 1];
        // -1 in 24-bit little-endian
        fmt.bytes_to_samples(&[0xFF, 0xFF, 0xFF], &mut samples);
        assert_eq!(samples[0], -256);

        let mut bytes = [0u8; 3];
        fmt.samples_to_bytes(&samples, &mut bytes);
        assert_eq!(bytes, [0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_compatible_ignores_bit_depth() {
        let a = PcmFormat::new(44100, 2, 16);
        let b = PcmFormat::new(44100, 2, 24);
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&PcmFormat::new(48000, 2, 16)));
    }
}
