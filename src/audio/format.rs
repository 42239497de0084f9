//! 音频格式、样本编码与格式协商
//!
//! 内部表示：所有位深统一左对齐到 i32 的高位
//! - 16-bit: 占据 bit[31:16]，bit[15:0] = 0
//! - 24-bit: 占据 bit[31:8]，bit[7:0] = 0
//! - 32-bit: 占据 bit[31:0]
//!
//! 输出时再按协商结果打包成设备的样本编码。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::device::{Access, PcmDevice};
use super::session::InitError;

/// 样本类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleKind {
    U8,
    S8,
    U16,
    S16,
    U24,
    S24,
    U32,
    S32,
    Float,
    Double,
}

impl SampleKind {
    /// 每样本字节数（24-bit 为 3 字节紧凑格式）
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 => 2,
            Self::U24 | Self::S24 => 3,
            Self::U32 | Self::S32 | Self::Float => 4,
            Self::Double => 8,
        }
    }

    #[inline]
    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U24 | Self::U32)
    }

    fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S8 => "s8",
            Self::U16 => "u16",
            Self::S16 => "s16",
            Self::U24 => "u24",
            Self::S24 => "s24",
            Self::U32 => "u32",
            Self::S32 => "s32",
            Self::Float => "float",
            Self::Double => "double",
        }
    }
}

/// 样本编码：类型 + 平面标志
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleEncoding {
    pub kind: SampleKind,
    pub planar: bool,
}

impl SampleEncoding {
    pub const S16: Self = Self::interleaved(SampleKind::S16);

    pub const fn interleaved(kind: SampleKind) -> Self {
        Self {
            kind,
            planar: false,
        }
    }

    pub const fn planar(kind: SampleKind) -> Self {
        Self { kind, planar: true }
    }

    /// 去掉平面标志
    #[inline]
    pub fn to_interleaved(self) -> Self {
        Self::interleaved(self.kind)
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.name(), if self.planar { "p" } else { "" })
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const KINDS: [SampleKind; 10] = [
            SampleKind::U8,
            SampleKind::S8,
            SampleKind::U16,
            SampleKind::S16,
            SampleKind::U24,
            SampleKind::S24,
            SampleKind::U32,
            SampleKind::S32,
            SampleKind::Float,
            SampleKind::Double,
        ];

        let s = s.trim().to_ascii_lowercase();
        if let Some(kind) = KINDS.iter().find(|k| k.name() == s) {
            return Ok(Self::interleaved(*kind));
        }
        s.strip_suffix('p')
            .and_then(|base| KINDS.iter().find(|k| k.name() == base))
            .map(|kind| Self::planar(*kind))
            .ok_or_else(|| format!("unknown sample format '{}'", s))
    }
}

/// 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub encoding: SampleEncoding,
    pub channels: u32,
    pub sample_rate: u32,
}

impl StreamFormat {
    pub fn new(encoding: SampleEncoding, channels: u32, sample_rate: u32) -> Self {
        Self {
            encoding,
            channels,
            sample_rate,
        }
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.encoding.kind.bytes()
    }

    /// 每帧的字节数（所有声道）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 缓冲区个数：平面格式每声道一个，交织格式一个
    #[inline]
    pub fn planes(&self) -> usize {
        if self.encoding.planar {
            self.channels as usize
        } else {
            1
        }
    }

    /// 单个缓冲区中每帧占用的字节数
    #[inline]
    pub fn plane_frame_bytes(&self) -> usize {
        if self.encoding.planar {
            self.bytes_per_sample()
        } else {
            self.bytes_per_frame()
        }
    }

    /// sample_rate > 0 且 channels > 0
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }

    /// 帧数 → 时长
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = frames as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz {}ch {}", self.sample_rate, self.channels, self.encoding)
    }
}

/// 设备侧的样本格式词汇
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceFormat {
    Unknown,
    S8,
    U8,
    S16,
    U16,
    S24_3LE,
    S24_3BE,
    U24_3LE,
    U24_3BE,
    S32,
    U32,
    Float,
}

const fn native_24(le: DeviceFormat, be: DeviceFormat) -> DeviceFormat {
    if cfg!(target_endian = "little") {
        le
    } else {
        be
    }
}

/// 编码 ↔ 设备格式对照表
const FORMAT_TABLE: [(SampleKind, DeviceFormat); 9] = [
    (SampleKind::S8, DeviceFormat::S8),
    (SampleKind::U8, DeviceFormat::U8),
    (SampleKind::U16, DeviceFormat::U16),
    (SampleKind::S16, DeviceFormat::S16),
    (SampleKind::U32, DeviceFormat::U32),
    (SampleKind::S32, DeviceFormat::S32),
    (
        SampleKind::U24,
        native_24(DeviceFormat::U24_3LE, DeviceFormat::U24_3BE),
    ),
    (
        SampleKind::S24,
        native_24(DeviceFormat::S24_3LE, DeviceFormat::S24_3BE),
    ),
    (SampleKind::Float, DeviceFormat::Float),
];

/// 编码 → 设备格式；平面编码先还原为交织基础类型
pub fn find_device_format(encoding: SampleEncoding) -> DeviceFormat {
    let kind = encoding.to_interleaved().kind;
    FORMAT_TABLE
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, f)| *f)
        .unwrap_or(DeviceFormat::Unknown)
}

/// 设备格式 → 样本类型
pub fn find_sample_kind(format: DeviceFormat) -> Option<SampleKind> {
    FORMAT_TABLE
        .iter()
        .find(|(_, f)| *f == format)
        .map(|(k, _)| *k)
}

/// 设备不支持请求格式时的默认格式
pub const FALLBACK_ENCODING: SampleEncoding = SampleEncoding::S16;

/// 协商样本格式
///
/// `format` 与设备格式同步更新：之后的组件只看到实际协商结果。
/// 设备在 set 阶段仍然拒绝则为致命错误，不再回退。
pub fn negotiate_format<D: PcmDevice + ?Sized>(
    device: &mut D,
    format: &mut StreamFormat,
) -> Result<DeviceFormat, InitError> {
    let mut device_format = find_device_format(format.encoding);
    if device_format == DeviceFormat::Unknown {
        log::info!(
            "Format {} is not known to the device, trying default",
            format.encoding
        );
        device_format = DeviceFormat::S16;
        format.encoding = FALLBACK_ENCODING;
    }

    if device.test_format(device_format).is_err() {
        log::info!(
            "Format {} is not supported by hardware, trying default",
            format.encoding
        );
        device_format = DeviceFormat::S16;
        format.encoding = FALLBACK_ENCODING;
    }

    device
        .set_format(device_format)
        .map_err(InitError::Format)?;

    Ok(device_format)
}

/// 协商访问方式
///
/// 平面编码先请求非交织访问，不可用时回退到交织，同时去掉平面标志
pub fn negotiate_access<D: PcmDevice + ?Sized>(
    device: &mut D,
    format: &mut StreamFormat,
) -> Result<Access, InitError> {
    if format.encoding.planar {
        if device.set_access(Access::NonInterleaved).is_ok() {
            return Ok(Access::NonInterleaved);
        }
        log::info!("Non-interleaved access not available");
        format.encoding = format.encoding.to_interleaved();
    }

    device
        .set_access(Access::Interleaved)
        .map_err(InitError::Access)?;

    Ok(Access::Interleaved)
}

/// 将 i32 样本（左对齐）打包为设备字节
///
/// 无符号格式翻转符号位；24-bit 为本机字节序 3 字节紧凑格式。
/// 返回写入的字节数
pub fn pack_samples(kind: SampleKind, samples: &[i32], output: &mut [u8]) -> usize {
    let bytes = kind.bytes();
    let count = samples.len().min(output.len() / bytes);

    for (i, &sample) in samples[..count].iter().enumerate() {
        let out = &mut output[i * bytes..(i + 1) * bytes];
        match kind {
            SampleKind::S8 => out[0] = (sample >> 24) as i8 as u8,
            SampleKind::U8 => out[0] = ((sample ^ i32::MIN) >> 24) as u8,
            SampleKind::S16 => out.copy_from_slice(&((sample >> 16) as i16).to_ne_bytes()),
            SampleKind::U16 => {
                out.copy_from_slice(&((((sample as u32) ^ 0x8000_0000) >> 16) as u16).to_ne_bytes())
            }
            SampleKind::S24 => pack_24(sample >> 8, out),
            SampleKind::U24 => pack_24((((sample as u32) ^ 0x8000_0000) >> 8) as i32, out),
            SampleKind::S32 => out.copy_from_slice(&sample.to_ne_bytes()),
            SampleKind::U32 => out.copy_from_slice(&((sample as u32) ^ 0x8000_0000).to_ne_bytes()),
            SampleKind::Float => {
                out.copy_from_slice(&(sample as f32 / 2_147_483_648.0).to_ne_bytes())
            }
            SampleKind::Double => {
                out.copy_from_slice(&(sample as f64 / 2_147_483_648.0).to_ne_bytes())
            }
        }
    }

    count * bytes
}

/// 24-bit 值（低 24 位有效）按本机字节序写入 3 字节
#[inline]
fn pack_24(v: i32, out: &mut [u8]) {
    let b = [(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8];
    if cfg!(target_endian = "little") {
        out.copy_from_slice(&b);
    } else {
        out.copy_from_slice(&[b[2], b[1], b[0]]);
    }
}

/// 用静音填充缓冲区
///
/// 有符号/浮点静音为 0，无符号静音为中点（0x80、0x8000 …）
pub fn fill_silence(kind: SampleKind, output: &mut [u8]) {
    let bytes = kind.bytes();
    let mut pattern = [0u8; 8];
    pack_samples(kind, &[0], &mut pattern[..bytes]);

    for chunk in output.chunks_exact_mut(bytes) {
        chunk.copy_from_slice(&pattern[..bytes]);
    }
}
