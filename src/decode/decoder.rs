//! 音频文件解码器
//!
//! 使用 symphonia 解码 FLAC / WAV / AIFF / MP3，输出交织的
//! 左对齐 i32 样本。整数源直接移位，不经过浮点中间表示

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use thiserror::Error;

use crate::audio::format::{SampleEncoding, SampleKind};

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// 源文件信息
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub channels: u32,
    /// 原始位深度
    pub bit_depth: Option<u32>,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 容器名称（取自扩展名）
    pub container: String,
    pub codec: String,
}

impl SourceInfo {
    /// 与源位深度最接近的设备编码；未知时使用 S16
    pub fn natural_encoding(&self) -> SampleEncoding {
        let kind = match self.bit_depth {
            Some(0..=8) => SampleKind::U8,
            Some(9..=16) => SampleKind::S16,
            Some(17..=24) => SampleKind::S24,
            Some(_) => SampleKind::S32,
            None => SampleKind::S16,
        };
        SampleEncoding::interleaved(kind)
    }
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: SourceInfo,
    /// 最近一个包的样本
    samples: Vec<i32>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = params.channels.map(|c| c.count() as u32).unwrap_or(2);
        let total_frames = params.n_frames;

        let codecs = symphonia::default::get_codecs();
        let codec = codecs
            .get_codec(params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let info = SourceInfo {
            sample_rate,
            channels,
            bit_depth: params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            container: path
                .extension()
                .and_then(|e| e.to_str())
                .map(|s| s.to_uppercase())
                .unwrap_or_else(|| "unknown".to_string()),
            codec,
        };

        let decoder = codecs
            .make(params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            samples: Vec::new(),
        })
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// 解码下一个包
    ///
    /// 返回交织的左对齐 i32 样本；空切片表示文件结束
    pub fn decode_next(&mut self) -> Result<&[i32], DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.samples.clear();
                    return Ok(&self.samples);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let out = &mut self.samples;
            match decoded {
                AudioBufferRef::U8(buf) => interleave(&*buf, out, |s| (s as i32 - 0x80) << 24),
                AudioBufferRef::S8(buf) => interleave(&*buf, out, |s| (s as i32) << 24),
                AudioBufferRef::U16(buf) => interleave(&*buf, out, |s| (s as i32 - 0x8000) << 16),
                AudioBufferRef::S16(buf) => interleave(&*buf, out, |s| (s as i32) << 16),
                AudioBufferRef::U24(buf) => {
                    interleave(&*buf, out, |s| (s.inner() as i32 - 0x80_0000) << 8)
                }
                AudioBufferRef::S24(buf) => interleave(&*buf, out, |s| s.inner() << 8),
                AudioBufferRef::U32(buf) => {
                    interleave(&*buf, out, |s| s.wrapping_sub(0x8000_0000) as i32)
                }
                AudioBufferRef::S32(buf) => interleave(&*buf, out, |s| s),
                AudioBufferRef::F32(buf) => {
                    interleave(&*buf, out, |s| (s.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32)
                }
                AudioBufferRef::F64(buf) => {
                    interleave(&*buf, out, |s| (s.clamp(-1.0, 1.0) * i32::MAX as f64) as i32)
                }
            }

            if self.samples.is_empty() {
                continue;
            }
            return Ok(&self.samples);
        }
    }
}

/// 平面缓冲区 → 交织 i32
fn interleave<S: Sample>(buf: &AudioBuffer<S>, out: &mut Vec<i32>, convert: impl Fn(S) -> i32) {
    let channels = buf.spec().channels.count();
    let frames = buf.frames();
    out.clear();
    out.reserve(frames * channels);
    for frame in 0..frames {
        for ch in 0..channels {
            out.push(convert(buf.chan(ch)[frame]));
        }
    }
}

/// 按帧读取的流式解码器
pub struct DecoderIterator {
    decoder: AudioDecoder,
    pending: Vec<i32>,
    position: usize,
    eof: bool,
}

impl DecoderIterator {
    pub fn new(decoder: AudioDecoder) -> Self {
        Self {
            decoder,
            pending: Vec::new(),
            position: 0,
            eof: false,
        }
    }

    pub fn info(&self) -> &SourceInfo {
        self.decoder.info()
    }

    /// 读取至多 `frames` 帧交织样本到 `out`（追加），返回读取的帧数；0 表示结束
    pub fn read_frames(&mut self, frames: usize, out: &mut Vec<i32>) -> Result<usize, DecodeError> {
        let channels = self.decoder.info().channels.max(1) as usize;
        let wanted = frames * channels;
        let start = out.len();

        while out.len() - start < wanted {
            if self.position == self.pending.len() {
                if self.eof {
                    break;
                }
                let samples = self.decoder.decode_next()?;
                if samples.is_empty() {
                    self.eof = true;
                    break;
                }
                self.pending.clear();
                self.pending.extend_from_slice(samples);
                self.position = 0;
            }

            let take = (wanted - (out.len() - start)).min(self.pending.len() - self.position);
            out.extend_from_slice(&self.pending[self.position..self.position + take]);
            self.position += take;
        }

        Ok((out.len() - start) / channels)
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.position == self.pending.len()
    }
}
