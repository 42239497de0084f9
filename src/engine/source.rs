//! 播放数据源
//!
//! 数据源按帧产出交织的左对齐 i32 样本

use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::EngineError;
use crate::audio::format::SampleEncoding;
use crate::decode::DecoderIterator;

/// 帧数据源
pub trait FrameSource: Send {
    fn channels(&self) -> u32;

    fn sample_rate(&self) -> u32;

    /// 未指定输出编码时请求的设备编码
    fn natural_encoding(&self) -> SampleEncoding {
        SampleEncoding::S16
    }

    /// 追加至多 `frames` 帧到 `out`，返回读取帧数；0 表示结束
    fn read(&mut self, frames: usize, out: &mut Vec<i32>) -> Result<usize, EngineError>;
}

impl FrameSource for DecoderIterator {
    fn channels(&self) -> u32 {
        self.info().channels
    }

    fn sample_rate(&self) -> u32 {
        self.info().sample_rate
    }

    fn natural_encoding(&self) -> SampleEncoding {
        self.info().natural_encoding()
    }

    fn read(&mut self, frames: usize, out: &mut Vec<i32>) -> Result<usize, EngineError> {
        Ok(self.read_frames(frames, out)?)
    }
}

enum Waveform {
    Sine { freq: f64, phase: f64 },
    Noise(StdRng),
}

/// 测试信号：正弦波或白噪声，所有声道相同
pub struct ToneSource {
    waveform: Waveform,
    channels: u32,
    sample_rate: u32,
    amplitude: f64,
    /// 剩余帧数；None 表示无限
    remaining: Option<u64>,
}

impl ToneSource {
    pub fn sine(freq: f64, sample_rate: u32, channels: u32, seconds: Option<f64>) -> Self {
        Self {
            waveform: Waveform::Sine { freq, phase: 0.0 },
            channels,
            sample_rate,
            amplitude: 0.5,
            remaining: seconds.map(|s| (s * sample_rate as f64).round() as u64),
        }
    }

    /// 白噪声；`seed` 为 None 时使用系统熵
    pub fn noise(sample_rate: u32, channels: u32, seconds: Option<f64>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            waveform: Waveform::Noise(rng),
            channels,
            sample_rate,
            amplitude: 0.25,
            remaining: seconds.map(|s| (s * sample_rate as f64).round() as u64),
        }
    }

    fn next_value(&mut self) -> f64 {
        match &mut self.waveform {
            Waveform::Sine { freq, phase } => {
                let value = phase.sin();
                *phase = (*phase + TAU * *freq / self.sample_rate as f64) % TAU;
                value
            }
            Waveform::Noise(rng) => rng.gen_range(-1.0..=1.0),
        }
    }
}

impl FrameSource for ToneSource {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, frames: usize, out: &mut Vec<i32>) -> Result<usize, EngineError> {
        let frames = match self.remaining {
            Some(remaining) => frames.min(remaining as usize),
            None => frames,
        };

        out.reserve(frames * self.channels as usize);
        for _ in 0..frames {
            let sample = (self.next_value() * self.amplitude * i32::MAX as f64) as i32;
            for _ in 0..self.channels {
                out.push(sample);
            }
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= frames as u64;
        }
        Ok(frames)
    }
}
