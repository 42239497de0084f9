//! 声道重排与打包
//!
//! 数据源布局与设备协商出的布局不同时，按扬声器位置重排：
//! 同名扬声器直接对应，其余按序号对应，仍缺失的声道输出静音

use crate::audio::chmap::ChannelLayout;
use crate::audio::format::{pack_samples, StreamFormat};

/// 源声道 → 设备声道映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRemap {
    source_channels: usize,
    /// 每个输出声道取用的源声道
    map: Vec<Option<usize>>,
}

impl ChannelRemap {
    pub fn new(source: &ChannelLayout, target: &ChannelLayout) -> Self {
        let src = source.speakers();
        let map = target
            .speakers()
            .iter()
            .enumerate()
            .map(|(i, speaker)| {
                if src.len() == 1 {
                    return Some(0);
                }
                src.iter()
                    .position(|s| s == speaker)
                    .or_else(|| (i < src.len() && !target.contains(src[i])).then_some(i))
            })
            .collect();

        Self {
            source_channels: src.len(),
            map,
        }
    }

    /// 是否为恒等映射
    pub fn is_identity(&self) -> bool {
        self.map.len() == self.source_channels
            && self.map.iter().enumerate().all(|(i, m)| *m == Some(i))
    }

    pub fn output_channels(&self) -> usize {
        self.map.len()
    }

    /// 重排交织样本，结果追加到 `out`
    pub fn apply(&self, input: &[i32], out: &mut Vec<i32>) {
        if self.is_identity() {
            out.extend_from_slice(input);
            return;
        }
        for frame in input.chunks_exact(self.source_channels.max(1)) {
            out.extend(self.map.iter().map(|m| m.map_or(0, |ch| frame[ch])));
        }
    }
}

/// 把交织 i32 样本按会话格式打包，追加到各平面缓冲区
///
/// 交织格式只有一个平面；平面格式每声道一个
pub fn pack_into_planes(format: &StreamFormat, samples: &[i32], planes: &mut [Vec<u8>]) {
    let kind = format.encoding.kind;
    let bytes = kind.bytes();

    if !format.encoding.planar {
        let plane = &mut planes[0];
        let start = plane.len();
        plane.resize(start + samples.len() * bytes, 0);
        pack_samples(kind, samples, &mut plane[start..]);
        return;
    }

    let channels = format.channels as usize;
    let frames = samples.len() / channels.max(1);
    let mut column = Vec::with_capacity(frames);
    for (ch, plane) in planes.iter_mut().enumerate().take(channels) {
        column.clear();
        column.extend(samples.iter().skip(ch).step_by(channels).take(frames));
        let start = plane.len();
        plane.resize(start + frames * bytes, 0);
        pack_samples(kind, &column, &mut plane[start..]);
    }
}
