//! 声道映射
//!
//! 应用侧使用逻辑扬声器 `Speaker`，设备侧使用 `ChannelPosition`，
//! 两者通过固定对照表双向转换，未命中时映射到各自的 Unknown。

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use super::device::{DeviceError, PcmDevice};
use super::session::InitError;

/// 逻辑扬声器
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Speaker {
    FL,
    FR,
    FC,
    LFE,
    BL,
    BR,
    FLC,
    FRC,
    BC,
    SL,
    SR,
    TC,
    TFL,
    TFC,
    TFR,
    TBL,
    TBC,
    TBR,
    DL,
    DR,
    WL,
    WR,
    SDL,
    SDR,
    LFE2,
    Unknown,
}

const SPEAKER_NAMES: [(Speaker, &str); 25] = [
    (Speaker::FL, "fl"),
    (Speaker::FR, "fr"),
    (Speaker::FC, "fc"),
    (Speaker::LFE, "lfe"),
    (Speaker::BL, "bl"),
    (Speaker::BR, "br"),
    (Speaker::FLC, "flc"),
    (Speaker::FRC, "frc"),
    (Speaker::BC, "bc"),
    (Speaker::SL, "sl"),
    (Speaker::SR, "sr"),
    (Speaker::TC, "tc"),
    (Speaker::TFL, "tfl"),
    (Speaker::TFC, "tfc"),
    (Speaker::TFR, "tfr"),
    (Speaker::TBL, "tbl"),
    (Speaker::TBC, "tbc"),
    (Speaker::TBR, "tbr"),
    (Speaker::DL, "dl"),
    (Speaker::DR, "dr"),
    (Speaker::WL, "wl"),
    (Speaker::WR, "wr"),
    (Speaker::SDL, "sdl"),
    (Speaker::SDR, "sdr"),
    (Speaker::LFE2, "lfe2"),
];

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = SPEAKER_NAMES
            .iter()
            .find(|(s, _)| s == self)
            .map(|(_, n)| *n)
            .unwrap_or("na");
        f.write_str(name)
    }
}

/// 设备侧声道位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    Unknown,
    NA,
    Mono,
    FL,
    FR,
    RL,
    RR,
    FC,
    LFE,
    SL,
    SR,
    RC,
    FLC,
    FRC,
    RLC,
    RRC,
    FLW,
    FRW,
    FLH,
    FCH,
    FRH,
    TC,
    TFL,
    TFR,
    TFC,
    TRL,
    TRR,
    TRC,
}

/// 设备位置 ↔ 逻辑扬声器对照表
///
/// 逻辑 → 设备方向取第一个命中项，所以 FC 映射为 FC 而不是 Mono
const POSITION_TABLE: [(ChannelPosition, Speaker); 21] = [
    (ChannelPosition::FL, Speaker::FL),
    (ChannelPosition::FR, Speaker::FR),
    (ChannelPosition::RL, Speaker::BL),
    (ChannelPosition::RR, Speaker::BR),
    (ChannelPosition::FC, Speaker::FC),
    (ChannelPosition::LFE, Speaker::LFE),
    (ChannelPosition::SL, Speaker::SL),
    (ChannelPosition::SR, Speaker::SR),
    (ChannelPosition::RC, Speaker::BC),
    (ChannelPosition::FLC, Speaker::FLC),
    (ChannelPosition::FRC, Speaker::FRC),
    (ChannelPosition::FLW, Speaker::WL),
    (ChannelPosition::FRW, Speaker::WR),
    (ChannelPosition::TC, Speaker::TC),
    (ChannelPosition::TFL, Speaker::TFL),
    (ChannelPosition::TFR, Speaker::TFR),
    (ChannelPosition::TFC, Speaker::TFC),
    (ChannelPosition::TRL, Speaker::TBL),
    (ChannelPosition::TRR, Speaker::TBR),
    (ChannelPosition::TRC, Speaker::TBC),
    (ChannelPosition::Mono, Speaker::FC),
];

/// 设备位置 → 逻辑扬声器
pub fn speaker_for_position(position: ChannelPosition) -> Speaker {
    POSITION_TABLE
        .iter()
        .find(|(p, _)| *p == position)
        .map(|(_, s)| *s)
        .unwrap_or(Speaker::Unknown)
}

/// 逻辑扬声器 → 设备位置
pub fn position_for_speaker(speaker: Speaker) -> ChannelPosition {
    POSITION_TABLE
        .iter()
        .find(|(_, s)| *s == speaker)
        .map(|(p, _)| *p)
        .unwrap_or(ChannelPosition::Unknown)
}

/// 声道布局：有序扬声器序列
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ChannelLayout {
    speakers: Vec<Speaker>,
}

impl ChannelLayout {
    pub fn new(speakers: Vec<Speaker>) -> Self {
        Self { speakers }
    }

    pub fn mono() -> Self {
        Self::new(vec![Speaker::FC])
    }

    pub fn stereo() -> Self {
        Self::new(vec![Speaker::FL, Speaker::FR])
    }

    pub fn surround51() -> Self {
        use Speaker::*;
        Self::new(vec![FL, FR, FC, LFE, BL, BR])
    }

    pub fn surround71() -> Self {
        use Speaker::*;
        Self::new(vec![FL, FR, FC, LFE, BL, BR, SL, SR])
    }

    /// 按声道数给出默认布局
    pub fn default_for(channels: u32) -> Self {
        use Speaker::*;
        match channels {
            1 => Self::mono(),
            2 => Self::stereo(),
            3 => Self::new(vec![FL, FR, LFE]),
            4 => Self::new(vec![FL, FR, BL, BR]),
            5 => Self::new(vec![FL, FR, FC, BL, BR]),
            6 => Self::surround51(),
            7 => Self::new(vec![FL, FR, FC, LFE, BC, SL, SR]),
            8 => Self::surround71(),
            n => Self::new(vec![Unknown; n as usize]),
        }
    }

    /// 由设备位置构造
    pub fn from_positions(positions: &[ChannelPosition]) -> Self {
        Self::new(positions.iter().map(|p| speaker_for_position(*p)).collect())
    }

    /// 转为设备位置数组
    pub fn to_positions(&self) -> Vec<ChannelPosition> {
        self.speakers.iter().map(|s| position_for_speaker(*s)).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    pub fn speakers(&self) -> &[Speaker] {
        &self.speakers
    }

    pub fn contains(&self, speaker: Speaker) -> bool {
        self.speakers.contains(&speaker)
    }

    /// 同一扬声器出现多次（Unknown 除外）
    pub fn has_duplicates(&self) -> bool {
        self.speakers.iter().enumerate().any(|(i, s)| {
            *s != Speaker::Unknown && self.speakers[i + 1..].contains(s)
        })
    }

    /// 与另一布局共有的扬声器数
    fn overlap(&self, other: &ChannelLayout) -> usize {
        self.speakers.iter().filter(|s| other.contains(**s)).count()
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, speaker) in self.speakers.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{}", speaker)?;
        }
        Ok(())
    }
}

impl FromStr for ChannelLayout {
    type Err = String;

    /// 接受 "mono" / "stereo" / "5.1" / "7.1" / 声道数 / "fl-fr-fc"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "mono" => return Ok(Self::mono()),
            "stereo" => return Ok(Self::stereo()),
            "5.1" => return Ok(Self::surround51()),
            "7.1" => return Ok(Self::surround71()),
            _ => {}
        }
        if let Ok(n) = s.parse::<u32>() {
            if n == 0 {
                return Err("channel count must be positive".into());
            }
            return Ok(Self::default_for(n));
        }

        let speakers = s
            .split('-')
            .map(|name| {
                SPEAKER_NAMES
                    .iter()
                    .find(|(_, n)| *n == name)
                    .map(|(sp, _)| *sp)
                    .ok_or_else(|| format!("unknown speaker '{}'", name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let layout = Self::new(speakers);
        if layout.has_duplicates() {
            return Err(format!("duplicate speaker in '{}'", s));
        }
        Ok(layout)
    }
}

/// 布局选择策略（由调用方提供）
pub trait LayoutSelector: Send + Sync {
    /// 从设备支持的布局中选出最合适的一个；`available` 非空时必须返回其中之一
    fn select(&self, requested: &ChannelLayout, available: &[ChannelLayout])
        -> Option<ChannelLayout>;
}

/// 默认策略：最接近匹配
///
/// 1. 完全相同
/// 2. 扬声器集合相同，顺序不同
/// 3. 包含所有请求扬声器的最小超集
/// 4. 共有扬声器最多者，声道数最接近者优先
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosestLayout;

impl LayoutSelector for ClosestLayout {
    fn select(
        &self,
        requested: &ChannelLayout,
        available: &[ChannelLayout],
    ) -> Option<ChannelLayout> {
        if let Some(exact) = available.iter().find(|l| *l == requested) {
            return Some(exact.clone());
        }

        let covers = |l: &ChannelLayout| requested.speakers().iter().all(|s| l.contains(*s));

        if let Some(reordered) = available
            .iter()
            .find(|l| l.len() == requested.len() && covers(l))
        {
            return Some(reordered.clone());
        }

        if let Some(superset) = available.iter().filter(|l| covers(l)).min_by_key(|l| l.len()) {
            return Some(superset.clone());
        }

        available
            .iter()
            .min_by_key(|l| (Reverse(l.overlap(requested)), l.len().abs_diff(requested.len())))
            .cloned()
    }
}

/// 声道映射协商结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayout {
    pub layout: ChannelLayout,
    /// false 表示设备没有给出可用映射，之后不再设置声道映射
    pub valid: bool,
}

/// 查询设备映射并选择布局
///
/// 设备映射为空或无法查询时保留请求的布局，并标记为无效映射
pub fn resolve_channel_map<D: PcmDevice + ?Sized>(
    device: &D,
    requested: &ChannelLayout,
    selector: &dyn LayoutSelector,
) -> ResolvedLayout {
    let available: Vec<ChannelLayout> = device
        .query_channel_maps()
        .unwrap_or_default()
        .iter()
        .map(|positions| ChannelLayout::from_positions(positions))
        .filter(|layout| {
            if layout.is_empty() || layout.has_duplicates() {
                log::debug!("Rejecting device channel map: {}", layout);
                return false;
            }
            log::debug!("Got supported channel map: {}", layout);
            true
        })
        .collect();

    let selected = if available.is_empty() {
        None
    } else {
        selector.select(requested, &available)
    };

    match selected {
        Some(layout) if available.contains(&layout) => ResolvedLayout { layout, valid: true },
        Some(layout) => {
            log::warn!("Selected channel map {} is not offered by the device", layout);
            ResolvedLayout {
                layout: requested.clone(),
                valid: false,
            }
        }
        None => ResolvedLayout {
            layout: requested.clone(),
            valid: false,
        },
    }
}

/// 将已选布局写入设备（硬件参数提交之后调用）
pub fn apply_channel_map<D: PcmDevice + ?Sized>(
    device: &mut D,
    layout: &ChannelLayout,
) -> Result<(), InitError> {
    let positions = layout.to_positions();
    log::debug!("Attempting to set channel map: {}", layout);

    match device.set_channel_map(&positions) {
        Ok(()) => Ok(()),
        Err(DeviceError::Unsupported) => {
            log::error!("Device does not support requested channel map");
            Err(InitError::UnsupportedChannelMap(layout.clone()))
        }
        Err(e) => Err(InitError::ChannelMap(e)),
    }
}
