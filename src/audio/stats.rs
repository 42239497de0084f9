//! 播放统计模块
//!
//! 写入路径和延迟查询路径都会更新计数，所有操作都是 lock-free 的

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 播放统计收集器
#[derive(Debug, Default)]
pub struct PlaybackStats {
    /// 设备接受的帧数（含静音）
    frames_written: AtomicU64,
    /// 恢复播放时合成的静音帧数
    silence_frames: AtomicU64,
    /// 尝试过的恢复次数
    recoveries: AtomicU64,
    /// 恢复后仍失败的写入次数
    write_errors: AtomicU64,
    /// 负延迟修正次数
    underruns: AtomicU64,
    /// 负延迟修正时前移的帧数
    forwarded_frames: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_frames_written(&self, frames: u64) {
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_silence_frames(&self, frames: u64) {
        self.silence_frames.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次负延迟修正
    #[inline]
    pub fn record_underrun(&self, forwarded: u64) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.forwarded_frames.fetch_add(forwarded, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        StatsReport {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            forwarded_frames: self.forwarded_frames.load(Ordering::Relaxed),
        }
    }
}

/// 统计报告快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub frames_written: u64,
    pub silence_frames: u64,
    pub recoveries: u64,
    pub write_errors: u64,
    pub underruns: u64,
    pub forwarded_frames: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "written={} silence={} recoveries={} write_errors={} underruns={} (forwarded {} frames)",
            self.frames_written,
            self.silence_frames,
            self.recoveries,
            self.write_errors,
            self.underruns,
            self.forwarded_frames
        )
    }
}
