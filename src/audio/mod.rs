//! 音频输出核心
//!
//! 包含：
//! - Device: 设备原语抽象（`PcmDevice` / `Backend`）
//! - Format: 样本格式协商与打包
//! - Chmap: 声道映射
//! - Session: 会话状态机（打开、暂停、恢复、排空、关闭）
//! - Writer / Clock / Wait: 写入、延迟查询、等待可写空间
//! - Null: 实时时钟空设备
//! - Stats: 播放统计

pub mod chmap;
pub mod clock;
pub mod device;
pub mod format;
pub mod null;
pub mod session;
pub mod stats;
pub mod wait;
pub mod writer;

#[cfg(test)]
pub(crate) mod mock;

pub use chmap::{ChannelLayout, ChannelPosition, ClosestLayout, LayoutSelector, Speaker};
pub use device::{Access, Backend, DeviceDesc, DeviceError, DeviceState, PcmDevice};
pub use format::{DeviceFormat, SampleEncoding, SampleKind, StreamFormat};
pub use null::{NullBackend, NullConfig, NullDevice};
pub use session::{
    DeviceSession, InitError, SessionError, SessionOptions, SessionState, StreamRequest,
};
pub use stats::{PlaybackStats, StatsReport};
pub use wait::{wait_for_space, WaitError, WaitStatus, WakeSignal};
pub use writer::WriteOutcome;
