//! 设备抽象层
//!
//! 会话只通过 `PcmDevice` / `Backend` 两个 trait 访问设备，
//! 任何后端（内核声卡、用户态音频服务、寄存器接口）实现这组原语即可：
//! - 参数协商：resample / access / format / channels / rate / commit
//! - 声道映射：查询与设置
//! - 流控制：write / recover / pause / drop / prepare / drain / close
//! - 状态查询：state / delay / avail / forward
//! - 就绪等待：poll 描述符

use thiserror::Error;

use super::chmap::ChannelPosition;
use super::format::DeviceFormat;

/// 设备原语错误
///
/// 前四种是瞬态错误，Stream Writer 会尝试一次恢复
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("interrupted system call")]
    Interrupted,
    #[error("buffer underrun")]
    Underrun,
    #[error("stream suspended")]
    Suspended,
    #[error("resource temporarily unavailable")]
    WouldBlock,
    #[error("requested configuration not supported")]
    Unsupported,
    #[error("operation not allowed in current device state")]
    BadState,
    #[error("device disconnected")]
    Disconnected,
    #[error("no such device: {0}")]
    NotFound(String),
    #[error("os error {0}")]
    Os(i32),
    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    /// 由 errno 构造（负值按绝对值处理）
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            libc::EINTR => Self::Interrupted,
            libc::EPIPE => Self::Underrun,
            libc::EAGAIN => Self::WouldBlock,
            libc::ENXIO => Self::Unsupported,
            libc::EBADF => Self::BadState,
            libc::ENODEV => Self::Disconnected,
            other => Self::Os(other),
        }
    }

    /// 是否为瞬态错误（可恢复一次后重试）
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::Underrun | Self::Suspended | Self::WouldBlock
        )
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Self::Other(e.to_string()),
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// 设备报告的流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// 已打开，硬件参数尚未提交
    Open,
    /// 参数已提交，但未 prepare（drop 之后也回到这里）
    Setup,
    /// 可以开始写入
    Prepared,
    Running,
    /// 发生 underrun
    XRun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// 数据访问方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// 交织：所有声道在一个缓冲区
    Interleaved,
    /// 非交织：每声道一个缓冲区
    NonInterleaved,
}

/// 提交后的硬件配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    /// 缓冲区帧数
    pub buffer_size: u64,
    /// 周期帧数
    pub period_size: u64,
    /// 是否支持硬件暂停
    pub can_pause: bool,
}

/// 设备列表条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub name: String,
    pub description: String,
}

/// 后端枚举到的原始设备提示
#[derive(Debug, Clone, Default)]
pub struct DeviceHint {
    pub name: String,
    pub description: Option<String>,
    /// "Output" / "Input"，None 表示双向
    pub io: Option<String>,
}

/// 过滤出可输出设备，描述中的换行替换为 '/'
pub fn output_devices(hints: impl IntoIterator<Item = DeviceHint>) -> Vec<DeviceDesc> {
    hints
        .into_iter()
        .filter(|hint| hint.io.as_deref().map_or(true, |io| io == "Output"))
        .map(|hint| DeviceDesc {
            description: hint.description.unwrap_or_default().replace('\n', "/"),
            name: hint.name,
        })
        .collect()
}

/// 一个已打开的播放流
pub trait PcmDevice: Send {
    fn set_rate_resample(&mut self, enable: bool) -> DeviceResult<()>;
    fn set_access(&mut self, access: Access) -> DeviceResult<()>;
    /// 仅测试格式是否可用，不修改参数
    fn test_format(&self, format: DeviceFormat) -> DeviceResult<()>;
    fn set_format(&mut self, format: DeviceFormat) -> DeviceResult<()>;
    fn set_channels(&mut self, channels: u32) -> DeviceResult<()>;
    /// 设置最接近的采样率，返回实际值
    fn set_rate_near(&mut self, rate: u32) -> DeviceResult<u32>;
    /// 提交硬件参数
    fn commit(&mut self) -> DeviceResult<HwConfig>;

    /// 设备支持的声道映射；None 表示无法查询
    fn query_channel_maps(&self) -> Option<Vec<Vec<ChannelPosition>>>;
    /// 应用声道映射；`Unsupported` 表示此会话不可能使用该映射
    fn set_channel_map(&mut self, positions: &[ChannelPosition]) -> DeviceResult<()>;

    fn state(&self) -> DeviceState;
    /// 写入交织数据，返回实际接受的帧数
    fn write_interleaved(&mut self, data: &[u8], frames: u64) -> DeviceResult<u64>;
    /// 写入非交织数据（每声道一个平面）
    fn write_planar(&mut self, planes: &[&[u8]], frames: u64) -> DeviceResult<u64>;
    /// 设备特定的软复位
    fn recover(&mut self, err: &DeviceError) -> DeviceResult<()>;

    /// 已缓冲未播放帧数；负值表示 underrun
    fn delay(&mut self) -> DeviceResult<i64>;
    /// 向前移动应用指针
    fn forward(&mut self, frames: u64) -> DeviceResult<u64>;
    /// 可写帧数
    fn avail(&mut self) -> DeviceResult<i64>;
    /// 阻塞直到设备可接受数据
    fn wait_ready(&mut self) -> DeviceResult<()>;

    fn pause(&mut self, enable: bool) -> DeviceResult<()>;
    /// 丢弃所有待播放帧
    fn drop_pending(&mut self) -> DeviceResult<()>;
    fn prepare(&mut self) -> DeviceResult<()>;
    /// 阻塞直到已缓冲帧播放完毕
    fn drain(&mut self) -> DeviceResult<()>;
    fn close(&mut self) -> DeviceResult<()>;

    fn poll_descriptors(&self) -> DeviceResult<Vec<libc::pollfd>>;
    /// 将 poll 结果翻译为 POLLOUT / POLLERR
    fn poll_revents(&mut self, fds: &[libc::pollfd]) -> DeviceResult<i16>;
}

/// 设备后端：按名称打开设备，枚举设备
pub trait Backend {
    type Device: PcmDevice;

    fn open(&self, name: &str) -> DeviceResult<Self::Device>;

    fn list_devices(&self) -> DeviceResult<Vec<DeviceDesc>>;
}
