//! 设备会话
//!
//! 显式状态机：
//!
//! ```text
//! Closed → Opening → Configured → Running ⇄ Paused
//!                        │           │         │
//!                        └────→ Draining ←─────┘ → Closed
//! 任意迁移遇到不可恢复错误 → Failed
//! ```
//!
//! 每条边对应一个方法，返回 `Result<(), SessionError>`：
//! `SessionError::is_fatal()` 区分控制错误（无副作用）和致命错误。
//! 写入路径见 `writer.rs`，延迟查询见 `clock.rs`，等待见 `wait.rs`。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::chmap::{apply_channel_map, resolve_channel_map, ChannelLayout, ClosestLayout, LayoutSelector};
use super::device::{Access, Backend, DeviceError, DeviceResult, DeviceState, PcmDevice};
use super::format::{fill_silence, negotiate_access, negotiate_format, DeviceFormat, StreamFormat};
use super::stats::PlaybackStats;
use super::wait::WakeSignal;
use super::writer::WriteOutcome;

/// 初始化错误（总是致命，已释放部分打开的资源）
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to open audio device '{device}': {source}")]
    Open {
        device: String,
        #[source]
        source: DeviceError,
    },
    #[error("invalid stream request: {0}")]
    InvalidRequest(String),
    #[error("cannot create wakeup pipe: {0}")]
    Wakeup(#[source] std::io::Error),
    #[error("resampling setup failed: {0}")]
    Resample(#[source] DeviceError),
    #[error("access type setup failed: {0}")]
    Access(#[source] DeviceError),
    #[error("format setup failed: {0}")]
    Format(#[source] DeviceError),
    #[error("channel count setup failed: {0}")]
    Channels(#[source] DeviceError),
    #[error("sample rate setup failed: {0}")]
    Rate(#[source] DeviceError),
    #[error("unable to set hardware parameters: {0}")]
    Commit(#[source] DeviceError),
    #[error("channel map setup failed: {0}")]
    ChannelMap(#[source] DeviceError),
    #[error("device does not support requested channel map {0}")]
    UnsupportedChannelMap(ChannelLayout),
}

impl InitError {
    /// 失败阶段名称（用于诊断）
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Open { .. } | Self::Wakeup(_) => "open",
            Self::InvalidRequest(_) | Self::Resample(_) | Self::Access(_) | Self::Format(_) => {
                "format"
            }
            Self::ChannelMap(_) | Self::UnsupportedChannelMap(_) => "channel map",
            Self::Channels(_) | Self::Rate(_) | Self::Commit(_) => "parameter commit",
        }
    }
}

/// 运行期控制错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 设备状态不允许此操作；会话未被修改
    #[error("device in bad state while trying to {op}: {state:?}")]
    BadState {
        op: &'static str,
        state: DeviceState,
    },
    /// 会话状态不允许此操作；会话未被修改
    #[error("cannot {op} while session is {state:?}")]
    Inactive {
        op: &'static str,
        state: SessionState,
    },
    /// 设备原语失败；会话已进入 Failed
    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: DeviceError,
    },
}

impl SessionError {
    /// 致命错误需要重建会话；控制错误只是一次无效操作
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device { .. })
    }
}

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Configured,
    Running,
    Paused,
    Draining,
    Failed,
}

impl SessionState {
    /// 设备句柄是否仍可用于播放控制
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Configured | Self::Running | Self::Paused)
    }
}

/// 暂停上下文，生命周期为一次 pause/resume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseContext {
    /// 硬件暂停时冻结的延迟
    pub delay_before_pause: Duration,
    /// 无硬件暂停时被丢弃的缓冲帧数，恢复时以静音补回
    pub prepause_frames: u64,
}

/// 设备能力（提交参数后确定）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub layouts: Vec<ChannelLayout>,
    pub can_pause: bool,
    pub buffer_size: u64,
    pub period_size: u64,
}

/// 请求的流参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub format: StreamFormat,
    pub layout: ChannelLayout,
}

impl StreamRequest {
    /// 使用声道数对应的默认布局
    pub fn new(format: StreamFormat) -> Self {
        Self {
            layout: ChannelLayout::default_for(format.channels),
            format,
        }
    }

    pub fn with_layout(format: StreamFormat, layout: ChannelLayout) -> Self {
        Self { format, layout }
    }
}

/// 会话配置
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// 设备名，空串表示 "default"
    pub device: String,
    /// 允许设备内部重采样
    pub resample: bool,
    /// 打开时登记的唤醒句柄；None 时会话自行创建
    pub wake: Option<WakeSignal>,
}

/// 协商结果
struct Negotiated {
    device_format: DeviceFormat,
    access: Access,
    valid_map: bool,
    caps: DeviceCapabilities,
}

/// 设备会话：独占一个已打开的设备句柄
pub struct DeviceSession<D: PcmDevice> {
    pub(crate) device: Option<D>,
    pub(crate) name: String,
    pub(crate) state: SessionState,
    pub(crate) format: StreamFormat,
    pub(crate) device_format: DeviceFormat,
    pub(crate) access: Access,
    pub(crate) layout: ChannelLayout,
    pub(crate) channel_map_valid: bool,
    pub(crate) caps: DeviceCapabilities,
    pub(crate) pause: PauseContext,
    pub(crate) stats: Arc<PlaybackStats>,
    pub(crate) wake: WakeSignal,
}

impl<D: PcmDevice> DeviceSession<D> {
    /// 打开并配置设备（默认布局选择策略）
    pub fn open<B>(backend: &B, request: StreamRequest, options: SessionOptions) -> Result<Self, InitError>
    where
        B: Backend<Device = D>,
    {
        Self::open_with_selector(backend, request, options, &ClosestLayout)
    }

    /// 打开并配置设备
    ///
    /// Closed → Opening → Configured；任一阶段失败则 → Failed，
    /// 已打开的句柄被释放，错误中带有失败阶段
    pub fn open_with_selector<B>(
        backend: &B,
        request: StreamRequest,
        options: SessionOptions,
        selector: &dyn LayoutSelector,
    ) -> Result<Self, InitError>
    where
        B: Backend<Device = D>,
    {
        let StreamRequest { mut format, mut layout } = request;

        if !format.is_valid() {
            return Err(InitError::InvalidRequest(format!(
                "sample rate and channel count must be positive ({})",
                format
            )));
        }
        if layout.len() != format.channels as usize {
            return Err(InitError::InvalidRequest(format!(
                "layout {} has {} channels, format has {}",
                layout,
                layout.len(),
                format.channels
            )));
        }
        if layout.has_duplicates() {
            return Err(InitError::InvalidRequest(format!(
                "duplicate speaker in layout {}",
                layout
            )));
        }

        let name = if options.device.is_empty() {
            "default".to_string()
        } else {
            options.device.clone()
        };

        let wake = match options.wake {
            Some(wake) => wake,
            None => WakeSignal::new().map_err(InitError::Wakeup)?,
        };

        log::debug!("Session {}: {:?} -> {:?}", name, SessionState::Closed, SessionState::Opening);

        let mut device = backend.open(&name).map_err(|source| InitError::Open {
            device: name.clone(),
            source,
        })?;

        match configure(&mut device, &mut format, &mut layout, options.resample, selector) {
            Ok(negotiated) => {
                log::info!(
                    "Opened {}: {} [{}] buffer={} period={} can_pause={}",
                    name,
                    format,
                    layout,
                    negotiated.caps.buffer_size,
                    negotiated.caps.period_size,
                    negotiated.caps.can_pause
                );

                let session = Self {
                    device: Some(device),
                    name,
                    state: SessionState::Configured,
                    format,
                    device_format: negotiated.device_format,
                    access: negotiated.access,
                    layout,
                    channel_map_valid: negotiated.valid_map,
                    caps: negotiated.caps,
                    pause: PauseContext::default(),
                    stats: Arc::new(PlaybackStats::new()),
                    wake,
                };
                log::debug!(
                    "Session {}: {:?} -> {:?}",
                    session.name,
                    SessionState::Opening,
                    session.state
                );
                Ok(session)
            }
            Err(e) => {
                log::error!("Session {}: initialization failed at {} stage: {}", name, e.stage(), e);
                log::debug!("Session {}: {:?} -> {:?}", name, SessionState::Opening, SessionState::Failed);
                release(&mut device);
                Err(e)
            }
        }
    }

    /// 当前生命周期状态
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 实际协商的流格式
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn device_format(&self) -> DeviceFormat {
        self.device_format
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// 设备是否接受了声道映射
    pub fn channel_map_valid(&self) -> bool {
        self.channel_map_valid
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    pub fn pause_context(&self) -> PauseContext {
        self.pause
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        Arc::clone(&self.stats)
    }

    /// 打开时登记的唤醒句柄
    pub fn waker(&self) -> WakeSignal {
        self.wake.clone()
    }

    pub fn device_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("Session {}: {:?} -> {:?}", self.name, self.state, next);
            self.state = next;
        }
    }

    /// 调用设备原语；失败时会话进入 Failed
    pub(crate) fn device_call<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut D) -> DeviceResult<T>,
    ) -> Result<T, SessionError> {
        let state = self.state;
        let device = self
            .device
            .as_mut()
            .ok_or(SessionError::Inactive { op, state })?;

        match f(device) {
            Ok(value) => Ok(value),
            Err(source) => {
                log::error!("{} failed: {}", op, source);
                self.set_state(SessionState::Failed);
                Err(SessionError::Device { op, source })
            }
        }
    }

    fn device_state(&self) -> DeviceState {
        self.device
            .as_ref()
            .map(|d| d.state())
            .unwrap_or(DeviceState::Disconnected)
    }

    /// Configured/Running → Paused
    ///
    /// 已暂停时为 no-op
    pub fn pause(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Paused => return Ok(()),
            SessionState::Configured | SessionState::Running => {}
            state => return Err(SessionError::Inactive { op: "pause", state }),
        }

        let device_state = self.device_state();
        if !matches!(device_state, DeviceState::Prepared | DeviceState::Running) {
            log::error!("Device in bad state while pausing: {:?}", device_state);
            return Err(SessionError::BadState {
                op: "pause",
                state: device_state,
            });
        }

        if self.caps.can_pause {
            if device_state == DeviceState::Running {
                self.device_call("device wait", |d| d.wait_ready())?;
                self.pause.delay_before_pause = self.current_latency();
                self.device_call("pause", |d| d.pause(true))?;
            } else {
                self.pause.delay_before_pause = Duration::ZERO;
            }
        } else {
            log::debug!("Pause not supported by hardware");

            let prepause = match self.device.as_mut().map(|d| d.delay()) {
                Some(Ok(frames)) if frames > 0 => frames as u64,
                _ => 0,
            };
            self.pause.prepause_frames = prepause;

            self.device_call("drop audio data", |d| d.drop_pending())?;
        }

        self.set_state(SessionState::Paused);
        Ok(())
    }

    /// Paused → Running
    ///
    /// 未暂停时为 no-op
    pub fn resume(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Paused => {}
            SessionState::Configured | SessionState::Running => return Ok(()),
            state => return Err(SessionError::Inactive { op: "resume", state }),
        }

        if self.caps.can_pause {
            let device_state = self.device_state();
            match device_state {
                DeviceState::Prepared => {
                    self.pause = PauseContext::default();
                    self.set_state(SessionState::Configured);
                }
                DeviceState::Paused => {
                    self.device_call("device wait", |d| d.wait_ready())?;
                    self.device_call("unpause", |d| d.pause(false))?;
                    self.pause = PauseContext::default();
                    self.set_state(SessionState::Running);
                }
                state => {
                    log::error!("Device in bad state while unpausing: {:?}", state);
                    return Err(SessionError::BadState { op: "resume", state });
                }
            }
        } else {
            log::debug!("Unpause not supported by hardware");
            self.device_call("prepare audio device", |d| d.prepare())?;
            self.set_state(SessionState::Configured);

            let frames = self.pause.prepause_frames;
            if frames > 0 {
                self.play_silence(frames)?;
            }
            self.pause = PauseContext::default();
        }

        Ok(())
    }

    /// 任意活动状态 → Configured：丢弃所有待播放帧并重新 prepare
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if !self.state.is_active() {
            return Err(SessionError::Inactive {
                op: "reset",
                state: self.state,
            });
        }

        self.pause = PauseContext::default();
        self.device_call("drop audio data", |d| d.drop_pending())?;
        self.device_call("prepare audio device", |d| d.prepare())?;
        self.set_state(SessionState::Configured);
        Ok(())
    }

    /// Running/Paused → Draining → Closed
    ///
    /// 尽力等待已缓冲帧播放完毕，然后总是释放句柄
    pub fn drain(&mut self) {
        match self.state {
            SessionState::Configured | SessionState::Running => {
                self.set_state(SessionState::Draining);
                if let Some(device) = self.device.as_mut() {
                    if let Err(e) = device.drain() {
                        log::warn!("Drain failed: {}", e);
                    }
                }
            }
            SessionState::Paused => {
                // 暂停中的数据不会再播放
                self.set_state(SessionState::Draining);
                log::debug!("Session {} drained while paused, dropping buffered audio", self.name);
            }
            _ => {}
        }

        self.uninit();
    }

    /// 释放设备句柄；重复调用为 no-op
    pub fn uninit(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };

        release(&mut device);
        self.pause = PauseContext::default();
        log::debug!("Session {} stats: {}", self.name, self.stats.report());

        if self.state != SessionState::Failed {
            self.set_state(SessionState::Closed);
        }
    }

    /// 合成并写入静音，用于无硬件暂停设备恢复播放时补齐时间线
    fn play_silence(&mut self, frames: u64) -> Result<(), SessionError> {
        let chunk = frames.min(self.caps.buffer_size.max(1));
        let plane_bytes = chunk as usize * self.format.plane_frame_bytes();
        let mut plane = vec![0u8; plane_bytes];
        fill_silence(self.format.encoding.kind, &mut plane);
        let planes: Vec<&[u8]> = (0..self.format.planes()).map(|_| plane.as_slice()).collect();

        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(chunk);
            match self.write(&planes, n, true) {
                WriteOutcome::Written(0) | WriteOutcome::WouldBlock => {
                    log::warn!("Device full, dropped {} frames of resume silence", remaining);
                    break;
                }
                WriteOutcome::Written(written) => {
                    self.stats.add_silence_frames(written);
                    remaining -= written;
                }
                WriteOutcome::RecoverableError(e) => {
                    log::warn!("Silence write failed: {}", e);
                    break;
                }
                WriteOutcome::FatalError(source) => {
                    return Err(SessionError::Device {
                        op: "write silence",
                        source,
                    });
                }
            }
        }

        Ok(())
    }
}

impl<D: PcmDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.uninit();
    }
}

/// 丢弃数据并关闭设备，错误只记录
fn release<D: PcmDevice + ?Sized>(device: &mut D) {
    if let Err(e) = device.drop_pending() {
        log::error!("Cannot drop audio data: {}", e);
    }
    if let Err(e) = device.close() {
        log::error!("Cannot close audio device: {}", e);
    }
    log::info!("Uninit finished");
}

/// Opening → Configured 的参数协商
fn configure<D: PcmDevice + ?Sized>(
    device: &mut D,
    format: &mut StreamFormat,
    layout: &mut ChannelLayout,
    resample: bool,
    selector: &dyn LayoutSelector,
) -> Result<Negotiated, InitError> {
    device
        .set_rate_resample(resample)
        .map_err(InitError::Resample)?;

    let device_format = negotiate_format(device, format)?;
    let access = negotiate_access(device, format)?;

    let resolved = resolve_channel_map(device, layout, selector);
    if !resolved.valid {
        log::warn!("Did not get a valid channel map from the device");
    } else if resolved.layout.len() != layout.len() {
        log::warn!(
            "Requested map with {} channels, got {} instead",
            layout.len(),
            resolved.layout.len()
        );
    }
    *layout = resolved.layout;
    format.channels = layout.len() as u32;

    device
        .set_channels(format.channels)
        .map_err(InitError::Channels)?;

    let rate = device
        .set_rate_near(format.sample_rate)
        .map_err(InitError::Rate)?;
    if rate == 0 {
        return Err(InitError::Rate(DeviceError::Unsupported));
    }
    if rate != format.sample_rate {
        log::info!("Sample rate fallback: {} → {} Hz", format.sample_rate, rate);
        format.sample_rate = rate;
    }

    let hw = device.commit().map_err(InitError::Commit)?;
    if hw.period_size == 0 || hw.buffer_size < hw.period_size {
        return Err(InitError::Commit(DeviceError::Other(format!(
            "invalid buffer geometry: buffer={} period={}",
            hw.buffer_size, hw.period_size
        ))));
    }

    if resolved.valid {
        apply_channel_map(device, layout)?;
    }

    let layouts = device
        .query_channel_maps()
        .unwrap_or_default()
        .iter()
        .map(|positions| ChannelLayout::from_positions(positions))
        .collect();

    Ok(Negotiated {
        device_format,
        access,
        valid_map: resolved.valid,
        caps: DeviceCapabilities {
            layouts,
            can_pause: hw.can_pause,
            buffer_size: hw.buffer_size,
            period_size: hw.period_size,
        },
    })
}
