//! 播放引擎
//!
//! 整合数据源与设备会话：播放线程循环执行
//! 读取数据源 → 等待可写空间 → 写入设备，
//! 控制操作（暂停、恢复、停止）在其他线程通过同一把会话锁执行

mod remap;
mod source;

pub use remap::{pack_into_planes, ChannelRemap};
pub use source::{FrameSource, ToneSource};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::audio::chmap::ChannelLayout;
use crate::audio::device::{Backend, DeviceError, PcmDevice};
use crate::audio::format::{SampleEncoding, StreamFormat};
use crate::audio::session::{
    DeviceSession, InitError, SessionError, SessionOptions, SessionState, StreamRequest,
};
use crate::audio::stats::{PlaybackStats, StatsReport};
use crate::audio::wait::{wait_for_space, WaitError, WaitStatus, WakeSignal};
use crate::audio::writer::WriteOutcome;
use crate::decode::DecodeError;

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    /// 数据源结束且已排空
    Finished,
    Stopped,
    Failed,
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 设备名
    pub device: String,
    /// 允许设备内部重采样
    pub resample: bool,
    /// 覆盖数据源的自然编码
    pub encoding: Option<SampleEncoding>,
    /// 请求的声道布局；None 时按数据源声道数取默认布局
    pub layout: Option<ChannelLayout>,
    /// 每次从数据源读取的帧数（至少一个周期）
    pub chunk_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            resample: true,
            encoding: None,
            layout: None,
            chunk_frames: 4096,
        }
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("audio initialization failed: {0}")]
    Init(#[from] InitError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("wait failed: {0}")]
    Wait(#[from] WaitError),
    #[error("audio write failed: {0}")]
    Write(#[source] DeviceError),
    #[error("cannot spawn playback thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 播放引擎统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub device: StatsReport,
    /// 已被设备接受的时长（秒），不含补齐的静音
    pub position_secs: f64,
    /// 当前输出延迟
    pub latency: Duration,
}

/// 播放线程共享标志
struct Flags {
    running: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
    failed: AtomicBool,
}

/// 播放引擎
pub struct Engine<D: PcmDevice + 'static> {
    session: Arc<Mutex<DeviceSession<D>>>,
    flags: Arc<Flags>,
    wake: WakeSignal,
    stats: Arc<PlaybackStats>,
    format: StreamFormat,
    layout: ChannelLayout,
    thread: Option<JoinHandle<Result<(), EngineError>>>,
}

impl<D: PcmDevice + 'static> Engine<D> {
    /// 打开设备并开始播放
    pub fn start<B>(
        backend: &B,
        source: Box<dyn FrameSource>,
        config: EngineConfig,
    ) -> Result<Self, EngineError>
    where
        B: Backend<Device = D>,
    {
        let channels = source.channels();
        let source_layout = ChannelLayout::default_for(channels);
        let layout = config.layout.clone().unwrap_or_else(|| source_layout.clone());
        let encoding = config.encoding.unwrap_or_else(|| source.natural_encoding());
        let request = StreamRequest::with_layout(
            StreamFormat::new(encoding, layout.len() as u32, source.sample_rate()),
            layout,
        );

        let wake = WakeSignal::new().map_err(InitError::Wakeup)?;
        let options = SessionOptions {
            device: config.device.clone(),
            resample: config.resample,
            wake: Some(wake.clone()),
        };
        let session = DeviceSession::open(backend, request, options)?;

        let format = session.format();
        let layout = session.layout().clone();
        let stats = session.stats();
        if format.sample_rate != source.sample_rate() {
            log::warn!(
                "Device runs at {} Hz, source is {} Hz: playback speed will differ",
                format.sample_rate,
                source.sample_rate()
            );
        }
        log::info!("Playing {} [{}] on {}", format, layout, session.device_name());

        let chunk_frames = config
            .chunk_frames
            .max(session.capabilities().period_size as usize);
        let session = Arc::new(Mutex::new(session));
        let flags = Arc::new(Flags {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let worker = PlaybackThread {
            session: Arc::clone(&session),
            flags: Arc::clone(&flags),
            source,
            remap: ChannelRemap::new(&source_layout, &layout),
            format,
            chunk_frames,
        };
        let thread = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || worker.run())
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            session,
            flags,
            wake,
            stats,
            format,
            layout,
            thread: Some(thread),
        })
    }

    /// 实际协商的输出格式
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn state(&self) -> PlaybackState {
        if self.flags.failed.load(Ordering::Acquire) {
            PlaybackState::Failed
        } else if self.flags.finished.load(Ordering::Acquire) {
            PlaybackState::Finished
        } else if !self.flags.running.load(Ordering::Acquire) {
            PlaybackState::Stopped
        } else if self.flags.paused.load(Ordering::Acquire) {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }

    /// 播放线程是否已退出（结束、失败或停止）
    pub fn is_done(&self) -> bool {
        matches!(
            self.state(),
            PlaybackState::Finished | PlaybackState::Failed | PlaybackState::Stopped
        )
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        if self.is_done() {
            return Err(EngineError::InvalidState("cannot pause when not playing"));
        }
        {
            let mut session = self.lock();
            session.pause()?;
        }
        self.flags.paused.store(true, Ordering::Release);
        // 让播放线程离开 poll 并停在 park
        self.wake.wake();
        log::info!("Paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        if self.is_done() {
            return Err(EngineError::InvalidState("cannot resume when not playing"));
        }
        {
            let mut session = self.lock();
            session.resume()?;
        }
        self.flags.paused.store(false, Ordering::Release);
        if let Some(handle) = &self.thread {
            handle.thread().unpark();
        }
        log::info!("Resumed");
        Ok(())
    }

    /// 暂停/恢复，返回切换后的状态
    pub fn toggle_pause(&mut self) -> Result<PlaybackState, EngineError> {
        match self.state() {
            PlaybackState::Playing => self.pause()?,
            PlaybackState::Paused => self.resume()?,
            _ => return Err(EngineError::InvalidState("cannot pause when stopped")),
        }
        Ok(self.state())
    }

    /// 停止播放，释放设备；返回播放线程的结果
    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.flags.running.store(false, Ordering::Release);
        self.wake.wake();

        let result = match self.thread.take() {
            Some(handle) => {
                handle.thread().unpark();
                handle
                    .join()
                    .unwrap_or(Err(EngineError::InvalidState("playback thread panicked")))
            }
            None => Ok(()),
        };

        self.lock().uninit();
        log::info!("Playback stopped");
        result
    }

    /// 阻塞直到播放结束
    pub fn wait(&mut self) -> Result<(), EngineError> {
        let result = match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(EngineError::InvalidState("playback thread panicked"))),
            None => Ok(()),
        };
        self.lock().uninit();
        result
    }

    pub fn stats(&self) -> EngineStats {
        let device = self.stats.report();
        let played = device.frames_written.saturating_sub(device.silence_frames);
        let latency = self.lock().current_latency();
        EngineStats {
            device,
            position_secs: played as f64 / self.format.sample_rate.max(1) as f64,
            latency,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceSession<D>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: PcmDevice + 'static> Drop for Engine<D> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

/// 播放线程状态
struct PlaybackThread<D: PcmDevice> {
    session: Arc<Mutex<DeviceSession<D>>>,
    flags: Arc<Flags>,
    source: Box<dyn FrameSource>,
    remap: ChannelRemap,
    format: StreamFormat,
    chunk_frames: usize,
}

impl<D: PcmDevice> PlaybackThread<D> {
    fn run(mut self) -> Result<(), EngineError> {
        let result = self.play();
        match &result {
            Ok(()) => log::info!("Playback thread finished"),
            Err(e) => {
                log::error!("Playback failed: {}", e);
                self.flags.failed.store(true, Ordering::Release);
            }
        }
        result
    }

    fn play(&mut self) -> Result<(), EngineError> {
        let plane_count = self.format.planes();
        let plane_frame_bytes = self.format.plane_frame_bytes();
        let mut planes: Vec<Vec<u8>> = vec![Vec::new(); plane_count];
        let mut pending: u64 = 0;
        let mut eof = false;

        let mut decoded = Vec::new();
        let mut remapped = Vec::new();

        loop {
            if !self.flags.running.load(Ordering::Acquire) {
                return Ok(());
            }
            // 暂停期间 park，resume/stop 时 unpark
            if self.flags.paused.load(Ordering::Acquire) {
                thread::park();
                continue;
            }

            if !eof && (pending as usize) < self.chunk_frames {
                decoded.clear();
                let frames = self.source.read(self.chunk_frames, &mut decoded)?;
                if frames == 0 {
                    eof = true;
                } else {
                    remapped.clear();
                    self.remap.apply(&decoded, &mut remapped);
                    pack_into_planes(&self.format, &remapped, &mut planes);
                    pending += frames as u64;
                }
            }

            if eof && pending == 0 {
                let mut session = self.lock();
                session.drain();
                self.flags.finished.store(true, Ordering::Release);
                return Ok(());
            }

            let guard = self.lock();
            if guard.state() == SessionState::Paused {
                continue;
            }
            let (mut session, status) = wait_for_space(&self.session, guard);
            match status? {
                WaitStatus::Canceled => continue,
                WaitStatus::Ready => {}
            }
            if session.state() == SessionState::Paused {
                continue;
            }

            let slices: Vec<&[u8]> = planes.iter().map(|p| p.as_slice()).collect();
            match session.write(&slices, pending, eof) {
                WriteOutcome::Written(written) => {
                    let bytes = written as usize * plane_frame_bytes;
                    for plane in planes.iter_mut() {
                        plane.drain(..bytes);
                    }
                    pending -= written;
                }
                WriteOutcome::WouldBlock => {}
                WriteOutcome::RecoverableError(e) => {
                    log::warn!("Dropping {} frames after write error: {}", pending, e);
                    for plane in planes.iter_mut() {
                        plane.clear();
                    }
                    pending = 0;
                }
                WriteOutcome::FatalError(e) => return Err(EngineError::Write(e)),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceSession<D>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleKind;
    use crate::audio::null::{NullBackend, NullConfig};

    fn config(device: &str) -> EngineConfig {
        EngineConfig {
            device: device.to_string(),
            chunk_frames: 1024,
            ..EngineConfig::default()
        }
    }

    fn short_buffers() -> NullBackend {
        let _ = env_logger::builder().is_test(true).try_init();
        NullBackend::new(NullConfig {
            buffer_ms: 40,
            period_ms: 10,
            ..NullConfig::default()
        })
    }

    #[test]
    fn test_plays_tone_to_completion() {
        let backend = short_buffers();
        let tone = ToneSource::sine(440.0, 48000, 2, Some(0.1));
        let mut engine = Engine::start(&backend, Box::new(tone), config("null")).unwrap();

        engine.wait().unwrap();
        assert_eq!(engine.state(), PlaybackState::Finished);
        let stats = engine.stats();
        assert_eq!(stats.device.frames_written, 4800);
        assert!((stats.position_secs - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_pause_resume_without_hardware_pause() {
        let backend = short_buffers();
        let tone = ToneSource::sine(440.0, 48000, 2, Some(0.3));
        let mut engine = Engine::start(&backend, Box::new(tone), config("null:nopause")).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.toggle_pause().unwrap(), PlaybackState::Paused);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.toggle_pause().unwrap(), PlaybackState::Playing);

        engine.wait().unwrap();
        let report = engine.stats().device;
        // 所有源数据都已写入，另有补齐的静音
        assert_eq!(report.frames_written - report.silence_frames, 14400);
    }

    #[test]
    fn test_native_pause_and_stop() {
        let backend = short_buffers();
        let tone = ToneSource::sine(440.0, 48000, 2, None);
        let mut engine = Engine::start(&backend, Box::new(tone), config("null")).unwrap();

        thread::sleep(Duration::from_millis(30));
        engine.pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Paused);
        let written = engine.stats().device.frames_written;
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.stats().device.frames_written, written);

        engine.resume().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(engine.pause().is_err());
    }

    #[test]
    fn test_layout_and_format_negotiation() {
        let backend = NullBackend::default();
        let tone = ToneSource::sine(440.0, 44100, 6, Some(0.05));
        let config = EngineConfig {
            device: "null".into(),
            encoding: Some(SampleEncoding::planar(SampleKind::Float)),
            ..EngineConfig::default()
        };
        let mut engine = Engine::start(&backend, Box::new(tone), config).unwrap();

        assert_eq!(engine.layout(), &ChannelLayout::surround51());
        assert_eq!(
            engine.format().encoding,
            SampleEncoding::planar(SampleKind::Float)
        );
        engine.wait().unwrap();
        assert_eq!(engine.stats().device.frames_written, 2205);
    }

    #[test]
    fn test_unknown_device() {
        let tone = ToneSource::sine(440.0, 48000, 2, Some(0.1));
        let result = Engine::start(&NullBackend::default(), Box::new(tone), config("hw:7"));
        assert!(matches!(result, Err(EngineError::Init(InitError::Open { .. }))));
    }
}
