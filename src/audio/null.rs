//! 空设备后端
//!
//! 以实时时钟消费样本：硬件指针按采样率前进，缓冲区满时拒绝写入，
//! 应用写入跟不上时进入 XRun。可选把收到的原始样本写入文件。
//!
//! 设备名：
//! - `null` / `default`：支持硬件暂停
//! - `null:nopause`：不支持硬件暂停，会话走丢弃 + 静音补齐路径

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use super::chmap::{ChannelLayout, ChannelPosition};
use super::device::{
    output_devices, Access, Backend, DeviceDesc, DeviceError, DeviceHint, DeviceResult,
    DeviceState, HwConfig, PcmDevice,
};
use super::format::{find_sample_kind, DeviceFormat};
use super::wait::WakeSignal;

const MIN_RATE: u32 = 8000;
const MAX_RATE: u32 = 192_000;
const MAX_CHANNELS: u32 = 32;

/// 空设备配置
#[derive(Debug, Clone)]
pub struct NullConfig {
    /// 缓冲区长度（毫秒）
    pub buffer_ms: u32,
    /// 周期长度（毫秒）
    pub period_ms: u32,
    /// 是否支持硬件暂停（`null:nopause` 总是关闭）
    pub can_pause: bool,
    /// 原始样本输出文件
    pub dump: Option<PathBuf>,
}

impl Default for NullConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 200,
            period_ms: 50,
            can_pause: true,
            dump: None,
        }
    }
}

/// 空设备后端
#[derive(Debug, Clone, Default)]
pub struct NullBackend {
    config: NullConfig,
}

impl NullBackend {
    pub fn new(config: NullConfig) -> Self {
        Self { config }
    }
}

impl Backend for NullBackend {
    type Device = NullDevice;

    fn open(&self, name: &str) -> DeviceResult<NullDevice> {
        let mut config = self.config.clone();
        match name {
            "" | "default" | "null" => {}
            "null:nopause" => config.can_pause = false,
            other => return Err(DeviceError::NotFound(other.to_string())),
        }

        let dump = match &config.dump {
            Some(path) => {
                let file = File::create(path).map_err(|e| {
                    log::error!("Cannot create dump file {}: {}", path.display(), e);
                    DeviceError::from(e)
                })?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        log::debug!("Opened null device '{}' ({:?})", name, config);
        NullDevice::new(config, dump)
    }

    fn list_devices(&self) -> DeviceResult<Vec<DeviceDesc>> {
        let hints = [
            ("default", "Default output\nNull device with real-time clock"),
            ("null", "Null device\nDiscards all samples"),
            ("null:nopause", "Null device\nWithout hardware pause"),
        ];
        Ok(output_devices(hints.into_iter().map(|(name, desc)| DeviceHint {
            name: name.to_string(),
            description: Some(desc.to_string()),
            io: Some("Output".to_string()),
        })))
    }
}

/// 周期时钟线程：每个周期向管道写一个字节，供 poll 唤醒
struct Ticker {
    running: Arc<CachePadded<AtomicBool>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    fn start(tick: WakeSignal, period: Duration) -> DeviceResult<Self> {
        let running = Arc::new(CachePadded::new(AtomicBool::new(true)));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("null-clock".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    thread::sleep(period);
                    tick.wake();
                }
            })
            .map_err(DeviceError::from)?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 以实时时钟播放的空设备
pub struct NullDevice {
    config: NullConfig,
    state: DeviceState,

    format: Option<DeviceFormat>,
    access: Access,
    channels: u32,
    rate: u32,
    resample: bool,
    buffer_size: u64,
    period_size: u64,

    /// 应用指针：累计写入帧数
    appl_ptr: u64,
    /// 上次停表时的硬件指针
    hw_base: u64,
    /// 时钟运行起点；None 表示硬件指针静止
    started: Option<Instant>,

    tick: WakeSignal,
    ticker: Option<Ticker>,
    dump: Option<BufWriter<File>>,
}

impl NullDevice {
    fn new(config: NullConfig, dump: Option<BufWriter<File>>) -> DeviceResult<Self> {
        let tick = WakeSignal::new().map_err(DeviceError::from)?;
        Ok(Self {
            config,
            state: DeviceState::Open,
            format: None,
            access: Access::Interleaved,
            channels: 0,
            rate: 0,
            resample: true,
            buffer_size: 0,
            period_size: 0,
            appl_ptr: 0,
            hw_base: 0,
            started: None,
            tick,
            ticker: None,
            dump,
        })
    }

    fn hw_ptr(&self) -> u64 {
        match self.started {
            Some(start) => {
                let elapsed = start.elapsed().as_nanos();
                self.hw_base + (elapsed * self.rate as u128 / 1_000_000_000) as u64
            }
            None => self.hw_base,
        }
    }

    fn stop_clock(&mut self) {
        self.hw_base = self.hw_ptr();
        self.started = None;
    }

    fn frames_duration(&self, frames: u64) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((frames as u128 * 1_000_000_000 / self.rate as u128) as u64)
    }

    /// 推进时钟；缓冲区耗尽时进入 XRun
    fn update(&mut self) {
        if self.state == DeviceState::Running && self.hw_ptr() > self.appl_ptr {
            log::debug!("Null device underrun at frame {}", self.appl_ptr);
            self.stop_clock();
            self.state = DeviceState::XRun;
        }
    }

    fn buffered(&self) -> u64 {
        self.appl_ptr.saturating_sub(self.hw_ptr())
    }

    fn reset_pointers(&mut self) {
        self.appl_ptr = 0;
        self.hw_base = 0;
        self.started = None;
    }

    fn sample_bytes(&self) -> usize {
        self.format
            .and_then(find_sample_kind)
            .map(|kind| kind.bytes())
            .unwrap_or(0)
    }

    fn check_writable(&mut self) -> DeviceResult<u64> {
        self.update();
        match self.state {
            DeviceState::Prepared | DeviceState::Running => {}
            DeviceState::XRun => return Err(DeviceError::Underrun),
            DeviceState::Suspended => return Err(DeviceError::Suspended),
            DeviceState::Disconnected => return Err(DeviceError::Disconnected),
            _ => return Err(DeviceError::BadState),
        }
        Ok(self.buffer_size - self.buffered().min(self.buffer_size))
    }

    fn advance(&mut self, frames: u64) {
        self.appl_ptr += frames;
        if self.state == DeviceState::Prepared {
            self.state = DeviceState::Running;
            self.started = Some(Instant::now());
        }
    }

    fn dump_bytes(&mut self, bytes: &[u8]) {
        if let Some(out) = self.dump.as_mut() {
            if let Err(e) = out.write_all(bytes) {
                log::warn!("Dump write failed, disabling dump: {}", e);
                self.dump = None;
            }
        }
    }
}

impl PcmDevice for NullDevice {
    fn set_rate_resample(&mut self, enable: bool) -> DeviceResult<()> {
        self.resample = enable;
        Ok(())
    }

    fn set_access(&mut self, access: Access) -> DeviceResult<()> {
        self.access = access;
        Ok(())
    }

    fn test_format(&self, format: DeviceFormat) -> DeviceResult<()> {
        match format {
            DeviceFormat::Unknown => Err(DeviceError::Unsupported),
            _ => Ok(()),
        }
    }

    fn set_format(&mut self, format: DeviceFormat) -> DeviceResult<()> {
        self.test_format(format)?;
        self.format = Some(format);
        Ok(())
    }

    fn set_channels(&mut self, channels: u32) -> DeviceResult<()> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(DeviceError::Unsupported);
        }
        self.channels = channels;
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> DeviceResult<u32> {
        // 关闭重采样时只接受常见硬件采样率
        self.rate = if self.resample {
            rate.clamp(MIN_RATE, MAX_RATE)
        } else {
            [44_100u32, 48_000, 88_200, 96_000, 176_400, 192_000]
                .into_iter()
                .min_by_key(|r| r.abs_diff(rate))
                .unwrap_or(48_000)
        };
        Ok(self.rate)
    }

    fn commit(&mut self) -> DeviceResult<HwConfig> {
        if self.format.is_none() || self.channels == 0 || self.rate == 0 {
            return Err(DeviceError::BadState);
        }

        let rate = self.rate as u64;
        let ms_frames = |ms: u32| (rate * ms as u64 / 1000).max(1);
        self.period_size = ms_frames(self.config.period_ms);
        self.buffer_size = ms_frames(self.config.buffer_ms).max(self.period_size);

        let period = self.frames_duration(self.period_size);
        self.ticker = Some(Ticker::start(self.tick.clone(), period)?);

        self.reset_pointers();
        self.state = DeviceState::Prepared;

        Ok(HwConfig {
            buffer_size: self.buffer_size,
            period_size: self.period_size,
            can_pause: self.config.can_pause,
        })
    }

    fn query_channel_maps(&self) -> Option<Vec<Vec<ChannelPosition>>> {
        Some(
            [1, 2, 4, 6, 8]
                .into_iter()
                .map(|n| ChannelLayout::default_for(n).to_positions())
                .collect(),
        )
    }

    fn set_channel_map(&mut self, positions: &[ChannelPosition]) -> DeviceResult<()> {
        if positions.len() != self.channels as usize {
            return Err(DeviceError::Unsupported);
        }
        log::debug!("Null device channel map: {:?}", positions);
        Ok(())
    }

    fn state(&self) -> DeviceState {
        match self.state {
            DeviceState::Running if self.hw_ptr() > self.appl_ptr => DeviceState::XRun,
            state => state,
        }
    }

    fn write_interleaved(&mut self, data: &[u8], frames: u64) -> DeviceResult<u64> {
        if self.access != Access::Interleaved {
            return Err(DeviceError::BadState);
        }
        let space = self.check_writable()?;
        let frames = frames.min(space);
        if frames == 0 {
            return Ok(0);
        }

        let bytes = frames as usize * self.sample_bytes() * self.channels as usize;
        let bytes = bytes.min(data.len());
        self.dump_bytes(&data[..bytes]);
        self.advance(frames);
        Ok(frames)
    }

    fn write_planar(&mut self, planes: &[&[u8]], frames: u64) -> DeviceResult<u64> {
        if self.access != Access::NonInterleaved {
            return Err(DeviceError::BadState);
        }
        if planes.len() != self.channels as usize {
            return Err(DeviceError::Other(format!(
                "expected {} planes, got {}",
                self.channels,
                planes.len()
            )));
        }
        let space = self.check_writable()?;
        let frames = frames.min(space);
        if frames == 0 {
            return Ok(0);
        }

        if self.dump.is_some() {
            // 输出文件总是交织格式
            let sample = self.sample_bytes();
            let mut interleaved = Vec::with_capacity(frames as usize * sample * planes.len());
            for i in 0..frames as usize {
                for plane in planes {
                    let start = i * sample;
                    if let Some(bytes) = plane.get(start..start + sample) {
                        interleaved.extend_from_slice(bytes);
                    }
                }
            }
            self.dump_bytes(&interleaved);
        }

        self.advance(frames);
        Ok(frames)
    }

    fn recover(&mut self, err: &DeviceError) -> DeviceResult<()> {
        match err {
            DeviceError::Interrupted => Ok(()),
            DeviceError::Underrun | DeviceError::Suspended => self.prepare(),
            DeviceError::WouldBlock => Err(DeviceError::WouldBlock),
            other => Err(other.clone()),
        }
    }

    fn delay(&mut self) -> DeviceResult<i64> {
        // XRun 一旦进入就保持，直到 recover/prepare
        self.update();
        match self.state {
            DeviceState::Disconnected => Err(DeviceError::Disconnected),
            DeviceState::Open | DeviceState::Setup => Err(DeviceError::BadState),
            _ => Ok(self.appl_ptr as i64 - self.hw_ptr() as i64),
        }
    }

    fn forward(&mut self, frames: u64) -> DeviceResult<u64> {
        self.appl_ptr += frames;
        Ok(frames)
    }

    fn avail(&mut self) -> DeviceResult<i64> {
        self.update();
        match self.state {
            DeviceState::Disconnected => Err(DeviceError::Disconnected),
            DeviceState::XRun => Err(DeviceError::Underrun),
            _ => Ok(self.buffer_size as i64 - self.buffered().min(self.buffer_size) as i64),
        }
    }

    fn wait_ready(&mut self) -> DeviceResult<()> {
        self.update();
        if self.state != DeviceState::Running {
            return Ok(());
        }
        let free = self.buffer_size - self.buffered().min(self.buffer_size);
        if free < self.period_size {
            thread::sleep(self.frames_duration(self.period_size - free));
        }
        Ok(())
    }

    fn pause(&mut self, enable: bool) -> DeviceResult<()> {
        if !self.config.can_pause {
            return Err(DeviceError::Unsupported);
        }
        match (enable, self.state) {
            (true, DeviceState::Running) => {
                self.stop_clock();
                self.state = DeviceState::Paused;
                Ok(())
            }
            (false, DeviceState::Paused) => {
                self.started = Some(Instant::now());
                self.state = DeviceState::Running;
                Ok(())
            }
            _ => Err(DeviceError::BadState),
        }
    }

    fn drop_pending(&mut self) -> DeviceResult<()> {
        if matches!(self.state, DeviceState::Open | DeviceState::Disconnected) {
            return Err(DeviceError::BadState);
        }
        self.reset_pointers();
        self.state = DeviceState::Setup;
        Ok(())
    }

    fn prepare(&mut self) -> DeviceResult<()> {
        if matches!(self.state, DeviceState::Open | DeviceState::Disconnected) {
            return Err(DeviceError::BadState);
        }
        self.reset_pointers();
        self.state = DeviceState::Prepared;
        Ok(())
    }

    fn drain(&mut self) -> DeviceResult<()> {
        self.update();
        if self.state == DeviceState::Running {
            self.state = DeviceState::Draining;
            thread::sleep(self.frames_duration(self.buffered()));
        }
        if let Some(out) = self.dump.as_mut() {
            out.flush().map_err(DeviceError::from)?;
        }
        self.reset_pointers();
        self.state = DeviceState::Setup;
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        self.state = DeviceState::Disconnected;
        match self.dump.take() {
            Some(mut out) => out.flush().map_err(DeviceError::from),
            None => Ok(()),
        }
    }

    fn poll_descriptors(&self) -> DeviceResult<Vec<libc::pollfd>> {
        Ok(vec![libc::pollfd {
            fd: self.tick.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }])
    }

    fn poll_revents(&mut self, fds: &[libc::pollfd]) -> DeviceResult<i16> {
        if fds.iter().any(|fd| fd.revents & libc::POLLIN != 0) {
            self.tick.drain();
        }
        self.update();
        if self.state == DeviceState::Disconnected {
            return Ok(libc::POLLERR);
        }

        let free = self.buffer_size - self.buffered().min(self.buffer_size);
        if self.state != DeviceState::Running || free >= self.period_size {
            Ok(libc::POLLOUT)
        } else {
            Ok(0)
        }
    }
}
