//! 测试用的脚本化设备
//!
//! 所有克隆共享同一份状态：测试先打开会话，再通过 `with` 修改设备行为或检查记录

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use super::chmap::ChannelPosition;
use super::device::{
    output_devices, Access, Backend, DeviceDesc, DeviceError, DeviceHint, DeviceResult,
    DeviceState, HwConfig, PcmDevice,
};
use super::format::DeviceFormat;

#[derive(Debug)]
pub struct MockState {
    pub ops: Vec<&'static str>,
    pub state: DeviceState,
    pub closed: bool,

    pub formats: Vec<DeviceFormat>,
    pub reject_set_format: bool,
    pub format: Option<DeviceFormat>,
    pub allow_planar: bool,
    pub access: Option<Access>,
    pub channels: u32,
    pub rate: u32,
    pub rate_override: Option<u32>,
    pub hw: HwConfig,
    pub commit_error: Option<DeviceError>,

    pub channel_maps: Option<Vec<Vec<ChannelPosition>>>,
    pub applied_map: Option<Vec<ChannelPosition>>,
    pub chmap_error: Option<DeviceError>,

    /// 每次成功写入接受的帧数
    pub written: Vec<u64>,
    pub data: Vec<u8>,
    pub planar_writes: usize,
    pub accept_limit: Option<u64>,
    pub write_errors: VecDeque<DeviceError>,
    pub recovered: Vec<DeviceError>,
    pub recover_error: Option<DeviceError>,
    pub prepare_error: Option<DeviceError>,

    pub delay: i64,
    pub delay_error: Option<DeviceError>,
    pub forwarded: Vec<u64>,
    pub avail: i64,
    pub avail_error: Option<DeviceError>,

    pub writable: bool,
    pub poll_fd_count: usize,
    pub poll_error: bool,
}

impl MockState {
    pub fn total_written(&self) -> u64 {
        self.written.iter().sum()
    }
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            state: DeviceState::Open,
            closed: false,
            formats: vec![
                DeviceFormat::S8,
                DeviceFormat::U8,
                DeviceFormat::S16,
                DeviceFormat::U16,
                DeviceFormat::S24_3LE,
                DeviceFormat::S24_3BE,
                DeviceFormat::U24_3LE,
                DeviceFormat::U24_3BE,
                DeviceFormat::S32,
                DeviceFormat::U32,
                DeviceFormat::Float,
            ],
            reject_set_format: false,
            format: None,
            allow_planar: true,
            access: None,
            channels: 0,
            rate: 0,
            rate_override: None,
            hw: HwConfig {
                buffer_size: 4096,
                period_size: 1024,
                can_pause: true,
            },
            commit_error: None,
            channel_maps: Some(vec![
                vec![ChannelPosition::FL, ChannelPosition::FR],
                vec![
                    ChannelPosition::FL,
                    ChannelPosition::FR,
                    ChannelPosition::RL,
                    ChannelPosition::RR,
                    ChannelPosition::FC,
                    ChannelPosition::LFE,
                ],
            ]),
            applied_map: None,
            chmap_error: None,
            written: Vec::new(),
            data: Vec::new(),
            planar_writes: 0,
            accept_limit: None,
            write_errors: VecDeque::new(),
            recovered: Vec::new(),
            recover_error: None,
            prepare_error: None,
            delay: 0,
            delay_error: None,
            forwarded: Vec::new(),
            avail: 4096,
            avail_error: None,
            writable: true,
            poll_fd_count: 1,
            poll_error: false,
        }
    }
}

#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    /// 可写的 socket，用作 poll 描述符
    socket: Arc<(UnixStream, UnixStream)>,
}

impl MockDevice {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            socket: Arc::new(UnixStream::pair().unwrap()),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn accept(&mut self, data: &[u8], frames: u64) -> DeviceResult<u64> {
        self.with(|s| {
            s.ops.push("write");
            if let Some(e) = s.write_errors.pop_front() {
                return Err(e);
            }
            if !matches!(s.state, DeviceState::Prepared | DeviceState::Running) {
                return Err(DeviceError::BadState);
            }

            let accepted = s.accept_limit.map_or(frames, |limit| limit.min(frames));
            if accepted > 0 {
                let bytes = (data.len() as u64 * accepted / frames) as usize;
                s.data.extend_from_slice(&data[..bytes]);
                s.written.push(accepted);
                s.state = DeviceState::Running;
            }
            Ok(accepted)
        })
    }
}

fn check(err: &Option<DeviceError>) -> DeviceResult<()> {
    match err {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    }
}

impl PcmDevice for MockDevice {
    fn set_rate_resample(&mut self, _enable: bool) -> DeviceResult<()> {
        self.with(|s| s.ops.push("resample"));
        Ok(())
    }

    fn set_access(&mut self, access: Access) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("access");
            if access == Access::NonInterleaved && !s.allow_planar {
                return Err(DeviceError::Unsupported);
            }
            s.access = Some(access);
            Ok(())
        })
    }

    fn test_format(&self, format: DeviceFormat) -> DeviceResult<()> {
        let s = self.state.lock().unwrap();
        if s.formats.contains(&format) {
            Ok(())
        } else {
            Err(DeviceError::Unsupported)
        }
    }

    fn set_format(&mut self, format: DeviceFormat) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("format");
            if s.reject_set_format || !s.formats.contains(&format) {
                return Err(DeviceError::Unsupported);
            }
            s.format = Some(format);
            Ok(())
        })
    }

    fn set_channels(&mut self, channels: u32) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("channels");
            s.channels = channels;
        });
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> DeviceResult<u32> {
        self.with(|s| {
            s.ops.push("rate");
            s.rate = s.rate_override.unwrap_or(rate);
            Ok(s.rate)
        })
    }

    fn commit(&mut self) -> DeviceResult<HwConfig> {
        self.with(|s| {
            s.ops.push("commit");
            check(&s.commit_error)?;
            s.state = DeviceState::Prepared;
            Ok(s.hw)
        })
    }

    fn query_channel_maps(&self) -> Option<Vec<Vec<ChannelPosition>>> {
        self.state.lock().unwrap().channel_maps.clone()
    }

    fn set_channel_map(&mut self, positions: &[ChannelPosition]) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("chmap");
            check(&s.chmap_error)?;
            s.applied_map = Some(positions.to_vec());
            Ok(())
        })
    }

    fn state(&self) -> DeviceState {
        self.state.lock().unwrap().state
    }

    fn write_interleaved(&mut self, data: &[u8], frames: u64) -> DeviceResult<u64> {
        self.accept(data, frames)
    }

    fn write_planar(&mut self, planes: &[&[u8]], frames: u64) -> DeviceResult<u64> {
        self.with(|s| s.planar_writes += 1);
        self.accept(planes[0], frames)
    }

    fn recover(&mut self, err: &DeviceError) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("recover");
            s.recovered.push(err.clone());
            check(&s.recover_error)?;
            s.state = DeviceState::Prepared;
            Ok(())
        })
    }

    fn delay(&mut self) -> DeviceResult<i64> {
        self.with(|s| {
            check(&s.delay_error)?;
            Ok(s.delay)
        })
    }

    fn forward(&mut self, frames: u64) -> DeviceResult<u64> {
        self.with(|s| {
            s.ops.push("forward");
            s.forwarded.push(frames);
            s.delay = 0;
            Ok(frames)
        })
    }

    fn avail(&mut self) -> DeviceResult<i64> {
        self.with(|s| {
            check(&s.avail_error)?;
            Ok(s.avail)
        })
    }

    fn wait_ready(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn pause(&mut self, enable: bool) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("pause");
            s.state = if enable {
                DeviceState::Paused
            } else {
                DeviceState::Running
            };
        });
        Ok(())
    }

    fn drop_pending(&mut self) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("drop");
            s.state = DeviceState::Setup;
        });
        Ok(())
    }

    fn prepare(&mut self) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("prepare");
            check(&s.prepare_error)?;
            s.state = DeviceState::Prepared;
            Ok(())
        })
    }

    fn drain(&mut self) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("drain");
            s.state = DeviceState::Setup;
        });
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        self.with(|s| {
            s.ops.push("close");
            s.closed = true;
        });
        Ok(())
    }

    fn poll_descriptors(&self) -> DeviceResult<Vec<libc::pollfd>> {
        let s = self.state.lock().unwrap();
        // 负描述符被 poll 忽略，用来模拟设备不可写
        let fd = if s.writable {
            self.socket.0.as_raw_fd()
        } else {
            -1
        };
        Ok(vec![
            libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            };
            s.poll_fd_count
        ])
    }

    fn poll_revents(&mut self, fds: &[libc::pollfd]) -> DeviceResult<i16> {
        if self.with(|s| s.poll_error) {
            return Ok(libc::POLLERR);
        }
        Ok(fds.iter().fold(0, |acc, fd| acc | (fd.revents & libc::POLLOUT)))
    }
}

pub struct MockBackend {
    pub device: MockDevice,
    pub open_error: Option<DeviceError>,
}

impl MockBackend {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            open_error: None,
        }
    }
}

impl Backend for MockBackend {
    type Device = MockDevice;

    fn open(&self, _name: &str) -> DeviceResult<MockDevice> {
        check(&self.open_error)?;
        Ok(self.device.clone())
    }

    fn list_devices(&self) -> DeviceResult<Vec<DeviceDesc>> {
        Ok(output_devices([DeviceHint {
            name: "mock".into(),
            description: Some("Scripted\ntest device".into()),
            io: Some("Output".into()),
        }]))
    }
}
