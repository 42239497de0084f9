//! 写入路径
//!
//! 非最后一块的写入按周期对齐；瞬态错误恢复一次后重试一次

use super::device::{Access, DeviceError, DeviceResult, PcmDevice};
use super::session::{DeviceSession, SessionState};

/// 一次写入的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 设备接受的帧数
    Written(u64),
    /// 设备暂时没有空间
    WouldBlock,
    /// 恢复后仍失败，丢弃这块数据即可继续
    RecoverableError(DeviceError),
    /// 会话已进入 Failed
    FatalError(DeviceError),
}

impl<D: PcmDevice> DeviceSession<D> {
    /// 写入 `frames` 帧
    ///
    /// 交织会话只使用 `planes[0]`，平面会话每声道一个缓冲区。
    /// 非最后一块时帧数向下取整到周期的整数倍
    pub fn write(&mut self, planes: &[&[u8]], frames: u64, final_chunk: bool) -> WriteOutcome {
        if !matches!(self.state, SessionState::Configured | SessionState::Running) {
            log::debug!("Write rejected while session is {:?}", self.state);
            return WriteOutcome::FatalError(DeviceError::BadState);
        }

        let period = self.caps.period_size.max(1);
        let frames = if final_chunk {
            frames
        } else {
            frames / period * period
        };
        if frames == 0 {
            return WriteOutcome::Written(0);
        }

        let expected_planes = match self.access {
            Access::Interleaved => 1,
            Access::NonInterleaved => self.format.planes(),
        };
        // 帧数过大时乘法溢出，同样按缓冲区不足处理
        let needed = usize::try_from(frames)
            .ok()
            .and_then(|f| f.checked_mul(self.format.plane_frame_bytes()));
        let short = match needed {
            Some(needed) => {
                planes.len() < expected_planes
                    || planes[..expected_planes].iter().any(|p| p.len() < needed)
            }
            None => true,
        };
        if short {
            log::error!(
                "Write buffer too small: {} frames need {} planes of {:?} bytes",
                frames,
                expected_planes,
                needed
            );
            self.stats.record_write_error();
            self.set_state(SessionState::Failed);
            return WriteOutcome::FatalError(DeviceError::Other("short write buffer".into()));
        }

        let access = self.access;
        let Some(device) = self.device.as_mut() else {
            return WriteOutcome::FatalError(DeviceError::BadState);
        };

        let result = match submit(device, access, planes, frames) {
            Err(err) if err.is_transient() => {
                log::info!("Trying to reset soundcard after {}", err);
                self.stats.record_recovery();
                match device.recover(&err) {
                    Ok(()) | Err(DeviceError::WouldBlock) => submit(device, access, planes, frames),
                    Err(e) => {
                        log::error!("Audio write error, cannot recover: {}", e);
                        self.stats.record_write_error();
                        self.set_state(SessionState::Failed);
                        return WriteOutcome::FatalError(e);
                    }
                }
            }
            other => other,
        };

        match result {
            Ok(0) => WriteOutcome::WouldBlock,
            Ok(written) => {
                self.stats.add_frames_written(written);
                self.set_state(SessionState::Running);
                WriteOutcome::Written(written)
            }
            Err(e) if e.is_transient() => {
                log::warn!("Audio write failed after recovery: {}", e);
                self.stats.record_write_error();
                WriteOutcome::RecoverableError(e)
            }
            Err(e) => {
                log::error!("Write error: {}", e);
                self.stats.record_write_error();
                self.set_state(SessionState::Failed);
                WriteOutcome::FatalError(e)
            }
        }
    }
}

fn submit<D: PcmDevice + ?Sized>(
    device: &mut D,
    access: Access,
    planes: &[&[u8]],
    frames: u64,
) -> DeviceResult<u64> {
    match access {
        Access::Interleaved => device.write_interleaved(planes[0], frames),
        Access::NonInterleaved => device.write_planar(planes, frames),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{SampleEncoding, SampleKind, StreamFormat};
    use crate::audio::mock::{MockBackend, MockDevice};
    use crate::audio::session::{SessionOptions, StreamRequest};

    fn open(mock: &MockDevice, encoding: SampleEncoding) -> DeviceSession<MockDevice> {
        let req = StreamRequest::new(StreamFormat::new(encoding, 2, 48000));
        DeviceSession::open(&MockBackend::new(mock.clone()), req, SessionOptions::default()).unwrap()
    }

    #[test]
    fn test_non_final_writes_are_period_aligned() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        let period = session.capabilities().period_size;
        let data = vec![0u8; 8192 * 4];

        assert_eq!(session.write(&[&data], period - 1, false), WriteOutcome::Written(0));
        assert!(mock.with(|s| s.written.is_empty()));
        assert_eq!(session.state(), SessionState::Configured);

        assert_eq!(
            session.write(&[&data], period * 2 + 17, false),
            WriteOutcome::Written(period * 2)
        );
        assert_eq!(session.state(), SessionState::Running);

        // 最后一块不对齐
        assert_eq!(session.write(&[&data], 17, true), WriteOutcome::Written(17));
        assert_eq!(mock.with(|s| s.written.clone()), vec![period * 2, 17]);
        assert_eq!(session.stats().frames_written(), period * 2 + 17);
    }

    #[test]
    fn test_single_transient_failure_recovers() {
        for err in [
            DeviceError::Underrun,
            DeviceError::Interrupted,
            DeviceError::Suspended,
            DeviceError::WouldBlock,
        ] {
            let mock = MockDevice::new();
            let mut session = open(&mock, SampleEncoding::S16);
            mock.with(|s| s.write_errors.push_back(err.clone()));

            let data = vec![0u8; 1024 * 4];
            assert_eq!(session.write(&[&data], 1024, false), WriteOutcome::Written(1024));
            assert_eq!(mock.with(|s| s.recovered.clone()), vec![err]);
            assert_eq!(session.stats().recovery_count(), 1);
        }
    }

    #[test]
    fn test_second_transient_failure_is_recoverable_error() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        mock.with(|s| {
            s.write_errors.push_back(DeviceError::Underrun);
            s.write_errors.push_back(DeviceError::Underrun);
        });

        let data = vec![0u8; 1024 * 4];
        assert_eq!(
            session.write(&[&data], 1024, false),
            WriteOutcome::RecoverableError(DeviceError::Underrun)
        );
        assert_eq!(mock.with(|s| s.recovered.len()), 1);
        assert_eq!(session.state(), SessionState::Configured);

        // 下一次写入正常
        assert_eq!(session.write(&[&data], 1024, false), WriteOutcome::Written(1024));
    }

    #[test]
    fn test_recovery_would_block_still_retries() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        mock.with(|s| {
            s.write_errors.push_back(DeviceError::Suspended);
            s.recover_error = Some(DeviceError::WouldBlock);
        });

        let data = vec![0u8; 1024 * 4];
        assert_eq!(session.write(&[&data], 1024, false), WriteOutcome::Written(1024));
    }

    #[test]
    fn test_failed_recovery_is_fatal() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        mock.with(|s| {
            s.write_errors.push_back(DeviceError::Underrun);
            s.recover_error = Some(DeviceError::Disconnected);
        });

        let data = vec![0u8; 1024 * 4];
        assert_eq!(
            session.write(&[&data], 1024, false),
            WriteOutcome::FatalError(DeviceError::Disconnected)
        );
        assert_eq!(session.state(), SessionState::Failed);

        // Failed 之后不再触碰设备
        let writes = mock.with(|s| s.written.len());
        assert_eq!(
            session.write(&[&data], 1024, false),
            WriteOutcome::FatalError(DeviceError::BadState)
        );
        assert_eq!(mock.with(|s| s.written.len()), writes);
    }

    #[test]
    fn test_non_transient_failure_is_fatal() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        mock.with(|s| s.write_errors.push_back(DeviceError::Os(libc::EIO)));

        let data = vec![0u8; 1024 * 4];
        assert_eq!(
            session.write(&[&data], 1024, false),
            WriteOutcome::FatalError(DeviceError::Os(libc::EIO))
        );
        assert!(mock.with(|s| s.recovered.is_empty()));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_zero_accepted_is_would_block() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        mock.with(|s| s.accept_limit = Some(0));

        let data = vec![0u8; 1024 * 4];
        assert_eq!(session.write(&[&data], 1024, false), WriteOutcome::WouldBlock);
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_planar_session_writes_one_buffer_per_channel() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::planar(SampleKind::S16));
        assert_eq!(session.access(), Access::NonInterleaved);

        let left = vec![1u8; 1024 * 2];
        let right = vec![2u8; 1024 * 2];
        assert_eq!(
            session.write(&[&left, &right], 1024, false),
            WriteOutcome::Written(1024)
        );
        assert_eq!(mock.with(|s| s.planar_writes), 1);
    }

    #[test]
    fn test_short_buffer_fails_session() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);

        let data = vec![0u8; 16];
        assert!(matches!(
            session.write(&[&data], 1024, true),
            WriteOutcome::FatalError(DeviceError::Other(_))
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(mock.with(|s| s.written.is_empty()));
        assert_eq!(session.stats().report().write_errors, 1);
    }

    #[test]
    fn test_huge_frame_count_does_not_overflow() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);

        let data = vec![0u8; 4096];
        assert!(matches!(
            session.write(&[&data], u64::MAX, true),
            WriteOutcome::FatalError(DeviceError::Other(_))
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(mock.with(|s| s.written.is_empty()));
    }

    #[test]
    fn test_write_while_paused_rejected() {
        let mock = MockDevice::new();
        let mut session = open(&mock, SampleEncoding::S16);
        session.pause().unwrap();

        let data = vec![0u8; 1024 * 4];
        assert_eq!(
            session.write(&[&data], 1024, false),
            WriteOutcome::FatalError(DeviceError::BadState)
        );
        assert_eq!(session.state(), SessionState::Paused);
        assert!(mock.with(|s| s.written.is_empty()));
    }
}
