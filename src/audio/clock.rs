//! 延迟与可写空间查询
//!
//! 查询失败一律降级为 0，不影响会话状态

use std::time::Duration;

use super::device::PcmDevice;
use super::session::{DeviceSession, SessionState};

impl<D: PcmDevice> DeviceSession<D> {
    /// 当前输出延迟
    ///
    /// 硬件暂停期间返回暂停时冻结的延迟。设备报告负延迟（underrun）时
    /// 将应用指针前移相应帧数，并报告 0
    pub fn current_latency(&mut self) -> Duration {
        if self.state == SessionState::Paused && self.caps.can_pause {
            return self.pause.delay_before_pause;
        }

        let Some(device) = self.device.as_mut() else {
            return Duration::ZERO;
        };

        let frames = match device.delay() {
            Ok(frames) => frames,
            Err(e) => {
                log::debug!("Error querying delay: {}", e);
                return Duration::ZERO;
            }
        };

        if frames < 0 {
            let behind = frames.unsigned_abs();
            // 消除 underrun 积累的负延迟
            match device.forward(behind) {
                Ok(moved) => log::debug!("Forwarded {} of {} frames after underrun", moved, behind),
                Err(e) => log::warn!("Cannot forward after underrun: {}", e),
            }
            self.stats.record_underrun(behind);
            return Duration::ZERO;
        }

        self.format.frames_to_duration(frames as u64)
    }

    /// 可写帧数，按周期向下对齐，不超过缓冲区大小
    pub fn get_space(&mut self) -> u64 {
        let buffer = self.caps.buffer_size;
        let period = self.caps.period_size.max(1);

        let Some(device) = self.device.as_mut() else {
            return 0;
        };

        let avail = match device.avail() {
            Ok(avail) if avail >= 0 => avail as u64,
            Ok(avail) => {
                log::debug!("Device reported negative space: {}", avail);
                return 0;
            }
            Err(e) => {
                log::debug!("Error received from status: {}", e);
                return 0;
            }
        };

        avail.min(buffer) / period * period
    }
}
