//! 等待可写空间
//!
//! 等待期间释放会话锁，其他线程可以在两次等待之间执行 pause/reset。
//! 唤醒通过管道实现：等待开始前发出的唤醒不会丢失

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::device::{DeviceError, PcmDevice};
use super::session::{DeviceSession, SessionState};

/// 设备描述符数量上限（不含唤醒管道）
pub const MAX_POLL_FDS: usize = 20;

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// 设备可写
    Ready,
    /// 被 `WakeSignal::wake` 取消
    Canceled,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("device returned {0} poll descriptors, expected 1..{max}", max = MAX_POLL_FDS)]
    Descriptors(usize),
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("device error while waiting: {0}")]
    Device(#[source] DeviceError),
    #[error("cannot wait while session is {0:?}")]
    Inactive(SessionState),
}

#[derive(Debug)]
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

/// 唤醒句柄，可跨线程克隆
#[derive(Debug, Clone)]
pub struct WakeSignal {
    pipe: Arc<Pipe>,
}

impl WakeSignal {
    /// 创建非阻塞、close-on-exec 的唤醒管道
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds 有两个元素
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe 成功后两个描述符归我们所有
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_flags(fd)?;
        }

        Ok(Self {
            pipe: Arc::new(Pipe { read, write }),
        })
    }

    /// 取消当前或下一次等待
    pub fn wake(&self) {
        let byte = 0u8;
        // SAFETY: 写入 1 字节到有效描述符
        let n = unsafe {
            libc::write(
                self.pipe.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // 管道已满说明已有未处理的唤醒
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("Failed to signal wakeup: {}", err);
            }
        }
    }

    /// 清空所有未处理的唤醒
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf 是有效的可写缓冲区
            let n = unsafe {
                libc::read(
                    self.pipe.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.pipe.read.as_raw_fd()
    }
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl 只读写描述符标志
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// 无超时 poll，EINTR 时重试
fn poll_forever(fds: &mut [libc::pollfd]) -> io::Result<()> {
    loop {
        // SAFETY: fds 在调用期间有效
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// 阻塞直到设备可写或被唤醒
///
/// 收集描述符时持有锁，poll 期间释放锁，返回前重新获取
pub fn wait_for_space<'a, D: PcmDevice>(
    lock: &'a Mutex<DeviceSession<D>>,
    mut guard: MutexGuard<'a, DeviceSession<D>>,
) -> (MutexGuard<'a, DeviceSession<D>>, Result<WaitStatus, WaitError>) {
    loop {
        let state = guard.state;
        let descriptors = match guard.device.as_ref() {
            Some(device) if state.is_active() => device.poll_descriptors(),
            _ => return (guard, Err(WaitError::Inactive(state))),
        };
        let mut fds = match descriptors {
            Ok(fds) => fds,
            Err(e) => return (guard, Err(WaitError::Device(e))),
        };

        let count = fds.len();
        if count == 0 || count >= MAX_POLL_FDS {
            log::error!("Unexpected number of poll descriptors: {}", count);
            return (guard, Err(WaitError::Descriptors(count)));
        }

        let wake = guard.wake.clone();
        fds.push(libc::pollfd {
            fd: wake.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        drop(guard);
        let polled = poll_forever(&mut fds);
        guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = polled {
            log::error!("poll error: {}", e);
            return (guard, Err(WaitError::Poll(e)));
        }

        if fds[count].revents & libc::POLLIN != 0 {
            wake.drain();
            return (guard, Ok(WaitStatus::Canceled));
        }

        let revents = match guard.device.as_mut() {
            Some(device) => device.poll_revents(&fds[..count]),
            None => return (guard, Err(WaitError::Inactive(state))),
        };
        let revents = match revents {
            Ok(revents) => revents,
            Err(e) => return (guard, Err(WaitError::Device(e))),
        };

        if revents & libc::POLLERR != 0 {
            log::error!("Device reported error condition while waiting");
            return (
                guard,
                Err(WaitError::Device(DeviceError::Other(
                    "poll reported error condition".into(),
                ))),
            );
        }
        if revents & libc::POLLOUT != 0 {
            return (guard, Ok(WaitStatus::Ready));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{SampleEncoding, StreamFormat};
    use crate::audio::mock::{MockBackend, MockDevice};
    use crate::audio::session::{SessionOptions, StreamRequest};
    use std::thread;
    use std::time::Duration;

    fn open(mock: &MockDevice, wake: &WakeSignal) -> Mutex<DeviceSession<MockDevice>> {
        let req = StreamRequest::new(StreamFormat::new(SampleEncoding::S16, 2, 48000));
        let options = SessionOptions {
            wake: Some(wake.clone()),
            ..SessionOptions::default()
        };
        Mutex::new(DeviceSession::open(&MockBackend::new(mock.clone()), req, options).unwrap())
    }

    #[test]
    fn test_ready_when_device_writable() {
        let mock = MockDevice::new();
        let wake = WakeSignal::new().unwrap();
        let session = open(&mock, &wake);

        let guard = session.lock().unwrap();
        let (_guard, status) = wait_for_space(&session, guard);
        assert_eq!(status.unwrap(), WaitStatus::Ready);
    }

    #[test]
    fn test_wake_before_wait_is_not_lost() {
        let mock = MockDevice::new();
        mock.with(|s| s.writable = false);
        let wake = WakeSignal::new().unwrap();
        let session = open(&mock, &wake);

        wake.wake();
        wake.wake();
        let guard = session.lock().unwrap();
        let (guard, status) = wait_for_space(&session, guard);
        assert_eq!(status.unwrap(), WaitStatus::Canceled);

        // 唤醒已被消费
        drop(guard);
        mock.with(|s| s.writable = true);
        let guard = session.lock().unwrap();
        let (_guard, status) = wait_for_space(&session, guard);
        assert_eq!(status.unwrap(), WaitStatus::Ready);
    }

    #[test]
    fn test_wake_from_other_thread_cancels_blocked_wait() {
        let mock = MockDevice::new();
        mock.with(|s| s.writable = false);
        let wake = WakeSignal::new().unwrap();
        let session = Arc::new(open(&mock, &wake));

        let waiter = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                let guard = session.lock().unwrap();
                let (_guard, status) = wait_for_space(&session, guard);
                status.unwrap()
            })
        };

        // 等待期间锁已释放
        thread::sleep(Duration::from_millis(50));
        {
            let mut guard = session.lock().unwrap();
            guard.pause().unwrap();
        }
        wake.wake();

        assert_eq!(waiter.join().unwrap(), WaitStatus::Canceled);
    }

    #[test]
    fn test_descriptor_count_limits() {
        let mock = MockDevice::new();
        let wake = WakeSignal::new().unwrap();
        let session = open(&mock, &wake);

        for count in [0, MAX_POLL_FDS] {
            mock.with(|s| s.poll_fd_count = count);
            let guard = session.lock().unwrap();
            let (_guard, status) = wait_for_space(&session, guard);
            assert!(matches!(status, Err(WaitError::Descriptors(n)) if n == count));
        }
    }

    #[test]
    fn test_error_condition_reported() {
        let mock = MockDevice::new();
        mock.with(|s| s.poll_error = true);
        let wake = WakeSignal::new().unwrap();
        let session = open(&mock, &wake);

        let guard = session.lock().unwrap();
        let (_guard, status) = wait_for_space(&session, guard);
        assert!(matches!(status, Err(WaitError::Device(_))));
    }
}
