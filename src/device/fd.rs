//! File-descriptor backed device
//!
//! Mobile hosts create the tun interface themselves and hand over its file
//! descriptor. The descriptor is switched to non-blocking mode and
//! registered with the tokio reactor, so reads and writes never occupy a
//! blocking-pool thread and `close` can interrupt a pending read.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::debug;

use super::VirtualInterface;

/// Owns the descriptor; closing happens on drop
struct FdWrapper(OwnedFd);

impl AsRawFd for FdWrapper {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Tun device adopted from a raw file descriptor
pub struct FdDevice {
    fd: RawFd,
    /// Taken on close. In-flight operations hold a clone, so the descriptor
    /// is closed once the last of them returns.
    io: Mutex<Option<Arc<AsyncFd<FdWrapper>>>>,
    closed: watch::Sender<bool>,
}

impl FdDevice {
    /// Adopt `fd`. Must be called from within a tokio runtime.
    ///
    /// # Safety
    ///
    /// `fd` must be an open tun descriptor that nothing else will close; the
    /// device takes ownership of it.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        let owned = OwnedFd::from_raw_fd(fd);
        set_nonblocking(fd)?;
        let io = AsyncFd::new(FdWrapper(owned))?;
        let (closed, _) = watch::channel(false);
        debug!("[Device] Adopted tun fd {}", fd);
        Ok(Self {
            fd,
            io: Mutex::new(Some(Arc::new(io))),
            closed,
        })
    }

    fn handle(&self) -> io::Result<Arc<AsyncFd<FdWrapper>>> {
        self.io.lock().clone().ok_or_else(closed_error)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device closed")
}

async fn read_packet(io: &AsyncFd<FdWrapper>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = io.readable().await?;
        match guard.try_io(|inner| fd_read(inner.get_ref().as_raw_fd(), &mut *buf)) {
            Ok(Ok(0)) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tun closed")),
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_packet(io: &AsyncFd<FdWrapper>, packet: &[u8]) -> io::Result<()> {
    loop {
        let mut guard = io.writable().await?;
        match guard.try_io(|inner| fd_write(inner.get_ref().as_raw_fd(), packet)) {
            Ok(Ok(n)) if n == packet.len() => return Ok(()),
            // A tun write is all or nothing
            Ok(Ok(n)) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short tun write: {}/{} bytes", n, packet.len()),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

/// Reads from a file descriptor into `buf`, returning number of bytes read.
fn fd_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: reading into our buffer from a valid fd.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Writes data to a file descriptor, returning bytes written.
fn fd_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: writing from our buffer to a valid fd.
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl VirtualInterface for FdDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        let io = self.handle()?;
        tokio::select! {
            result = read_packet(&io, buf) => result,
            _ = closed.changed() => Err(closed_error()),
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        let io = self.handle()?;
        tokio::select! {
            result = write_packet(&io, packet) => result,
            _ = closed.changed() => Err(closed_error()),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Wakes pending operations; their clones go as they return
        drop(self.io.lock().take());
        debug!("[Device] Closed tun fd {}", self.fd);
    }

    fn name(&self) -> &str {
        "tun"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::time::Duration;

    /// Creates a SOCK_DGRAM socketpair; one datagram stands in for one packet
    fn socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds: [i32; 2] = [0; 2];
        // SAFETY: valid pointer to 2-element array.
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "socketpair() failed");
        // SAFETY: fds are valid file descriptors from socketpair.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn device() -> (FdDevice, OwnedFd) {
        let (tun, peer) = socketpair();
        // SAFETY: ownership of the descriptor moves into the device
        let device = unsafe { FdDevice::from_raw_fd(tun.into_raw_fd()) }.unwrap();
        (device, peer)
    }

    #[tokio::test]
    async fn test_read_write_packets() {
        let (device, peer) = device();

        let sent = b"one packet";
        assert_eq!(fd_write(peer.as_raw_fd(), sent).unwrap(), sent.len());
        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], sent);

        device.write(b"reply").await.unwrap();
        let n = fd_read(peer.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (device, _peer) = device();
        let device = Arc::new(device);

        let reader = {
            let device = device.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                device.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        device.close().await;
        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read still pending after close")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_closed_device_releases_descriptor() {
        let (device, peer) = device();
        device.close().await;
        device.close().await;

        let mut buf = [0u8; 16];
        assert!(device.read(&mut buf).await.is_err());
        assert!(device.write(b"late").await.is_err());

        // With the tun end gone the peer can no longer send to it
        assert!(fd_write(peer.as_raw_fd(), b"nobody home").is_err());
    }
}
