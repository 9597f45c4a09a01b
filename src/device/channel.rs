//! In-memory packet device
//!
//! Lets an embedder (or a test) feed packets into the tunnel and collect
//! what it writes back, without a kernel interface.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use super::VirtualInterface;

/// Device side of an in-memory interface
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<io::Result<Bytes>>>,
    outbound: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
    close_flag: Arc<AtomicBool>,
}

/// Host side of an in-memory interface
pub struct DeviceHandle {
    inbound: mpsc::Sender<io::Result<Bytes>>,
    outbound: mpsc::Receiver<Bytes>,
    close_flag: Arc<AtomicBool>,
}

impl ChannelDevice {
    /// Create a connected device/handle pair with `capacity` packets of
    /// buffering in each direction
    pub fn pair(capacity: usize) -> (ChannelDevice, DeviceHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let close_flag = Arc::new(AtomicBool::new(false));
        (
            ChannelDevice {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
                closed,
                close_flag: close_flag.clone(),
            },
            DeviceHandle {
                inbound: in_tx,
                outbound: out_rx,
                close_flag,
            },
        )
    }
}

#[async_trait]
impl VirtualInterface for ChannelDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        let mut inbound = self.inbound.lock().await;
        let next = tokio::select! {
            next = inbound.recv() => next,
            _ = closed.changed() => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
            }
        };
        match next {
            Some(Ok(packet)) => {
                if packet.len() > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "packet larger than read buffer",
                    ));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device handle dropped",
            )),
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        if self.close_flag.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device handle dropped"))
    }

    async fn close(&self) {
        self.close_flag.store(true, Ordering::Release);
        self.closed.send_replace(true);
    }

    fn name(&self) -> &str {
        "channel"
    }
}

impl DeviceHandle {
    /// Hand a packet to the tunnel as if the host had routed it in
    pub async fn inject(&self, packet: Bytes) -> bool {
        self.inbound.send(Ok(packet)).await.is_ok()
    }

    /// Make the next device read fail with `error`
    pub async fn inject_error(&self, error: io::Error) -> bool {
        self.inbound.send(Err(error)).await.is_ok()
    }

    /// Next packet the tunnel wrote to the device
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// A written packet, if one is ready
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    /// Whether the tunnel closed the device
    pub fn is_closed(&self) -> bool {
        self.close_flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_and_collect() {
        let (device, mut handle) = ChannelDevice::pair(8);
        assert!(handle.inject(Bytes::from_static(b"\x45abc")).await);

        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x45abc");

        device.write(b"reply").await.unwrap();
        assert_eq!(handle.recv().await.unwrap(), Bytes::from_static(b"reply"));
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_injected_error_surfaces() {
        let (device, handle) = ChannelDevice::pair(8);
        handle
            .inject_error(io::Error::new(io::ErrorKind::Other, "tun gone"))
            .await;
        let mut buf = [0u8; 64];
        let err = device.read(&mut buf).await.unwrap_err();
        assert_eq!(err.to_string(), "tun gone");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (device, handle) = ChannelDevice::pair(8);
        let device = Arc::new(device);

        let reader = {
            let device = device.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                device.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        device.close().await;

        assert!(reader.await.unwrap().is_err());
        assert!(handle.is_closed());
        assert!(device.write(b"late").await.is_err());
    }
}
