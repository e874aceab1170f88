//! Tunnel device I/O
//!
//! [`TunDevice`] registers the platform's tunnel descriptor with the
//! reactor in non-blocking mode, so no read or write ever parks a runtime
//! thread. Every synthesized datagram goes through one [`TunWriter`],
//! which holds a single async mutex around the device handle so datagrams
//! from the packet loop and from every downlink task are never interleaved.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::stats::EngineStats;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable single-writer handle to the tunnel device
#[derive(Clone)]
pub struct TunWriter {
    inner: Arc<Mutex<BoxedWriter>>,
    stats: Arc<EngineStats>,
}

impl TunWriter {
    pub fn new<W>(writer: W, stats: Arc<EngineStats>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            stats,
        }
    }

    /// Write one complete datagram. The device sees no framing, so the
    /// datagram must go out in a single write under the lock.
    pub async fn write_datagram(&self, datagram: &[u8]) -> io::Result<()> {
        let mut device = self.inner.lock().await;
        device.write_all(datagram).await?;
        device.flush().await?;
        drop(device);

        self.stats.record_injected(datagram.len());
        Ok(())
    }
}

impl std::fmt::Debug for TunWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunWriter").finish_non_exhaustive()
    }
}

#[cfg(unix)]
pub use self::device::{DeviceReader, DeviceWriter, TunDevice};

#[cfg(unix)]
mod device {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::OwnedFd;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{ready, Context, Poll};

    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Tunnel descriptor driven by readiness events
    pub struct TunDevice {
        fd: Arc<AsyncFd<File>>,
    }

    impl TunDevice {
        /// Take ownership of `fd`, switch it to non-blocking mode and
        /// register it with the current runtime
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            socket2::SockRef::from(&fd).set_nonblocking(true)?;
            Ok(Self {
                fd: Arc::new(AsyncFd::new(File::from(fd))?),
            })
        }

        /// Read and write halves sharing the registration
        pub fn split(self) -> (DeviceReader, DeviceWriter) {
            (DeviceReader { fd: self.fd.clone() }, DeviceWriter { fd: self.fd })
        }
    }

    /// Reading half; one read returns one datagram
    pub struct DeviceReader {
        fd: Arc<AsyncFd<File>>,
    }

    /// Writing half; one write carries one datagram
    pub struct DeviceWriter {
        fd: Arc<AsyncFd<File>>,
    }

    impl AsyncRead for DeviceReader {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.read(unfilled)
                }) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    // Readiness was stale
                    Err(_) => continue,
                }
            }
        }
    }

    impl AsyncWrite for DeviceWriter {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = ready!(self.fd.poll_write_ready(cx))?;
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.write(buf)
                }) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_) => continue,
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::read_datagram;
    use super::*;
    use crate::packet::build;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn test_concurrent_writes_stay_whole() {
        let stats = Arc::new(EngineStats::default());
        let (device, mut host) = tokio::io::duplex(1 << 20);
        let writer = TunWriter::new(device, stats.clone());

        let mut tasks = Vec::new();
        for i in 0..8u16 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let src = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
                let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000 + i);
                let payload = vec![i as u8; 100 + i as usize * 50];
                for _ in 0..16 {
                    writer.write_datagram(&build::udp_datagram(src, dst, &payload)).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        for _ in 0..128 {
            let pkt = read_datagram(&mut host).await.unwrap();
            let parsed = crate::packet::parse(&pkt, pkt.len()).unwrap();
            let i = parsed.key.dst_port - 40000;
            assert_eq!(parsed.payload_len, 100 + i as usize * 50);
            assert!(parsed.payload(&pkt).iter().all(|b| *b == i as u8));
        }
        assert_eq!(stats.snapshot().packets_injected, 128);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_device_round_trip() {
        use std::io::{Read, Write};
        use std::os::unix::net::UnixStream;

        let (device, mut peer) = UnixStream::pair().unwrap();
        let (mut reader, writer) = TunDevice::new(device.into()).unwrap().split();
        let stats = Arc::new(EngineStats::default());
        let writer = TunWriter::new(writer, stats.clone());

        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000);
        let dst = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        let outbound = build::udp_datagram(src, dst, b"query");
        peer.write_all(&outbound).unwrap();
        assert_eq!(read_datagram(&mut reader).await.unwrap(), outbound);

        let inbound = build::udp_datagram(dst, src, b"answer");
        writer.write_datagram(&inbound).await.unwrap();
        let mut got = vec![0u8; inbound.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, inbound);
        assert_eq!(stats.snapshot().packets_injected, 1);
    }
}
