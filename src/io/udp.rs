// UDP socket adapter: bind, readiness wait, datagram send/recv.
// Numan Thabit 2025

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

const DEFAULT_BUFFER_BYTES: usize = 1 << 20;

/// Socket options applied at open time.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub bind: SocketAddr,
    pub recv_buffer_bytes: usize,
    pub send_buffer_bytes: usize,
    pub reuse_address: bool,
}

impl UdpConfig {
    pub fn bind_to(bind: SocketAddr) -> Self {
        Self {
            bind,
            recv_buffer_bytes: DEFAULT_BUFFER_BYTES,
            send_buffer_bytes: DEFAULT_BUFFER_BYTES,
            reuse_address: true,
        }
    }
}

/// Non-blocking UDP socket with an explicit readiness wait.
///
/// This is the session's only suspension point: `poll_recv` blocks inside
/// poll(2) for at most the given timeout, then drains without blocking.
#[derive(Debug)]
pub struct UdpSocket {
    inner: StdUdpSocket,
}

impl UdpSocket {
    pub fn open(config: &UdpConfig) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(config.bind),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(config.reuse_address)?;
        socket.set_recv_buffer_size(config.recv_buffer_bytes)?;
        socket.set_send_buffer_size(config.send_buffer_bytes)?;
        socket.bind(&config.bind.into())?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            inner: socket.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, addr)
    }

    /// Receives one datagram, waiting up to `timeout_ms` for readiness.
    ///
    /// Returns `Ok(None)` when nothing arrived within the timeout.
    pub fn poll_recv(
        &self,
        buf: &mut [u8],
        timeout_ms: u64,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inner.recv_from(buf) {
            Ok((len, from)) => return Ok(Some((len, from))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        if timeout_ms == 0 || !self.wait_readable(timeout_ms)? {
            return Ok(None);
        }

        match self.inner.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Non-blocking receive for draining after the first datagram.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inner.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[cfg(unix)]
    fn wait_readable(&self, timeout_ms: u64) -> io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut fds = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;

        loop {
            let rc = unsafe { libc::poll(&mut fds, 1, timeout) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0 && fds.revents & libc::POLLIN != 0);
        }
    }

    #[cfg(not(unix))]
    fn wait_readable(&self, timeout_ms: u64) -> io::Result<bool> {
        use std::time::Duration;

        // No portable poll(2); fall back to a bounded blocking read window.
        self.inner
            .set_read_timeout(Some(Duration::from_millis(timeout_ms.max(1))))?;
        self.inner.set_nonblocking(false)?;
        let mut probe = [0u8; 1];
        let result = self.inner.peek_from(&mut probe);
        self.inner.set_nonblocking(true)?;
        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

/// Resolves `host:port` to the first usable socket address.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_socket() -> UdpSocket {
        let config = UdpConfig::bind_to("127.0.0.1:0".parse().unwrap());
        UdpSocket::open(&config).expect("open socket")
    }

    #[test]
    fn send_and_poll_recv() {
        let a = loopback_socket();
        let b = loopback_socket();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"ping", b_addr).unwrap();

        let mut buf = [0u8; 64];
        let received = b.poll_recv(&mut buf, 1000).unwrap();
        let (len, from) = received.expect("datagram arrives");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn poll_recv_times_out_empty() {
        let socket = loopback_socket();
        let mut buf = [0u8; 64];
        assert!(socket.poll_recv(&mut buf, 10).unwrap().is_none());
        assert!(socket.poll_recv(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn try_recv_drains_without_blocking() {
        let a = loopback_socket();
        let b = loopback_socket();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"one", b_addr).unwrap();
        a.send_to(b"two", b_addr).unwrap();

        let mut buf = [0u8; 64];
        // First datagram may need the readiness wait.
        assert!(b.poll_recv(&mut buf, 1000).unwrap().is_some());
        // The second is already queued.
        let mut drained = false;
        for _ in 0..100 {
            if b.try_recv(&mut buf).unwrap().is_some() {
                drained = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(drained);
    }

    #[test]
    fn resolve_loopback() {
        let addr = resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(addr.port(), 9000);
    }
}
