//! TCP connection and single-client server socket.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use cfg_if::cfg_if;

use crate::error::{Error, Result};

/// Observer notified on every block of bytes crossing the socket. The
/// notification happens strictly before control returns to the caller that
/// triggered the transfer. Observers must not fail.
pub trait SocketObserver {
    fn on_block_written(&mut self, length: usize);
    fn on_block_read(&mut self, length: usize);
}

/// The endpoint is shared between the main flow, the handshake driver and
/// the TLS backend; everything runs on one thread.
pub type SharedTcpConnection = Rc<RefCell<TcpConnection>>;

pub struct TcpConnection {
    stream: Option<TcpStream>,
    closed_by_error: bool,
    closed_latch: bool,
    observers: Vec<Box<dyn SocketObserver>>,
}

cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, RawFd};

        fn bytes_available(stream: &TcpStream) -> usize {
            let mut count: libc::c_int = 0;
            let result = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD, &mut count) };
            if result == 0 && count > 0 {
                count as usize
            } else {
                0
            }
        }
    } else {
        fn bytes_available(stream: &TcpStream) -> usize {
            // Best effort without FIONREAD: a non-blocking peek.
            let mut buffer = [0u8; 4096];
            if stream.set_nonblocking(true).is_err() {
                return 0;
            }
            let available = match stream.peek(&mut buffer) {
                Ok(n) => n,
                Err(_) => 0,
            };
            let _ = stream.set_nonblocking(false);
            available
        }
    }
}

impl TcpConnection {
    pub fn new() -> TcpConnection {
        TcpConnection {
            stream: None,
            closed_by_error: false,
            closed_latch: false,
            observers: Vec::new(),
        }
    }

    pub fn shared() -> SharedTcpConnection {
        Rc::new(RefCell::new(TcpConnection::new()))
    }

    /// Resolve and connect; enables TCP_NODELAY.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let addresses = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Network(format!("resolving {} failed: {}", host, e)))?;
        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(address) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| Error::Network(format!("setting TCP_NODELAY failed: {}", e)))?;
                    self.stream = Some(stream);
                    self.closed_by_error = false;
                    self.closed_latch = false;
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(Error::Network(match last_error {
            Some(e) => format!("connecting to {}:{} failed: {}", host, port, e),
            None => format!("no address found for {}", host),
        }))
    }

    /// Take over an accepted server-side connection.
    pub fn adopt(&mut self, stream: TcpStream) -> Result<()> {
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Network(format!("setting TCP_NODELAY failed: {}", e)))?;
        self.stream = Some(stream);
        self.closed_by_error = false;
        self.closed_latch = false;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn close(&mut self) -> Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::Network("no open connection".to_string()))?;
        stream
            .shutdown(std::net::Shutdown::Both)
            .map_err(|e| Error::Network(format!("closing the connection failed: {}", e)))?;
        Ok(())
    }

    fn note_io_error(&mut self, error: &std::io::Error) {
        if matches!(
            error.kind(),
            ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
        ) {
            self.closed_by_error = true;
        }
    }

    /// Blocking full write. Observers see the block before this returns.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Network("no open connection".to_string()))?;
        if let Err(e) = stream.write_all(data) {
            self.note_io_error(&e);
            return Err(Error::Network(format!("writing to socket failed: {}", e)));
        }
        for observer in self.observers.iter_mut() {
            observer.on_block_written(data.len());
        }
        Ok(data.len())
    }

    /// Blocking read of exactly `length` bytes.
    pub fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Network("no open connection".to_string()))?;
        let mut buffer = vec![0u8; length];
        if let Err(e) = stream.read_exact(&mut buffer) {
            self.note_io_error(&e);
            return Err(Error::Network(format!("reading from socket failed: {}", e)));
        }
        for observer in self.observers.iter_mut() {
            observer.on_block_read(buffer.len());
        }
        Ok(buffer)
    }

    /// Number of bytes currently buffered for reading, without blocking.
    pub fn available(&self) -> usize {
        match &self.stream {
            Some(stream) => bytes_available(stream),
            None => 0,
        }
    }

    /// Probe whether the connection is closed. Runs one or two probe quanta;
    /// two are needed to tell "data incoming in fragments" from "peer
    /// closed" on kernels that deliver the FIN late. The result latches:
    /// once an established connection reports closed, it stays closed.
    pub fn is_closed(&mut self, poll_once: bool) -> bool {
        if self.closed_latch || self.closed_by_error {
            self.closed_latch = true;
            return true;
        }
        let stream = match &self.stream {
            Some(stream) => stream,
            // Never connected; nothing to latch.
            None => return true,
        };
        if stream.peer_addr().is_err() {
            self.closed_latch = true;
            return true;
        }
        let mut closed = false;
        if stream.set_nonblocking(true).is_ok() {
            let quanta = if poll_once { 1 } else { 2 };
            let mut byte = [0u8; 1];
            for _ in 0..quanta {
                match stream.peek(&mut byte) {
                    // Readable with zero available: the FIN signal.
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(_) => break,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
            let _ = stream.set_nonblocking(false);
        } else {
            closed = true;
        }
        if closed {
            self.closed_latch = true;
        }
        closed
    }

    pub fn remote_ip_address(&self) -> Option<String> {
        self.stream
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .map(|addr| addr.ip().to_string())
    }

    pub fn remote_tcp_port(&self) -> Option<u16> {
        self.stream
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .map(|addr| addr.port())
    }

    /// Observers are invoked in registration order.
    pub fn register_observer(&mut self, observer: Box<dyn SocketObserver>) {
        self.observers.push(observer);
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        TcpConnection::new()
    }
}

/// Accepting listener working with a single client connection.
pub struct TcpServer {
    listener: Option<TcpListener>,
    client: SharedTcpConnection,
}

impl TcpServer {
    pub fn new() -> TcpServer {
        TcpServer {
            listener: None,
            client: TcpConnection::shared(),
        }
    }

    pub fn listen(&mut self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Network(format!("listening on port {} failed: {}", port, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Network(format!("configuring the listener failed: {}", e)))?;
        self.listener = Some(listener);
        Ok(())
    }

    /// One I/O quantum: try to accept a pending connection.
    pub fn work(&mut self) {
        if self.client.borrow().is_open() {
            return;
        }
        let accepted = match &self.listener {
            Some(listener) => match listener.accept() {
                Ok((stream, _)) => Some(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => None,
                Err(_) => None,
            },
            None => None,
        };
        if let Some(stream) = accepted {
            let _ = self.client.borrow_mut().adopt(stream);
        }
        // Yield briefly so the accept loop does not spin hot.
        std::thread::sleep(Duration::from_millis(5));
    }

    /// Stop listening; the accepted client connection stays usable.
    pub fn close(&mut self) {
        self.listener = None;
    }

    pub fn client(&self) -> SharedTcpConnection {
        self.client.clone()
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        TcpServer::new()
    }
}
