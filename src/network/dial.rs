//! Outbound connect
//!
//! A connect that another thread can abort. The socket being connected is
//! kept where `cancel` can reach it and shut it down, which ends the attempt
//! at once instead of after the OS connect timeout.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

pub(crate) struct Dialer {
    /// Clone of the socket currently connecting
    current: Mutex<Option<Socket>>,
    cancelled: AtomicBool,
}

impl Dialer {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Connect to the first resolved address that accepts within `timeout`
    pub(crate) fn connect(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        let timeout = timeout.max(Duration::from_millis(1));
        let mut last_error = None;

        for target in addr.to_socket_addrs()? {
            match self.connect_one(target, timeout) {
                Ok(stream) => return Ok(stream),
                Err(_) if self.is_cancelled() => return Err(cancelled()),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{addr} resolved to no address"))
        }))
    }

    fn connect_one(&self, target: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
        {
            let mut current = self.current.lock();
            if self.is_cancelled() {
                return Err(cancelled());
            }
            *current = Some(socket.try_clone()?);
        }

        let result = socket.connect_timeout(&SockAddr::from(target), timeout);
        self.current.lock().take();
        result?;

        // A cancel that raced with a successful connect still wins
        if self.is_cancelled() {
            return Err(cancelled());
        }
        Ok(TcpStream::from(socket))
    }

    /// Abort the connect in progress, if any, and refuse every later one
    pub(crate) fn cancel(&self) {
        let current = {
            let mut current = self.current.lock();
            self.cancelled.store(true, Ordering::Release);
            current.take()
        };
        if let Some(socket) = current {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")
}
