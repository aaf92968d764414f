//! DAP transport abstraction layer.
//! Supports stdio (one connection over process standard streams), TCP and unix domain sockets.

use std::fmt::{Display, Formatter};
use std::io::{self, Read, Stdin, Stdout, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Reading side of a duplex connection.
pub trait ReadHalf: Read + Send {
    /// Stop reading. Pending and future reads observe end of stream.
    fn close(&mut self) -> io::Result<()>;
}

/// Writing side of a duplex connection.
pub trait WriteHalf: Write + Send {
    /// Stop writing, the peer observes end of stream.
    fn close(&mut self) -> io::Result<()>;
}

impl ReadHalf for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Read)
    }
}

impl WriteHalf for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl ReadHalf for UnixStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Read)
    }
}

impl WriteHalf for UnixStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// Stream half that is closed by dropping the underlying handle.
///
/// Closing twice is an error, reads after close return end of stream and writes fail with
/// [`io::ErrorKind::BrokenPipe`].
pub struct Detachable<T> {
    inner: Option<T>,
    lease: Option<Arc<Lease>>,
}

impl<T> Detachable<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Some(inner),
            lease: None,
        }
    }

    fn leased(inner: T, lease: Arc<Lease>) -> Self {
        Self {
            inner: Some(inner),
            lease: Some(lease),
        }
    }

    fn detach(&mut self) -> io::Result<()> {
        self.lease = None;
        match self.inner.take() {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream already closed",
            )),
        }
    }
}

impl<T: Read> Read for Detachable<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(buf),
            None => Ok(0),
        }
    }
}

impl<T: Write> Write for Detachable<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<T: Read + Send> ReadHalf for Detachable<T> {
    fn close(&mut self) -> io::Result<()> {
        self.detach()
    }
}

impl<T: Write + Send> WriteHalf for Detachable<T> {
    fn close(&mut self) -> io::Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner.flush()?;
        }
        self.detach()
    }
}

/// Accepted duplex byte stream.
pub struct Connection {
    /// Human-readable remote address.
    pub peer: String,
    pub reader: Box<dyn ReadHalf>,
    pub writer: Box<dyn WriteHalf>,
}

impl Connection {
    pub fn new(
        peer: impl Into<String>,
        reader: impl ReadHalf + 'static,
        writer: impl WriteHalf + 'static,
    ) -> Self {
        Self {
            peer: peer.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let reader = stream.try_clone()?;
        Ok(Self::new(peer, reader, stream))
    }

    pub fn unix(stream: UnixStream) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".to_string());
        let reader = stream.try_clone()?;
        Ok(Self::new(peer, reader, stream))
    }
}

/// Source of connections.
pub trait Listener: Send + Sync {
    /// Block until a new connection arrives.
    fn accept(&self) -> io::Result<Connection>;

    /// Address this listener is bound to, for diagnostics.
    fn local_addr(&self) -> String;
}

/// Occupancy flag of the stdio pseudo-connection. The connection is released when the
/// last half holding the lease is closed or dropped.
struct Lease {
    busy: Arc<(Mutex<bool>, Condvar)>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let (busy, released) = &*self.busy;
        *busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        released.notify_all();
    }
}

/// Pseudo-listener over the process standard input/output.
///
/// Hands out one connection at a time, `accept` blocks until the previous one is released.
#[derive(Default)]
pub struct StdioListener {
    busy: Arc<(Mutex<bool>, Condvar)>,
}

impl StdioListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Listener for StdioListener {
    fn accept(&self) -> io::Result<Connection> {
        let (busy, released) = &*self.busy;
        let mut busy = busy.lock().unwrap_or_else(PoisonError::into_inner);
        while *busy {
            busy = released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *busy = true;

        let lease = Arc::new(Lease {
            busy: self.busy.clone(),
        });
        Ok(Connection::new(
            "stdio",
            Detachable::<Stdin>::leased(io::stdin(), lease.clone()),
            Detachable::<Stdout>::leased(io::stdout(), lease),
        ))
    }

    fn local_addr(&self) -> String {
        "stdio".to_string()
    }
}

pub struct TcpListener {
    inner: std::net::TcpListener,
}

impl TcpListener {
    pub fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self {
            inner: std::net::TcpListener::bind(addr)?,
        })
    }
}

impl Listener for TcpListener {
    fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.inner.accept()?;
        Connection::tcp(stream)
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|addr| format!("tcp://{addr}"))
            .unwrap_or_else(|_| "tcp://?".to_string())
    }
}

/// Unix domain socket listener. Socket file is removed before bind and when listener dropped.
pub struct UnixListener {
    inner: std::os::unix::net::UnixListener,
    path: PathBuf,
}

impl UnixListener {
    pub fn bind(path: &Path) -> io::Result<Self> {
        remove_stale_socket(path)?;
        Ok(Self {
            inner: std::os::unix::net::UnixListener::bind(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Listener for UnixListener {
    fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.inner.accept()?;
        Connection::unix(stream)
    }

    fn local_addr(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        _ = crate::muted_error!(remove_stale_socket(&self.path), "remove socket file:");
    }
}

/// Remove a socket file left by a previous run. Missing file is not an error.
pub fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AddressError {
    #[error("unsupported listen address {0:?}, expected `stdio`, `tcp://host:port` or `unix:///path`")]
    UnknownScheme(String),
    #[error("empty {0} address")]
    Empty(&'static str),
}

/// Scheme-qualified listen address.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenAddr {
    Stdio,
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "stdio" {
            return Ok(ListenAddr::Stdio);
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(AddressError::Empty("tcp"));
            }
            return Ok(ListenAddr::Tcp(addr.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(AddressError::Empty("unix"));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        Err(AddressError::UnknownScheme(s.to_string()))
    }
}

impl Display for ListenAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Stdio => f.write_str("stdio"),
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl ListenAddr {
    /// Create a listener for this address.
    pub fn bind(&self) -> io::Result<Box<dyn Listener>> {
        Ok(match self {
            ListenAddr::Stdio => Box::new(StdioListener::new()),
            ListenAddr::Tcp(addr) => Box::new(TcpListener::bind(addr)?),
            ListenAddr::Unix(path) => Box::new(UnixListener::bind(path)?),
        })
    }
}
