//! Server addresses and the socket wrappers the protocol runs over:
//! TCP host/port, unix-domain socket paths (optionally with owner, group,
//! and umask applied to the socket file), and Linux abstract-namespace
//! names written with a leading '@'.

use crate::error::{Error, Result};
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2972;

/// Sockets that sit idle longer than this mid-command are dropped.
pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub enum SocketAddress {
    Inet {
        host: String,
        port: u16,
    },
    UnixPath {
        path: PathBuf,
        owner: Option<u32>,
        group: Option<u32>,
        umask: Option<u32>,
    },
    #[cfg(target_os = "linux")]
    UnixAbstract {
        name: String,
    },
}

impl SocketAddress {
    pub fn inet<H: Into<String>>(host: H, port: u16) -> SocketAddress {
        SocketAddress::Inet {
            host: host.into(),
            port,
        }
    }

    /// Parse a unix address spec: '@name' is an abstract-namespace name,
    /// anything else a socket file path.
    pub fn parse_unix(spec: &str) -> SocketAddress {
        #[cfg(target_os = "linux")]
        if let Some(name) = spec.strip_prefix('@') {
            return SocketAddress::UnixAbstract {
                name: name.to_string(),
            };
        }
        SocketAddress::UnixPath {
            path: PathBuf::from(spec),
            owner: None,
            group: None,
            umask: None,
        }
    }

    pub fn listen(&self) -> Result<Listener> {
        match self {
            SocketAddress::Inet { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))?;
                Ok(Listener::Tcp(listener))
            }
            SocketAddress::UnixPath {
                path,
                owner,
                group,
                umask,
            } => {
                let old_umask = umask.map(|mask| unsafe { libc::umask(mask as libc::mode_t) });
                let bound = bind_unix_path(path);
                if let Some(old) = old_umask {
                    unsafe { libc::umask(old) };
                }
                let listener = bound?;
                if owner.is_some() || group.is_some() {
                    chown_path(path, *owner, *group)?;
                }
                Ok(Listener::Unix(listener))
            }
            #[cfg(target_os = "linux")]
            SocketAddress::UnixAbstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                Ok(Listener::Unix(UnixListener::bind_addr(&addr)?))
            }
        }
    }

    /// Connect to a server at this address.  Returns None when nothing is
    /// listening there.
    pub fn connect(&self) -> Result<Option<StreamSock>> {
        let sock = match self {
            SocketAddress::Inet { host, port } => {
                match TcpStream::connect((host.as_str(), *port)) {
                    Ok(sock) => StreamSock::Tcp(sock),
                    Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                        return Ok(None);
                    }
                    Err(err) => return Err(Error::Io(err)),
                }
            }
            SocketAddress::UnixPath { path, .. } => match UnixStream::connect(path) {
                Ok(sock) => StreamSock::Unix(sock),
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                    ) =>
                {
                    return Ok(None);
                }
                Err(err) => return Err(Error::Io(err)),
            },
            #[cfg(target_os = "linux")]
            SocketAddress::UnixAbstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                match UnixStream::connect_addr(&addr) {
                    Ok(sock) => StreamSock::Unix(sock),
                    Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                        return Ok(None);
                    }
                    Err(err) => return Err(Error::Io(err)),
                }
            }
        };
        sock.configure()?;
        Ok(Some(sock))
    }

    /// Remove the socket file, if this address created one.
    pub fn cleanup(&self) {
        if let SocketAddress::UnixPath { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketAddress::Inet { host, port } => {
                if host.contains(':') {
                    write!(f, "[{}]:{}", host, port)
                } else {
                    write!(f, "{}:{}", host, port)
                }
            }
            SocketAddress::UnixPath { path, .. } => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            SocketAddress::UnixAbstract { name } => write!(f, "@{}", name),
        }
    }
}

/// Bind a unix socket file, replacing a stale socket left by a dead
/// server, but never one that still answers.
fn bind_unix_path(path: &PathBuf) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            match UnixStream::connect(path) {
                Ok(_) => Err(Error::Io(err)), // a live server owns it
                Err(_) => {
                    std::fs::remove_file(path)?;
                    Ok(UnixListener::bind(path)?)
                }
            }
        }
        Err(err) => Err(Error::Io(err)),
    }
}

fn chown_path(path: &PathBuf, owner: Option<u32>, group: Option<u32>) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Protocol("socket path contains a nul byte".to_string()))?;
    let uid = owner.unwrap_or(u32::MAX) as libc::uid_t;
    let gid = group.unwrap_or(u32::MAX) as libc::gid_t;
    let rc = unsafe { libc::chown(cpath.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub fn accept(&self) -> Result<(StreamSock, String)> {
        let (sock, peer) = match self {
            Listener::Tcp(listener) => {
                let (sock, addr) = listener.accept()?;
                (StreamSock::Tcp(sock), addr.to_string())
            }
            Listener::Unix(listener) => {
                let (sock, _) = listener.accept()?;
                (StreamSock::Unix(sock), "unix".to_string())
            }
        };
        sock.configure()?;
        Ok((sock, peer))
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Unix(listener) => listener.as_raw_fd(),
        }
    }
}

pub enum StreamSock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl StreamSock {
    /// Apply the protocol's socket options: no Nagle delay on TCP, and
    /// read/write timeouts so a stalled peer cannot wedge the server.
    pub fn configure(&self) -> Result<()> {
        match self {
            StreamSock::Tcp(sock) => {
                sock.set_nodelay(true)?;
                sock.set_read_timeout(Some(TIMEOUT))?;
                sock.set_write_timeout(Some(TIMEOUT))?;
            }
            StreamSock::Unix(sock) => {
                sock.set_read_timeout(Some(TIMEOUT))?;
                sock.set_write_timeout(Some(TIMEOUT))?;
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = match self {
            StreamSock::Tcp(sock) => sock.shutdown(std::net::Shutdown::Both),
            StreamSock::Unix(sock) => sock.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl AsRawFd for StreamSock {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            StreamSock::Tcp(sock) => sock.as_raw_fd(),
            StreamSock::Unix(sock) => sock.as_raw_fd(),
        }
    }
}

impl Read for StreamSock {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            StreamSock::Tcp(sock) => sock.read(buf),
            StreamSock::Unix(sock) => sock.read(buf),
        }
    }
}

impl Write for StreamSock {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamSock::Tcp(sock) => sock.write(buf),
            StreamSock::Unix(sock) => sock.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            StreamSock::Tcp(sock) => sock.flush(),
            StreamSock::Unix(sock) => sock.flush(),
        }
    }
}

/// Poll until a server answers at `address`, for tools and tests that
/// spawn a server and need to wait for it to bind.
pub fn wait_for_server(address: &SocketAddress, max_tries: u32, sleep: Duration) -> Result<()> {
    for _ in 0..max_tries {
        if let Some(sock) = address.connect()? {
            drop(sock);
            return Ok(());
        }
        std::thread::sleep(sleep);
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("no server at {}", address),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(SocketAddress::inet("127.0.0.1", 2972).to_string(), "127.0.0.1:2972");
        assert_eq!(SocketAddress::inet("::1", 2972).to_string(), "[::1]:2972");
        assert_eq!(SocketAddress::parse_unix("/tmp/durus.sock").to_string(), "/tmp/durus.sock");
        #[cfg(target_os = "linux")]
        assert_eq!(SocketAddress::parse_unix("@durus").to_string(), "@durus");
    }

    #[test]
    fn connect_to_nothing_returns_none() {
        // A port from the ephemeral range with no listener.
        let address = SocketAddress::inet("127.0.0.1", 1);
        match address.connect() {
            Ok(None) => (),
            // Some systems answer with other errors for privileged ports.
            Ok(Some(_)) | Err(_) => (),
        }
    }

    #[test]
    fn stale_unix_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durus.sock");
        let address = SocketAddress::parse_unix(path.to_str().unwrap());
        {
            let _stale = address.listen().unwrap();
            // Listener dropped; the socket file stays behind.
        }
        assert!(path.exists());
        let _fresh = address.listen().unwrap();
        address.cleanup();
        assert!(!path.exists());
    }
}
