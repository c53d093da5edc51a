use crate::net::addr::{BindAddress, PeerAddress, SocketKind};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::{Path, PathBuf};

/// Removes a stale socket file before bind and removes the path again when
/// the listener goes away.
#[derive(Debug)]
pub struct LocalPathGuard {
    path: PathBuf,
}

impl LocalPathGuard {
    pub fn prepare(path: &Path) -> io::Result<LocalPathGuard> {
        if path.exists() {
            fs::remove_file(path)?;
        }

        Ok(LocalPathGuard {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LocalPathGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Server socket covering the three transports behind one surface: stream
/// listeners accept, datagram listeners read from and write to peers. Every
/// descriptor is non-blocking from creation, datagram listeners included.
pub enum Listener {
    Stream(TcpListener),
    #[cfg(unix)]
    Local(UnixListener, LocalPathGuard),
    Datagram(UdpSocket),
}

impl Listener {
    /// Binds the requested transport. The kernel listen backlog is the
    /// platform default for stream sockets.
    pub fn bind(addr: &BindAddress, kind: SocketKind) -> NetworkResult<Listener> {
        match (addr, kind) {
            (BindAddress::Inet(sockaddr), SocketKind::Stream) => {
                Ok(Listener::Stream(TcpListener::bind(*sockaddr)?))
            }
            (BindAddress::Inet(sockaddr), SocketKind::Datagram) => {
                Ok(Listener::Datagram(UdpSocket::bind(*sockaddr)?))
            }
            #[cfg(unix)]
            (BindAddress::Local(path), SocketKind::Stream) => {
                let guard = LocalPathGuard::prepare(path)?;

                Ok(Listener::Local(UnixListener::bind(path)?, guard))
            }
            (BindAddress::Local(_), _) => Err(NetworkError::Fatal(ErrorType::Unsupported)),
        }
    }

    /// Accepts one pending connection, `Wait` when the backlog is empty.
    pub fn accept(&mut self) -> NetworkResult<(Stream, PeerAddress)> {
        match self {
            Listener::Stream(listener) => {
                let (stream, peer) = listener.accept()?;

                Ok((Stream::Tcp(stream), PeerAddress::Inet(peer)))
            }
            #[cfg(unix)]
            Listener::Local(listener, _) => {
                let (stream, _) = listener.accept()?;

                Ok((Stream::Local(stream), PeerAddress::Local))
            }
            Listener::Datagram(_) => Err(NetworkError::Fatal(ErrorType::Unsupported)),
        }
    }

    /// Reads one datagram, `Wait` when none is queued.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, PeerAddress)> {
        match self {
            Listener::Datagram(socket) => {
                let (count, peer) = socket.recv_from(buf)?;

                Ok((count, PeerAddress::Inet(peer)))
            }
            _ => Err(NetworkError::Fatal(ErrorType::Unsupported)),
        }
    }

    pub fn send_to(&mut self, buf: &[u8], peer: &PeerAddress) -> NetworkResult<usize> {
        match (&*self, peer) {
            (Listener::Datagram(socket), PeerAddress::Inet(addr)) => {
                Ok(socket.send_to(buf, *addr)?)
            }
            _ => Err(NetworkError::Fatal(ErrorType::Unsupported)),
        }
    }

    /// Bound internet address, for listeners bound to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Stream(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Local(..) => None,
            Listener::Datagram(socket) => socket.local_addr().ok(),
        }
    }
}

impl Source for Listener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Stream(listener) => listener.register(registry, token, interests),
            #[cfg(unix)]
            Listener::Local(listener, _) => listener.register(registry, token, interests),
            Listener::Datagram(socket) => socket.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Stream(listener) => listener.reregister(registry, token, interests),
            #[cfg(unix)]
            Listener::Local(listener, _) => listener.reregister(registry, token, interests),
            Listener::Datagram(socket) => socket.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Stream(listener) => listener.deregister(registry),
            #[cfg(unix)]
            Listener::Local(listener, _) => listener.deregister(registry),
            Listener::Datagram(socket) => socket.deregister(registry),
        }
    }
}

/// An accepted stream socket.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Local(UnixStream),
}

impl Stream {
    /// Shuts both directions down. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let _ = match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Local(stream) => stream.shutdown(Shutdown::Both),
        };
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Local(stream) => stream.read(buf),
        }
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Local(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Local(stream) => stream.flush(),
        }
    }
}

impl Source for Stream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.register(registry, token, interests),
            #[cfg(unix)]
            Stream::Local(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.reregister(registry, token, interests),
            #[cfg(unix)]
            Stream::Local(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.deregister(registry),
            #[cfg(unix)]
            Stream::Local(stream) => stream.deregister(registry),
        }
    }
}
