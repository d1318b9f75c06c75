use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// Connection oriented byte stream endpoint a handler can own.
///
/// The framework performs no parsing of the stream; it only needs the
/// adoption steps for an accepted or freshly connected Tcp socket plus the
/// byte stream traits. Plaintext Tcp adopts the socket as is; a Tls
/// transport would run its handshake inside `accept`/`connect`.
#[allow(async_fn_in_trait)]
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Sized + 'static {
    /// Adopt a socket produced by an acceptor.
    async fn accept(io: TcpStream) -> io::Result<Self>;

    /// Adopt a socket produced by an outbound connect.
    async fn connect(io: TcpStream) -> io::Result<Self>;
}

impl Transport for TcpStream {
    async fn accept(io: TcpStream) -> io::Result<Self> {
        Ok(io)
    }

    async fn connect(io: TcpStream) -> io::Result<Self> {
        Ok(io)
    }
}

/// Build a listening socket for one acceptor.
///
/// Every acceptor of a server binds the same endpoint, so the socket takes
/// both `SO_REUSEADDR` and (on unix) `SO_REUSEPORT`; the kernel then load
/// balances incoming connections across the accept executors.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as _)?;

    Ok(socket.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reuse_bind() {
        let addr = "127.0.0.1:18070".parse().unwrap();

        let a = bind_listener(addr, 16).unwrap();
        // A second listener on the same endpoint must succeed so one
        // acceptor per accept executor can share it.
        let b = bind_listener(addr, 16).unwrap();

        assert_eq!(a.local_addr().unwrap(), b.local_addr().unwrap());
    }

    #[test]
    fn bad_endpoint() {
        // Binding a foreign address must fail and propagate.
        let addr = "8.8.8.8:18071".parse().unwrap();
        assert!(bind_listener(addr, 16).is_err());
    }
}
