use crate::error::{Error, Result};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn,
};
use std::net::{SocketAddrV4, TcpListener};
use std::os::fd::AsRawFd;

/// Create a listening IPv4 TCP socket with an explicit backlog.
///
/// `std::net::TcpListener::bind` does not expose the backlog, so the socket is
/// built step by step. Every failure here is fatal to startup; the partially
/// set up descriptor is closed on the way out. The returned listener is
/// non-blocking.
pub fn bind_listener(addr: SocketAddrV4, backlog: u32) -> Result<TcpListener> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(Error::SocketCreate)?;

    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(Error::SocketCreate)?;

    bind(fd.as_raw_fd(), &SockaddrIn::from(addr)).map_err(|source| Error::Bind { addr, source })?;

    let backlog = Backlog::new(i32::try_from(backlog).unwrap_or(i32::MAX)).map_err(Error::Listen)?;
    listen(&fd, backlog).map_err(Error::Listen)?;

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpStream};

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn binds_ephemeral_port_and_accepts() {
        let listener = bind_listener(loopback(0), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let _client = TcpStream::connect(addr).unwrap();
        // Non-blocking listener: the connection may need a moment to be queued
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn port_in_use_is_a_bind_error() {
        let first = bind_listener(loopback(0), 16).unwrap();
        let port = first.local_addr().unwrap().port();

        // SO_REUSEADDR does not allow two listeners on the same port
        let err = bind_listener(loopback(port), 16).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }), "{err}");
        assert!(err.is_infrastructure());
    }

    #[test]
    fn listener_is_non_blocking() {
        let listener = bind_listener(loopback(0), 4).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
