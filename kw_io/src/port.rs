use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

/// Ask the OS for a free loopback port and release it.
///
/// The port may in principle be taken by someone else before the package
/// under test binds it; a scenario that loses that race fails its probe.
pub fn reserve_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Whether `port` can be bound on the loopback interface right now.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}
