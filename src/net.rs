//! Socket helpers shared by every listener in the crate

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Listen backlog for all servers
const LISTEN_BACKLOG: u32 = 128;

/// Bind a listener with `SO_REUSEADDR` set
///
/// Workers are frequently restarted by an external supervisor; address reuse
/// lets them rebind while old connections sit in `TIME_WAIT`.
pub fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Apply per-connection socket options
pub fn configure_stream(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    if nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(())
}
