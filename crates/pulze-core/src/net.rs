//! Socket setup for the telemetry receiver.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::error::{Error, Result};

/// Bind the inbound telemetry socket.
///
/// Address reuse is enabled before binding so a restarted receiver can take
/// the port back immediately. Broadcast reception is enabled and the
/// multicast group (if any) is joined. The read timeout is left to
/// [`ReceiverLoop::with_socket`](crate::receiver::ReceiverLoop::with_socket).
pub fn bind_telemetry_socket(config: &ReceiverConfig) -> Result<UdpSocket> {
    let socket = bind_reusable(config.bind)?;

    socket
        .set_broadcast(true)
        .map_err(|source| Error::SocketOption {
            option: "SO_BROADCAST",
            source,
        })?;

    if let Some(group) = config.multicast_group {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|source| Error::Multicast { group, source })?;
        info!(%group, "joined multicast group");
    }

    Ok(socket)
}

fn bind_reusable(addr: SocketAddr) -> Result<UdpSocket> {
    match addr {
        #[cfg(target_os = "linux")]
        SocketAddr::V4(v4) => bind_reuse_v4(v4),
        _ => {
            warn!(%addr, "address reuse unavailable for this socket, binding plainly");
            UdpSocket::bind(addr).map_err(|source| Error::Bind { addr, source })
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_reuse_v4(addr: std::net::SocketAddrV4) -> Result<UdpSocket> {
    use std::os::fd::FromRawFd;

    let bind_err = |source: io::Error| Error::Bind {
        addr: SocketAddr::V4(addr),
        source,
    };

    // SAFETY: the descriptor comes straight from socket(2) and is handed to
    // UdpSocket immediately, which closes it on every early return below.
    let socket = unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }
        UdpSocket::from_raw_fd(fd)
    };

    set_reuse_addr(&socket).map_err(|source| Error::SocketOption {
        option: "SO_REUSEADDR",
        source,
    })?;

    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    };

    {
        use std::os::fd::AsRawFd;
        // SAFETY: `sin` is a fully initialised sockaddr_in and the length
        // passed matches its size.
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }
    }

    debug!(%addr, "bound telemetry socket with SO_REUSEADDR");
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_reuse_addr(socket: &UdpSocket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let one: libc::c_int = 1;
    // SAFETY: valid descriptor, pointer and length describe a live c_int.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
