use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;

// this will be common for all our sockets
pub fn new_socket(domain: Domain) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // tokio needs the socket non-blocking. No address reuse: a second
    // process on the same port must fail to bind, not steal the traffic.
    socket.set_nonblocking(true)?;

    Ok(socket)
}

/// Bind a UDP socket for receiving instrument data on `port`.
///
/// Must be called from within a tokio runtime.
pub fn create_udp_listen(bind_addr: IpAddr, port: u16) -> io::Result<UdpSocket> {
    let socketaddr = SocketAddr::new(bind_addr, port);
    let socket = new_socket(Domain::for_address(socketaddr))?;

    socket.bind(&socket2::SockAddr::from(socketaddr))?;
    log::trace!("Binding socket to {}", socketaddr);

    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_listen_receives() {
        let socket = create_udp_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let addr = socket.local_addr().unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"$HEHDT,1.0,T", addr).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"$HEHDT,1.0,T");
    }

    #[tokio::test]
    async fn test_second_listener_on_port_fails() {
        let first = create_udp_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(create_udp_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port).is_err());

        // Released once the first socket is gone
        drop(first);
        assert!(create_udp_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port).is_ok());
    }

    #[tokio::test]
    async fn test_port_held_elsewhere_fails() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(create_udp_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port).is_err());
    }
}
