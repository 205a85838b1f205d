use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};
use crate::error::{Result, SessionError};

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O
///  part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, payload: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSender for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, payload: &[u8]) -> io::Result<usize> {
        trace!("UDP socket: sending {} bytes to {:?}", payload.len(), to);
        self.send_to(payload, to).await
    }
}

struct Sockets {
    receive_socket: Arc<UdpSocket>,
    sender: Arc<dyn DatagramSender>,
}

/// A bound local UDP port. All datagrams are received through a single socket; sending goes
///  through the same socket unless a separate send socket was requested.
pub struct LocalEndpoint {
    local_addr: SocketAddr,
    /// `None` after the endpoint was closed
    sockets: Mutex<Option<Sockets>>,
}

impl LocalEndpoint {
    pub async fn bind(addr: SocketAddr, separate_send_socket: bool) -> Result<Arc<LocalEndpoint>> {
        let receive_socket = Arc::new(Self::bind_socket(addr)?);
        let local_addr = receive_socket.local_addr()
            .map_err(|source| SessionError::Bind { addr, source })?;
        info!("bound receive socket to {:?}", local_addr);

        let sender: Arc<dyn DatagramSender> = if separate_send_socket {
            let send_addr = if local_addr.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            }
            else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };
            let send_socket = Self::bind_socket(send_addr)?;
            debug!("separate send socket for {:?} bound to {:?}", local_addr, send_socket.local_addr().ok());
            Arc::new(send_socket)
        }
        else {
            receive_socket.clone()
        };

        Ok(Arc::new(LocalEndpoint {
            local_addr,
            sockets: Mutex::new(Some(Sockets { receive_socket, sender })),
        }))
    }

    #[cfg(test)]
    pub(crate) async fn with_sender(sender: Arc<dyn DatagramSender>) -> Arc<LocalEndpoint> {
        let receive_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(LocalEndpoint {
            local_addr: receive_socket.local_addr().unwrap(),
            sockets: Mutex::new(Some(Sockets { receive_socket, sender })),
        })
    }

    fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
        let bind_err = |source| SessionError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;
        if addr.port() != 0 {
            // allow quick re-binding of well-known ports after a restart
            socket.set_reuse_address(true).map_err(bind_err)?;
        }
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;

        UdpSocket::from_std(socket.into())
            .map_err(|e| SessionError::Multiplexer(format!("registering socket bound to {:?}: {}", addr, e)))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn sockets(&self) -> MutexGuard<'_, Option<Sockets>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.sockets().is_none()
    }

    /// Releases the sockets, so the port can be bound again. Closing is one way: all later
    ///  sends fail.
    pub fn close(&self) {
        if self.sockets().take().is_some() {
            debug!("closed local endpoint {:?}", self.local_addr);
        }
    }

    pub async fn send_to(&self, to: SocketAddr, payload: &[u8]) -> Result<()> {
        let sender = self.sockets().as_ref()
            .map(|sockets| sockets.sender.clone())
            .ok_or(SessionError::EndpointClosed)?;
        sender.send_datagram(to, payload).await
            .map_err(|source| SessionError::Send { to, source })?;
        Ok(())
    }

    pub(crate) fn poll_recv_from(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<SocketAddr>> {
        match self.sockets().as_ref() {
            Some(sockets) => sockets.receive_socket.poll_recv_from(cx, buf),
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "local endpoint is closed"))),
        }
    }
}
