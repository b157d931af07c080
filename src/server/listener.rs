/*!
 * Listen Sockets
 *
 * One bound socket per configured `{address, port, protocol}` tuple. The
 * sockets are opened by the monitor before the first fork and inherited by
 * every child; on reconfigure, listeners whose tuple is unchanged keep
 * their descriptor instead of being closed and re-bound.
 */

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use log::{info, warn};
use socket2::{Domain, Socket, Type};

use crate::config::ListenerConfig;
use crate::core::errors::ServerError;
use crate::core::types::{Protocol, ServerResult};

const LISTEN_BACKLOG: i32 = 512;

pub struct Listener {
    cfg: ListenerConfig,
    socket: Socket,
    local: SocketAddr,
}

impl Listener {
    pub fn bind(cfg: ListenerConfig) -> ServerResult<Self> {
        let addr = SocketAddr::new(
            cfg.address.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            cfg.port,
        );
        let bind_err = |e: std::io::Error| ServerError::Bind(addr.to_string(), e);

        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, None).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        let local = socket
            .local_addr()
            .map_err(bind_err)?
            .as_socket()
            .ok_or_else(|| bind_err(std::io::Error::other("not an inet socket")))?;
        info!("listening on {} ({})", local, cfg.proto);
        let mut cfg = cfg;
        if cfg.port == 0 {
            // An ephemeral bind resolves to a concrete port; keep the tuple
            // honest so reconfigure comparisons see the real endpoint.
            cfg.port = local.port();
        }
        Ok(Self { cfg, socket, local })
    }

    /// Accept one connection, applying the linger option the workers rely
    /// on for orderly close.
    pub fn accept(&self, linger: Duration) -> std::io::Result<(TcpStream, SocketAddr)> {
        let (sock, peer) = self.socket.accept()?;
        let _ = sock.set_linger(Some(linger));
        let peer = peer
            .as_socket()
            .ok_or_else(|| std::io::Error::other("non-inet peer"))?;
        Ok((sock.into(), peer))
    }

    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.cfg.proto
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ListenerConfig {
        &self.cfg
    }

    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// Apply a new listener configuration: keep sockets whose tuple is
/// unchanged, bind the new ones, drop the removed ones.
pub fn rebind_listeners(
    old: Vec<Listener>,
    wanted: &[ListenerConfig],
) -> ServerResult<Vec<Listener>> {
    let mut kept: Vec<Option<Listener>> = old.into_iter().map(Some).collect();
    let mut fresh = Vec::with_capacity(wanted.len());

    for cfg in wanted {
        let existing = kept
            .iter_mut()
            .find(|slot| matches!(slot, Some(l) if l.config().same_endpoint(cfg)));
        match existing {
            Some(slot) => fresh.push(slot.take().expect("matched listener present")),
            None => fresh.push(Listener::bind(cfg.clone())?),
        }
    }

    for dropped in kept.into_iter().flatten() {
        warn!("closing removed listener {}", dropped.local_addr());
    }
    Ok(fresh)
}
