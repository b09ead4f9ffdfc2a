use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;

use crate::bitfield::Bitfield;
use crate::manager::link::{self, inbound_handshake, Link, PeerLink};
use crate::manager::scheduler::{Dialer, NewLink};
use crate::persistence::file_manager::FileManager;
use crate::torrent_protocol::wire_protocol::ProtocolError;

/// Accepts incoming peer connections and hands the handshaken ones to the
/// scheduler.
pub struct Listener {
    listener: TcpListener,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
    storage: Arc<FileManager>,
    links_tx: Sender<NewLink<Link>>,
}

impl Listener {
    pub async fn bind(
        port: u16,
        info_hash: [u8; 20],
        own_peer_id: [u8; 20],
        storage: Arc<FileManager>,
        links_tx: Sender<NewLink<Link>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("could not listen on port {port}"))?;
        Ok(Listener {
            listener,
            info_hash,
            own_peer_id,
            storage,
            links_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            log::trace!("waiting for incoming peer connections...");
            let (stream, addr) = tokio::select! {
                r = shutdown.changed() => if r.is_err() || *shutdown.borrow() {
                    break;
                } else {
                    continue;
                },
                r = self.listener.accept() => match r {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::debug!("could not accept connection: {e}");
                        continue;
                    }
                },
            };
            tokio::spawn(accept_peer(
                stream,
                addr,
                self.info_hash,
                self.own_peer_id,
                self.storage.bitfield(),
                self.links_tx.clone(),
            ));
        }
        log::debug!("stopped accepting connections");
    }
}

async fn accept_peer(
    mut stream: TcpStream,
    addr: SocketAddr,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
    local_bitfield: Bitfield,
    links_tx: Sender<NewLink<Link>>,
) {
    let handshake = match inbound_handshake(&mut stream, info_hash, own_peer_id).await {
        Ok(handshake) => handshake,
        Err(e) => {
            match e.downcast_ref::<ProtocolError>() {
                Some(protocol_error) => {
                    log::warn!("peer {addr}: dropping incoming connection: {protocol_error}")
                }
                None => log::debug!("peer {addr}: incoming handshake failed: {e}"),
            }
            return;
        }
    };
    log::debug!("peer {addr}: incoming connection established");
    let link = Link::start(addr, stream, handshake.extensions(), local_bitfield);
    if let Err(e) = links_tx.send(NewLink::Established(link)).await {
        if let NewLink::Established(link) = e.0 {
            link.close();
        }
    }
}

/// Dials peers in background tasks.
pub struct TcpDialer {
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
    links_tx: Sender<NewLink<Link>>,
}

impl TcpDialer {
    pub fn new(info_hash: [u8; 20], own_peer_id: [u8; 20], links_tx: Sender<NewLink<Link>>) -> Self {
        TcpDialer {
            info_hash,
            own_peer_id,
            links_tx,
        }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, addr: SocketAddr, local_bitfield: Bitfield) {
        let info_hash = self.info_hash;
        let own_peer_id = self.own_peer_id;
        let links_tx = self.links_tx.clone();
        tokio::spawn(async move {
            let new_link = match link::connect(addr, info_hash, own_peer_id, local_bitfield).await {
                Ok(link) => NewLink::Established(link),
                Err(e) => {
                    match e.downcast_ref::<ProtocolError>() {
                        Some(protocol_error) => {
                            log::warn!("peer {addr}: handshake rejected: {protocol_error}")
                        }
                        None => log::debug!("peer {addr}: could not connect: {e}"),
                    }
                    NewLink::Failed(addr)
                }
            };
            if let Err(e) = links_tx.send(new_link).await {
                if let NewLink::Established(link) = e.0 {
                    link.close();
                }
            }
        });
    }
}
