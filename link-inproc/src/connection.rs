// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Connection endpoints, created in mirror-image pairs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    addr::Addr,
    error::Error,
    keys::{PublicKey, SecretKey},
    listener::Listener,
    peer::PeerId,
    stream::{self, Stream},
    sync::Signal,
    transport::Transport,
};

pub trait LocalPeer {
    fn local_peer_id(&self) -> PeerId;
}

pub trait RemotePeer {
    fn remote_peer_id(&self) -> PeerId;
}

pub trait LocalAddr {
    type Addr;

    fn local_addr(&self) -> Self::Addr;
}

pub trait RemoteAddr {
    type Addr;

    fn remote_addr(&self) -> Self::Addr;
}

/// One side of a paired, stream-multiplexed link between two transports.
///
/// Endpoints are created in mirror-image pairs; the pair relationship is
/// symmetric, neither endpoint owns the other.
#[derive(Clone)]
pub struct Connection {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_peer_id", &self.local_peer_id())
            .field("remote_peer_id", &self.remote_peer_id())
            .finish()
    }
}

/// Per-endpoint state. Holds no reference to the peer endpoint -- the
/// acquaintance lives only in [`Connection`] values.
struct Endpoint {
    listener: Listener,
    transport: Transport,
    cq: Signal,
    incoming_tx: flume::Sender<Stream>,
    incoming_rx: flume::Receiver<Stream>,
}

impl Endpoint {
    fn new(listener: Listener, transport: Transport) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = flume::bounded(0);
        Arc::new(Self {
            listener,
            transport,
            cq: Signal::new(),
            incoming_tx,
            incoming_rx,
        })
    }
}

/// Construct a connected endpoint pair.
///
/// Each side is rooted at its own listener and transport; the first element
/// mirrors the first `(listener, transport)` argument.
pub(crate) fn pair(
    local: (Listener, Transport),
    remote: (Listener, Transport),
) -> (Connection, Connection) {
    let a = Endpoint::new(local.0, local.1);
    let b = Endpoint::new(remote.0, remote.1);

    (
        Connection {
            local: Arc::clone(&a),
            peer: Arc::clone(&b),
        },
        Connection { local: b, peer: a },
    )
}

impl Connection {
    /// Open a fresh stream to the peer.
    ///
    /// Constructs a pipe pair and hands one half to the peer endpoint,
    /// keeping the other. Suspends until the peer accepts, competing with
    /// `ctx`.
    pub async fn open_stream(&self, ctx: &CancellationToken) -> Result<Stream, Error> {
        let (local, remote) = stream::pipe();

        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            res = self.peer.incoming_tx.send_async(remote) => match res {
                Ok(()) => Ok(local),
                Err(_) => Err(Error::Closed),
            },
        }
    }

    /// Accept a stream opened by the peer, competing with [`Connection::close`].
    pub async fn accept_stream(&self) -> Result<Stream, Error> {
        tokio::select! {
            _ = self.local.cq.fired() => Err(Error::Closed),
            res = self.local.incoming_rx.recv_async() => res.map_err(|_| Error::Closed),
        }
    }

    /// Close this endpoint. Idempotent.
    pub fn close(&self) {
        self.local.cq.fire();
    }

    pub fn is_closed(&self) -> bool {
        self.local.cq.is_fired()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local.transport.peer_id()
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.peer.transport.peer_id()
    }

    pub fn local_private_key(&self) -> SecretKey {
        self.local.transport.secret_key()
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.peer.transport.public_key()
    }

    pub fn local_addr(&self) -> Addr {
        self.local.listener.addr().clone()
    }

    pub fn remote_addr(&self) -> Addr {
        self.peer.listener.addr().clone()
    }

    /// The transport this endpoint is rooted at.
    pub fn transport(&self) -> Transport {
        self.local.transport.clone()
    }
}

impl LocalPeer for Connection {
    fn local_peer_id(&self) -> PeerId {
        Connection::local_peer_id(self)
    }
}

impl RemotePeer for Connection {
    fn remote_peer_id(&self) -> PeerId {
        Connection::remote_peer_id(self)
    }
}

impl LocalAddr for Connection {
    type Addr = Addr;

    fn local_addr(&self) -> Addr {
        Connection::local_addr(self)
    }
}

impl RemoteAddr for Connection {
    type Addr = Addr;

    fn remote_addr(&self) -> Addr {
        Connection::remote_addr(self)
    }
}
