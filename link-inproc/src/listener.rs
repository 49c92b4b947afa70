// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::{
    addr::{Addr, NetAddr},
    connection::{self, Connection, LocalAddr},
    env::{Env, EnvGuard},
    error::Error,
    sync::Signal,
    transport::{Transport, TransportInner},
};

/// An accept endpoint bound to a single address.
///
/// Created by [`Transport::listen`]; terminated by [`Listener::close`],
/// which frees the environment binding and fails outstanding accepts. The
/// listener outlives all connections and streams rooted in it.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

struct Inner {
    addr: Addr,
    env: Env,
    transport: Weak<TransportInner>,
    cq: Signal,
    incoming_tx: flume::Sender<Connection>,
    incoming_rx: flume::Receiver<Connection>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .finish()
    }
}

impl Listener {
    pub(crate) fn new(addr: Addr, env: Env, transport: Weak<TransportInner>) -> Self {
        let (incoming_tx, incoming_rx) = flume::bounded(0);
        Self {
            inner: Arc::new(Inner {
                addr,
                env,
                transport,
                cq: Signal::new(),
                incoming_tx,
                incoming_rx,
            }),
        }
    }

    pub fn addr(&self) -> &Addr {
        &self.inner.addr
    }

    /// OS-style view of the bound address.
    pub fn net_addr(&self) -> NetAddr {
        NetAddr::from(self.inner.addr.clone())
    }

    /// Wait for an inbound connection, competing with [`Listener::close`].
    pub async fn accept(&self) -> Result<Connection, Error> {
        tokio::select! {
            _ = self.inner.cq.fired() => Err(Error::Closed),
            res = self.inner.incoming_rx.recv_async() => res.map_err(|_| Error::Closed),
        }
    }

    /// Close the listener.
    ///
    /// Under the environment lock: fires the close signal and frees the
    /// binding, so the address is immediately bindable again and dials of it
    /// are refused. Outstanding accepts fail with [`Error::Closed`].
    /// Idempotent.
    pub async fn close(&self) {
        let mut env = self.inner.env.lock().await;
        if self.inner.cq.fire() {
            env.free(&self.inner.addr);
            drop(env);

            tracing::debug!(addr = %self.inner.addr, "listener closed");
            if let Some(transport) = self.inner.transport.upgrade() {
                transport
                    .listeners
                    .write()
                    .remove(&self.inner.addr.to_string());
            }
        }
    }

    /// The accept path, invoked by the dialing transport.
    ///
    /// Obtains the dialer's dialback listener under the already-held
    /// environment guard, constructs the endpoint pair, and hands the remote
    /// endpoint to the accept channel, competing with close and `ctx`. The
    /// local endpoint is returned to the dialer.
    pub(crate) async fn new_conn(
        &self,
        ctx: &CancellationToken,
        dialer: &Transport,
        local: Transport,
        env: &mut EnvGuard<'_>,
    ) -> Result<Connection, Error> {
        let dialback = dialer.dialback(env);
        let (for_dialer, for_acceptor) =
            connection::pair((dialback, dialer.clone()), (self.clone(), local));

        tokio::select! {
            _ = self.inner.cq.fired() => Err(Error::Closed),
            _ = ctx.cancelled() => Err(Error::Cancelled),
            res = self.inner.incoming_tx.send_async(for_acceptor) => match res {
                Ok(()) => Ok(for_dialer),
                Err(_) => Err(Error::Closed),
            },
        }
    }
}

impl LocalAddr for Listener {
    type Addr = Addr;

    fn local_addr(&self) -> Addr {
        self.inner.addr.clone()
    }
}
