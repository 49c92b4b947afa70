// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    addr::{self, Addr, P_INPROC},
    connection::Connection,
    env::{Env, EnvGuard},
    error::Error,
    keys::{PublicKey, SecretKey},
    listener::Listener,
    peer::PeerId,
};

/// Construction options for a [`Transport`].
///
/// The only recognised option is the environment to dial and listen within;
/// the default is the process-wide one.
#[derive(Clone)]
pub struct Options {
    env: Env,
}

impl Default for Options {
    fn default() -> Self {
        Self { env: Env::global() }
    }
}

impl Options {
    pub fn with_env(env: Env) -> Self {
        Self { env }
    }
}

pub(crate) struct TransportInner {
    env: Env,
    key: SecretKey,
    peer: PeerId,
    /// Bound listeners by canonical address. Only locked inside the
    /// environment lock when both are needed, and never across a suspension
    /// point.
    pub(crate) listeners: RwLock<HashMap<String, Listener>>,
}

/// A transport for fast in-process communication.
///
/// Owns the identity it serves and the listeners it has bound; dials within
/// its environment. Cloning yields another handle onto the same transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// A transport serving `key` within the process-wide environment.
    pub fn new(key: SecretKey) -> Self {
        Self::with_options(key, Options::default())
    }

    pub fn with_options(key: SecretKey, options: Options) -> Self {
        let peer = PeerId::from(&key);
        Self {
            inner: Arc::new(TransportInner {
                env: options.env,
                key,
                peer,
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer
    }

    pub fn public_key(&self) -> PublicKey {
        *self.inner.peer.as_public_key()
    }

    pub(crate) fn secret_key(&self) -> SecretKey {
        self.inner.key.clone()
    }

    /// `true` iff the first protocol component of `addr` is `inproc`.
    ///
    /// This is a preemptive filter only: a dialable address is not a
    /// guarantee that dialing will succeed.
    pub fn can_dial(&self, addr: &Addr) -> bool {
        addr.first().map(|c| c.code() == P_INPROC).unwrap_or(false)
    }

    /// The protocol codes handled by this transport.
    pub fn protocols(&self) -> Vec<u32> {
        vec![P_INPROC]
    }

    /// Whether this is a proxy transport. It is not.
    pub fn proxy(&self) -> bool {
        false
    }

    /// Bind `addr` and start listening on it.
    ///
    /// The wildcard name resolves to a fresh one. Errors with
    /// [`Error::InUse`] if the (resolved) address is already bound.
    #[tracing::instrument(skip_all, fields(addr = %addr, peer = %self.inner.peer))]
    pub async fn listen(&self, addr: &Addr) -> Result<Listener, Error> {
        let addr = addr::resolve(addr)?;

        let mut env = self.inner.env.lock().await;
        if env.bind(&addr, self) {
            tracing::debug!(bound = %addr, "listening");
            Ok(self.register_listener(addr))
        } else {
            Err(Error::InUse)
        }
    }

    /// Dial a remote peer.
    ///
    /// Holds the environment lock across the whole operation, so the remote
    /// side can bind a dialback address for this transport atomically.
    /// Errors with [`Error::Refused`] if no listener is bound to `raddr`.
    #[tracing::instrument(skip_all, fields(raddr = %raddr, peer = %self.inner.peer))]
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        raddr: &Addr,
        _peer: PeerId,
    ) -> Result<Connection, Error> {
        let mut env = self.inner.env.lock().await;
        match env.lookup(raddr) {
            Some(bound) => bound.accept_conn(ctx, raddr, self, &mut env).await,
            None => Err(Error::Refused),
        }
    }

    async fn accept_conn(
        &self,
        ctx: &CancellationToken,
        raddr: &Addr,
        dialer: &Transport,
        env: &mut EnvGuard<'_>,
    ) -> Result<Connection, Error> {
        let listener = {
            self.inner
                .listeners
                .read()
                .get(&raddr.to_string())
                .cloned()
        };

        match listener {
            Some(listener) => listener.new_conn(ctx, dialer, self.clone(), env).await,
            None => Err(Error::Refused),
        }
    }

    /// A listener of our own, so the accepted connection has a meaningful
    /// remote address.
    ///
    /// Reuses an existing listener if there is one -- any of them -- and
    /// otherwise binds a freshly-allocated address under the already-held
    /// environment guard.
    pub(crate) fn dialback(&self, env: &mut EnvGuard<'_>) -> Listener {
        let existing = { self.inner.listeners.read().values().next().cloned() };
        if let Some(listener) = existing {
            return listener;
        }

        let addr = addr::fresh();
        env.bind(&addr, self);
        tracing::debug!(bound = %addr, "allocated dialback address");

        self.register_listener(addr)
    }

    fn register_listener(&self, addr: Addr) -> Listener {
        let listener = Listener::new(
            addr.clone(),
            self.inner.env.clone(),
            Arc::downgrade(&self.inner),
        );
        self.inner
            .listeners
            .write()
            .insert(addr.to_string(), listener.clone());

        listener
    }

    pub(crate) fn downgrade(&self) -> Weak<TransportInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<TransportInner>) -> Self {
        Self { inner }
    }
}
