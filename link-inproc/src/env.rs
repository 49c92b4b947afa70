// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! A named address space mapping bound addresses to transports.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tokio::sync::{Mutex, MutexGuard};

use crate::{
    addr::Addr,
    transport::{Transport, TransportInner},
};

lazy_static! {
    static ref GLOBAL: Env = Env::new();
}

/// A shared environment of bound addresses.
///
/// Mutations go through the guard obtained from [`Env::lock`], which callers
/// hold for the duration of compound operations (dial, listen-if-free,
/// dialback allocation), so those are atomic against concurrent binds and
/// frees.
#[derive(Clone, Default)]
pub struct Env {
    bindings: Arc<Mutex<Bindings>>,
}

#[derive(Default)]
struct Bindings {
    map: HashMap<String, Binding>,
}

struct Binding {
    addr: Addr,
    transport: Weak<TransportInner>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default process-wide environment.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Acquire the environment lock.
    pub async fn lock(&self) -> EnvGuard<'_> {
        EnvGuard(self.bindings.lock().await)
    }

    /// Snapshot of the currently-bound addresses.
    ///
    /// Takes the environment lock internally: calling this while holding an
    /// [`EnvGuard`] deadlocks. Drop the guard first.
    pub async fn list(&self) -> Vec<Addr> {
        let bindings = self.bindings.lock().await;
        bindings.map.values().map(|b| b.addr.clone()).collect()
    }
}

/// Exclusive hold of an [`Env`].
pub struct EnvGuard<'a>(MutexGuard<'a, Bindings>);

impl EnvGuard<'_> {
    /// Bind `addr` to `transport`.
    ///
    /// Returns `false`, leaving the existing binding in place, if `addr` is
    /// already bound.
    pub fn bind(&mut self, addr: &Addr, transport: &Transport) -> bool {
        let key = addr.to_string();
        if self.0.map.contains_key(&key) {
            return false;
        }

        self.0.map.insert(
            key,
            Binding {
                addr: addr.clone(),
                transport: transport.downgrade(),
            },
        );
        true
    }

    /// The transport currently bound to `addr`, if any.
    pub fn lookup(&self, addr: &Addr) -> Option<Transport> {
        self.0
            .map
            .get(&addr.to_string())
            .and_then(|b| b.transport.upgrade())
            .map(Transport::from_inner)
    }

    /// Remove the binding for `addr`. Removing an absent binding is a no-op.
    pub fn free(&mut self, addr: &Addr) {
        self.0.map.remove(&addr.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{keys::SecretKey, transport::Options};

    fn transport(env: &Env) -> Transport {
        Transport::with_options(SecretKey::new(), Options::with_env(env.clone()))
    }

    #[tokio::test]
    async fn bind_lifecycle() {
        let env = Env::new();
        let addr = Addr::inproc("test");
        let t1 = transport(&env);
        let t2 = transport(&env);

        let mut guard = env.lock().await;

        assert!(guard.bind(&addr, &t1), "failed to bind to free address");
        let bound = guard.lookup(&addr).expect("bound address not found");
        assert_eq!(bound.peer_id(), t1.peer_id());

        assert!(!guard.bind(&addr, &t2), "overwrote bound address");

        guard.free(&addr);
        assert!(guard.lookup(&addr).is_none());
        assert!(guard.bind(&addr, &t2), "freed address is bindable again");

        // Freeing an absent binding is a no-op.
        guard.free(&Addr::inproc("absent"));
    }

    #[tokio::test]
    async fn lookup_of_dropped_transport_is_absent() {
        let env = Env::new();
        let addr = Addr::inproc("test");

        {
            let t = transport(&env);
            let mut guard = env.lock().await;
            assert!(guard.bind(&addr, &t));
            assert!(guard.lookup(&addr).is_some());
        }

        assert!(env.lock().await.lookup(&addr).is_none())
    }

    #[tokio::test]
    async fn list_snapshots_bound_addresses() {
        let env = Env::new();
        let t = transport(&env);

        {
            let mut guard = env.lock().await;
            guard.bind(&Addr::inproc("a"), &t);
            guard.bind(&Addr::inproc("b"), &t);
        }

        let mut listed = env.list().await;
        listed.sort();
        assert_eq!(listed, vec![Addr::inproc("a"), Addr::inproc("b")])
    }
}
