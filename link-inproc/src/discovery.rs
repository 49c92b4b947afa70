// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Discovery of peers bound in an environment.
//!
//! A [`Discoverer`] selects addresses from the environment's bound-address
//! list according to a [`Strategy`], which users pick to obtain the desired
//! topology.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom as _, SeedableRng as _};
use thiserror::Error;

use crate::{addr::Addr, env::Env};

/// Source of the currently-bound peer addresses.
#[async_trait]
pub trait PeerList: Send + Sync {
    async fn list(&self) -> Vec<Addr>;
}

#[async_trait]
impl PeerList for Env {
    async fn list(&self) -> Vec<Addr> {
        Env::list(self).await
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Options {
    /// Maximum number of addresses to yield. `None` is unlimited.
    pub limit: Option<usize>,
    /// The caller's own bound address. Required by [`SelectRing`].
    pub addr: Option<Addr>,
}

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("ring topology requires the caller's own address")]
    RingRequiresAddr,

    #[error("address not in environment")]
    NotInEnvironment,
}

/// Selects peers from a bound-address snapshot.
pub trait Strategy {
    fn select(&self, opts: &Options, addrs: Vec<Addr>) -> Result<Vec<Addr>, Error>;
}

/// Every bound address, in canonical order.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectAll;

impl Strategy for SelectAll {
    fn select(&self, opts: &Options, mut addrs: Vec<Addr>) -> Result<Vec<Addr>, Error> {
        addrs.sort();
        Ok(limit(opts, addrs))
    }
}

/// The caller's successor in the sorted ring of bound addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectRing;

impl Strategy for SelectRing {
    fn select(&self, opts: &Options, mut addrs: Vec<Addr>) -> Result<Vec<Addr>, Error> {
        let own = opts.addr.as_ref().ok_or(Error::RingRequiresAddr)?;

        addrs.sort();
        let position = addrs
            .iter()
            .position(|a| a == own)
            .ok_or(Error::NotInEnvironment)?;
        let neighbour = addrs[(position + 1) % addrs.len()].clone();

        Ok(vec![neighbour])
    }
}

/// A random sample of the bound addresses.
pub struct SelectRandom {
    rng: Mutex<StdRng>,
}

impl Default for SelectRandom {
    fn default() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl SelectRandom {
    /// A deterministically-seeded instance, for reproducible selections.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Strategy for SelectRandom {
    fn select(&self, opts: &Options, mut addrs: Vec<Addr>) -> Result<Vec<Addr>, Error> {
        // Sorted before shuffling, so the order is a function of the seed
        // alone.
        addrs.sort();
        addrs.shuffle(&mut *self.rng.lock());

        Ok(limit(opts, addrs))
    }
}

fn limit(opts: &Options, mut addrs: Vec<Addr>) -> Vec<Addr> {
    if let Some(limit) = opts.limit {
        addrs.truncate(limit)
    }
    addrs
}

/// Discovers peers in an environment using a pluggable [`Strategy`].
pub struct Discoverer<P = Env, S = SelectRandom> {
    peers: P,
    strategy: S,
}

impl<P, S> Discoverer<P, S>
where
    P: PeerList,
    S: Strategy,
{
    pub fn new(peers: P, strategy: S) -> Self {
        Self { peers, strategy }
    }

    /// Select peers from the current bound-address snapshot.
    pub async fn find_peers(
        &self,
        opts: Options,
    ) -> Result<impl futures::Stream<Item = Addr>, Error> {
        let addrs = self.peers.list().await;
        let selected = self.strategy.select(&opts, addrs)?;

        Ok(futures::stream::iter(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt as _;

    struct Fixed(Vec<Addr>);

    #[async_trait]
    impl PeerList for Fixed {
        async fn list(&self) -> Vec<Addr> {
            self.0.clone()
        }
    }

    fn bound() -> Vec<Addr> {
        vec![
            Addr::inproc("h2"),
            Addr::inproc("h0"),
            Addr::inproc("h1"),
        ]
    }

    #[tokio::test]
    async fn all_is_sorted_and_limited() {
        let disco = Discoverer::new(Fixed(bound()), SelectAll);

        let peers = disco
            .find_peers(Options::default())
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(
            peers,
            vec![
                Addr::inproc("h0"),
                Addr::inproc("h1"),
                Addr::inproc("h2"),
            ]
        );

        let peers = disco
            .find_peers(Options {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(peers, vec![Addr::inproc("h0"), Addr::inproc("h1")])
    }

    #[tokio::test]
    async fn ring_selects_successor() {
        let disco = Discoverer::new(Fixed(bound()), SelectRing);

        let own = |name: &str| Options {
            addr: Some(Addr::inproc(name)),
            ..Default::default()
        };

        for (name, successor) in &[("h0", "h1"), ("h1", "h2"), ("h2", "h0")] {
            let peers = disco
                .find_peers(own(name))
                .await
                .unwrap()
                .collect::<Vec<_>>()
                .await;
            assert_eq!(peers, vec![Addr::inproc(successor)], "ring after {}", name)
        }
    }

    #[tokio::test]
    async fn ring_requires_membership() {
        let disco = Discoverer::new(Fixed(bound()), SelectRing);

        assert!(matches!(
            disco.find_peers(Options::default()).await,
            Err(Error::RingRequiresAddr)
        ));
        assert!(matches!(
            disco
                .find_peers(Options {
                    addr: Some(Addr::inproc("stranger")),
                    ..Default::default()
                })
                .await,
            Err(Error::NotInEnvironment)
        ))
    }

    #[tokio::test]
    async fn random_is_reproducible_under_a_seed() {
        let select = |seed| async move {
            Discoverer::new(Fixed(bound()), SelectRandom::seeded(seed))
                .find_peers(Options::default())
                .await
                .unwrap()
                .collect::<Vec<_>>()
                .await
        };

        let one = select(42).await;
        let two = select(42).await;
        assert_eq!(one, two);

        let mut sorted = one.clone();
        sorted.sort();
        assert_eq!(
            sorted,
            vec![
                Addr::inproc("h0"),
                Addr::inproc("h1"),
                Addr::inproc("h2"),
            ]
        )
    }
}
