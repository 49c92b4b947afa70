// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{convert::TryFrom, fmt, str::FromStr};

use thiserror::Error;

use crate::keys::{PublicKey, SecretKey, PUBLICKEYBYTES};

/// The identity of a peer, as recorded by connection endpoints.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct PeerId(PublicKey);

impl PeerId {
    pub fn as_public_key(&self) -> &PublicKey {
        &self.0
    }
}

impl From<PublicKey> for PeerId {
    fn from(pk: PublicKey) -> Self {
        Self(pk)
    }
}

impl From<SecretKey> for PeerId {
    fn from(key: SecretKey) -> Self {
        Self(key.public())
    }
}

impl From<&SecretKey> for PeerId {
    fn from(key: &SecretKey) -> Self {
        Self(key.public())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid base58 encoding")]
    Base58(#[from] bs58::decode::Error),

    #[error("unexpected key length {0}")]
    UnexpectedLength(usize),
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let bytes = <[u8; PUBLICKEYBYTES]>::try_from(bytes.as_slice())
            .map_err(|_| ParseError::UnexpectedLength(bytes.len()))?;

        Ok(Self(PublicKey::from(bytes)))
    }
}
