// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Device keys, as carried (not negotiated) by in-process transports.

use std::{convert::TryFrom, fmt};

use ed25519_zebra as ed25519;

pub const PUBLICKEYBYTES: usize = std::mem::size_of::<ed25519::VerificationKeyBytes>();

/// A device-specific signing key.
#[derive(Clone)]
pub struct SecretKey(ed25519::SigningKey);

/// The public part of a [`SecretKey`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct PublicKey(ed25519::VerificationKeyBytes);

/// A signature produced by [`SecretKey::sign`].
#[derive(Clone)]
pub struct Signature(ed25519::Signature);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Signature(..)")
    }
}

#[allow(clippy::new_without_default)]
impl SecretKey {
    pub fn new() -> Self {
        Self(ed25519::SigningKey::new(rand::thread_rng()))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(ed25519::SigningKey::from(seed))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(ed25519::VerificationKeyBytes::from(
            ed25519::VerificationKey::from(&self.0),
        ))
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.0.sign(data))
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.public().fmt(f)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&self.public()).finish()
    }
}

impl PublicKey {
    pub fn verify(&self, signature: &Signature, data: &[u8]) -> bool {
        ed25519::VerificationKey::try_from(self.0)
            .and_then(|vk| vk.verify(&signature.0, data))
            .is_ok()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<PublicKey> for [u8; PUBLICKEYBYTES] {
    fn from(pk: PublicKey) -> Self {
        pk.0.into()
    }
}

impl From<[u8; PUBLICKEYBYTES]> for PublicKey {
    fn from(bytes: [u8; PUBLICKEYBYTES]) -> Self {
        Self(ed25519::VerificationKeyBytes::from(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&bs58::encode(self.as_ref()).into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [
        164, 74, 212, 59, 165, 115, 21, 231, 172, 182, 132, 97, 153, 209, 157, 239, 159, 129, 46,
        66, 173, 231, 36, 196, 164, 59, 203, 197, 153, 232, 150, 24,
    ];

    #[test]
    fn sign_verify() {
        let key = SecretKey::from_seed(SEED);
        let sig = key.sign(b"hello, world!");
        assert!(key.public().verify(&sig, b"hello, world!"));
        assert!(!key.public().verify(&sig, b"goodbye, world!"));
    }

    #[test]
    fn public_key_bytes_roundtrip() {
        let pk = SecretKey::from_seed(SEED).public();
        let bytes: [u8; PUBLICKEYBYTES] = pk.into();
        assert_eq!(pk, PublicKey::from(bytes))
    }
}
