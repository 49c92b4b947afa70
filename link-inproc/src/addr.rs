// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Symbolic in-process addresses of the form `/inproc/<name>`.
//!
//! Addresses are sequences of protocol components, canonically serialised as
//! bytes: an unsigned-varint protocol code, followed (for variable-size
//! protocols) by an unsigned-varint payload length and the payload itself.
//! Equality and ordering are over the canonical bytes.
//!
//! The `inproc` protocol (code 2020) carries an opaque UTF-8 name. The name
//! `~` is a wildcard recognised only by [`resolve`], which substitutes a
//! fresh process-unique name.

use std::{
    convert::TryFrom,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::{BufMut as _, Bytes};
use parking_lot::RwLock;
use thiserror::Error;

use std::collections::HashMap;

/// Protocol code of the `inproc` protocol.
pub const P_INPROC: u32 = 2020;

pub(crate) const PREFIX: &str = "inproc";

const WILDCARD: &[u8] = b"~";

/// Payload size class of a [`Protocol`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Size {
    /// Payload is exactly this many bytes; no length prefix on the wire.
    Fixed(usize),
    /// Payload is length-prefixed with an unsigned varint.
    Variable,
}

/// Translates protocol payloads between their textual and byte forms.
pub trait Transcoder: Send + Sync {
    fn string_to_bytes(&self, s: &str) -> Result<Vec<u8>, ParseError>;
    fn bytes_to_string(&self, bytes: &[u8]) -> Result<String, ParseError>;
    fn validate(&self, bytes: &[u8]) -> Result<(), ParseError>;
}

/// The `inproc` transcoder: identity between bytes and string, unconditional
/// validation.
struct Identity;

impl Transcoder for Identity {
    fn string_to_bytes(&self, s: &str) -> Result<Vec<u8>, ParseError> {
        Ok(s.as_bytes().to_vec())
    }

    fn bytes_to_string(&self, bytes: &[u8]) -> Result<String, ParseError> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn validate(&self, _: &[u8]) -> Result<(), ParseError> {
        Ok(())
    }
}

/// A registered address protocol.
#[derive(Clone)]
pub struct Protocol {
    pub name: &'static str,
    pub code: u32,
    pub size: Size,
    transcoder: Arc<dyn Transcoder>,
}

impl Protocol {
    pub fn new(
        name: &'static str,
        code: u32,
        size: Size,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            name,
            code,
            size,
            transcoder,
        }
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("code", &self.code)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("protocol `{0}` already registered")]
pub struct AlreadyRegistered(pub &'static str);

#[derive(Default)]
struct Registry {
    by_name: HashMap<&'static str, Protocol>,
    by_code: HashMap<u32, Protocol>,
}

impl Registry {
    fn add(&mut self, proto: Protocol) -> Result<(), AlreadyRegistered> {
        if self.by_name.contains_key(proto.name) || self.by_code.contains_key(&proto.code) {
            return Err(AlreadyRegistered(proto.name));
        }
        self.by_name.insert(proto.name, proto.clone());
        self.by_code.insert(proto.code, proto);

        Ok(())
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = {
        let mut registry = Registry::default();
        registry
            .add(Protocol::new(
                PREFIX,
                P_INPROC,
                Size::Variable,
                Arc::new(Identity),
            ))
            .expect("fresh registry");

        RwLock::new(registry)
    };
    static ref FRESH: AtomicU64 = AtomicU64::new(0);
}

/// Register an additional address protocol.
///
/// The `inproc` protocol is registered on first use of this module.
pub fn register(proto: Protocol) -> Result<(), AlreadyRegistered> {
    REGISTRY.write().add(proto)
}

fn protocol_by_name(name: &str) -> Option<Protocol> {
    REGISTRY.read().by_name.get(name).cloned()
}

fn protocol_by_code(code: u32) -> Option<Protocol> {
    REGISTRY.read().by_code.get(&code).cloned()
}

/// Mint a process-unique name.
fn fresh_name() -> String {
    format!("{:016x}", FRESH.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn fresh() -> Addr {
    Addr::inproc(&fresh_name())
}

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("empty address")]
    Empty,

    #[error("address must start with `/`")]
    Unrooted,

    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),

    #[error("unknown protocol code {0}")]
    UnknownCode(u32),

    #[error("protocol `{0}` requires a value")]
    MissingValue(&'static str),

    #[error("payload of {actual} bytes for fixed-size protocol of {expected}")]
    UnexpectedLength { expected: usize, actual: usize },

    #[error("malformed varint")]
    InvalidVarint,

    #[error("unexpected end of input")]
    Truncated,
}

/// A multi-component symbolic address.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr {
    bytes: Bytes,
}

impl Addr {
    /// The address `/inproc/<name>`.
    pub fn inproc(name: &str) -> Self {
        let mut bytes = Vec::with_capacity(name.len() + 4);
        put_uvarint(&mut bytes, u64::from(P_INPROC));
        put_uvarint(&mut bytes, name.len() as u64);
        bytes.put_slice(name.as_bytes());

        Self {
            bytes: Bytes::from(bytes),
        }
    }

    /// Canonical byte serialisation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode an address from its canonical byte serialisation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let (proto, value, tail) = split_component(rest)?;
            proto.transcoder.validate(value)?;
            rest = tail;
        }

        Ok(Self {
            bytes: Bytes::copy_from_slice(bytes),
        })
    }

    /// Iterator over the address' components.
    ///
    /// Construction validates the canonical bytes, so iteration yields every
    /// component of a well-formed address.
    pub fn iter(&self) -> Components {
        Components { rest: &self.bytes }
    }

    /// The first protocol component.
    pub fn first(&self) -> Option<Component> {
        self.iter().next()
    }

    /// The textual payload of the first component carrying `code`.
    pub fn value_of(&self, code: u32) -> Option<String> {
        self.iter()
            .find(|c| c.proto.code == code)
            .and_then(|c| c.proto.transcoder.bytes_to_string(&c.value).ok())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for component in self.iter() {
            let value = component
                .proto
                .transcoder
                .bytes_to_string(&component.value)
                .map_err(|_| fmt::Error)?;
            write!(f, "/{}/{}", component.proto.name, value)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Addr({})", self)
    }
}

impl FromStr for Addr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if !s.starts_with('/') {
            return Err(ParseError::Unrooted);
        }

        let mut bytes = Vec::with_capacity(s.len());
        let mut parts = s.split('/').skip(1).peekable();
        if parts.peek().is_none() {
            return Err(ParseError::Empty);
        }

        while let Some(name) = parts.next() {
            let proto = protocol_by_name(name)
                .ok_or_else(|| ParseError::UnknownProtocol(name.to_string()))?;
            let value = parts.next().ok_or(ParseError::MissingValue(proto.name))?;
            let value = proto.transcoder.string_to_bytes(value)?;
            proto.transcoder.validate(&value)?;

            put_uvarint(&mut bytes, u64::from(proto.code));
            match proto.size {
                Size::Variable => put_uvarint(&mut bytes, value.len() as u64),
                Size::Fixed(expected) => {
                    if value.len() != expected {
                        return Err(ParseError::UnexpectedLength {
                            expected,
                            actual: value.len(),
                        });
                    }
                },
            }
            bytes.put_slice(&value);
        }

        Ok(Self {
            bytes: Bytes::from(bytes),
        })
    }
}

/// One protocol component of an [`Addr`].
pub struct Component {
    proto: Protocol,
    value: Vec<u8>,
}

impl Component {
    pub fn protocol(&self) -> &Protocol {
        &self.proto
    }

    pub fn code(&self) -> u32 {
        self.proto.code
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

pub struct Components<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Components<'a> {
    type Item = Component;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        match split_component(self.rest) {
            Ok((proto, value, tail)) => {
                self.rest = tail;
                Some(Component {
                    proto,
                    value: value.to_vec(),
                })
            },
            // Unreachable for addresses built by this module, which validates
            // on construction.
            Err(_) => {
                self.rest = &[];
                None
            },
        }
    }
}

fn split_component(bytes: &[u8]) -> Result<(Protocol, &[u8], &[u8]), ParseError> {
    let (code, rest) = read_uvarint(bytes)?;
    let code = u32::try_from(code).map_err(|_| ParseError::InvalidVarint)?;
    let proto = protocol_by_code(code).ok_or(ParseError::UnknownCode(code))?;

    let (len, rest) = match proto.size {
        Size::Variable => {
            let (len, rest) = read_uvarint(rest)?;
            (len as usize, rest)
        },
        Size::Fixed(len) => (len, rest),
    };
    if rest.len() < len {
        return Err(ParseError::Truncated);
    }
    let (value, tail) = rest.split_at(len);

    Ok((proto, value, tail))
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8(v as u8 | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn read_uvarint(bytes: &[u8]) -> Result<(u64, &[u8]), ParseError> {
    let mut v = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        if i >= 10 {
            return Err(ParseError::InvalidVarint);
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((v, &bytes[i + 1..]));
        }
    }

    Err(ParseError::Truncated)
}

#[derive(Debug, Error)]
#[error("not an inproc address")]
pub struct NotInproc;

/// Resolve the wildcard name.
///
/// An address whose `inproc` payload is `~` resolves to the same address
/// with a freshly-minted process-unique name substituted; any other address
/// resolves to itself. This is the only place fresh names are minted for
/// literal addresses -- binding is always against a concrete name.
pub fn resolve(addr: &Addr) -> Result<Addr, NotInproc> {
    if addr.value_of(P_INPROC).is_none() {
        return Err(NotInproc);
    }

    let wild = addr
        .iter()
        .any(|c| c.code() == P_INPROC && c.value() == WILDCARD);
    if !wild {
        return Ok(addr.clone());
    }

    let mut bytes = Vec::with_capacity(addr.as_bytes().len() + 16);
    for component in addr.iter() {
        let value = if component.code() == P_INPROC && component.value() == WILDCARD {
            fresh_name().into_bytes()
        } else {
            component.value().to_vec()
        };

        put_uvarint(&mut bytes, u64::from(component.code()));
        if let Size::Variable = component.protocol().size {
            put_uvarint(&mut bytes, value.len() as u64);
        }
        bytes.put_slice(&value);
    }

    Ok(Addr {
        bytes: Bytes::from(bytes),
    })
}

/// OS-style view of an [`Addr`], for code expecting a `net`-like address.
///
/// The network tag is `inproc`; the string form is the address with the
/// leading `/inproc` stripped.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NetAddr {
    addr: Addr,
}

impl NetAddr {
    pub fn network(&self) -> &'static str {
        PREFIX
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = self.addr.to_string();
        f.write_str(s.strip_prefix("/inproc").unwrap_or(&s))
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NetAddr({})", self)
    }
}

impl From<Addr> for NetAddr {
    fn from(addr: Addr) -> Self {
        Self { addr }
    }
}

impl From<NetAddr> for Addr {
    fn from(na: NetAddr) -> Self {
        na.addr
    }
}
