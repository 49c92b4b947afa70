// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use thiserror::Error;

use crate::addr;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `listen` of an already-bound address.
    #[error("address in use")]
    InUse,

    /// `dial` of an address no listener is bound to.
    #[error("connection refused")]
    Refused,

    /// The listener or connection was closed.
    #[error("closed")]
    Closed,

    /// The operation's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Resolve(#[from] addr::NotInproc),
}
