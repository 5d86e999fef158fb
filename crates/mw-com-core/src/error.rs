// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type and result alias.
//!
//! Every operation the public API can fail at surfaces through [`Error`].
//! Programmer errors (serialization-version mismatch, double transaction-log
//! acquisition, trace-context double-set, inotify queue overflow,
//! `HandleType::new` with no resolvable id) are *not* represented here -- per
//! the error taxonomy they abort the process (`panic!`/`process::abort()`)
//! rather than return a `Result`.

use crate::transport::shm::ShmError;
use std::fmt;

/// Errors surfaced at the public API boundary.
#[derive(Debug)]
pub enum Error {
    /// `Offer` failed to create its flag file(s); no partial state remains.
    ServiceNotOffered,
    /// `GetNewSamples` / `GetNumNewSamplesAvailable` called outside `Subscribed`.
    NotSubscribed,
    /// A binding-level operation failed; binding-internal detail is hidden.
    BindingFailure,
    /// `InstanceIdentifier::deserialize` received malformed input.
    InvalidInstanceIdentifierString,
    /// `InstanceSpecifier::new` received a string outside the accepted grammar.
    InvalidMetaModelShortname,
    /// No configuration is loaded, or the identifier does not resolve against it.
    InvalidConfiguration,
    /// A specifier resolved to zero configured instance identifiers.
    InstanceIdCouldNotBeResolved,
    /// The transaction log has no free entry for a new subscriber.
    MaxSubscribersExceeded,
    /// `Allocate` found no free slot (all outstanding refcounts non-zero).
    AllocationFailed,
    /// Ambient filesystem I/O failure (flag file / lock file / inotify setup).
    Io(std::io::Error),
    /// Shared-memory-layer failure, not already collapsed by a binding.
    Shm(ShmError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ServiceNotOffered => write!(f, "service could not be offered"),
            Error::NotSubscribed => write!(f, "operation requires an active subscription"),
            Error::BindingFailure => write!(f, "binding operation failed"),
            Error::InvalidInstanceIdentifierString => {
                write!(f, "malformed instance identifier string")
            }
            Error::InvalidMetaModelShortname => {
                write!(f, "instance specifier does not match the meta-model grammar")
            }
            Error::InvalidConfiguration => {
                write!(f, "no configuration loaded, or identifier unresolvable against it")
            }
            Error::InstanceIdCouldNotBeResolved => {
                write!(f, "specifier did not resolve to any configured instance")
            }
            Error::MaxSubscribersExceeded => write!(f, "transaction log has no free entry"),
            Error::AllocationFailed => write!(f, "no free slot available"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Shm(e) => write!(f, "shared memory error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Shm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}

/// Convenient alias for API results using the public [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_does_not_panic() {
        for e in [
            Error::ServiceNotOffered,
            Error::NotSubscribed,
            Error::BindingFailure,
            Error::InvalidInstanceIdentifierString,
            Error::InvalidMetaModelShortname,
            Error::InvalidConfiguration,
            Error::InstanceIdCouldNotBeResolved,
            Error::MaxSubscribersExceeded,
            Error::AllocationFailed,
        ] {
            let _ = e.to_string();
        }
    }

    #[test]
    fn io_error_has_source() {
        use std::error::Error as _;
        let e = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "nope"));
        assert!(e.source().is_some());
    }
}
