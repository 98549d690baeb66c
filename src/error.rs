use thiserror::Error;

use crate::core::{CondError, TopologyError};
use crate::store::StoreError;
use crate::topology::txns::TopologyTxnError;
use crate::wire::{ProtoDecodeError, ProtoEncodeError};

/// How the topology actor reacts to an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// The process must not continue serving (cluster id mismatch, this
    /// RM removed, corrupt topology).
    Fatal,
    /// Retry with bounded randomized backoff may succeed.
    Retryable,
    /// Report and carry on.
    Ignored,
}

impl Transience {
    pub fn is_fatal(self) -> bool {
        matches!(self, Transience::Fatal)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; classification lives with
/// the modules that raise them.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    TopologyTxn(#[from] TopologyTxnError),

    #[error(transparent)]
    Cond(#[from] CondError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),

    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Topology(err) => match err {
                TopologyError::ClusterIdMismatch { .. }
                | TopologyError::VersionRegression { .. } => Transience::Fatal,
                TopologyError::LocalHostMissing { .. } => Transience::Retryable,
                TopologyError::NothingToPromote | TopologyError::PromotionBlocked { .. } => {
                    Transience::Ignored
                }
            },
            Error::TopologyTxn(err) => err.transience(),
            Error::Cond(_) => Transience::Fatal,
            Error::Store(err) => match err {
                StoreError::Corrupt { .. } => Transience::Fatal,
                StoreError::Unavailable { .. } => Transience::Retryable,
            },
            Error::Encode(_) => Transience::Fatal,
            Error::Decode(_) => Transience::Ignored,
        }
    }
}
