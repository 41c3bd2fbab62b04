//! Listing classification for the retrieval cycle.
//!
//! Three stages: parse a remote listing (SFTP attributes or the textual
//! fact format), filter names through the configured mask groups, and
//! diff the survivors against the durable retrieve list under the
//! per-cycle quota caps.

#![forbid(unsafe_code)]

pub mod diff;
pub mod listing;
pub mod mask;

pub use diff::{diff, Comparator, DiffOutcome, DiffPolicy, RemoteFile};
pub use listing::{parse_listing, ListingEntry, ListingType};
pub use mask::{MaskGroup, MaskList, MaskVerdict};

use thiserror::Error;

/// Scan result type.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Errors from mask parsing and list maintenance.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("bad file mask {mask:?}: {source}")]
    Pattern {
        mask: String,
        #[source]
        source: glob::PatternError,
    },

    #[error(transparent)]
    Store(#[from] ferry_store::StoreError),
}
