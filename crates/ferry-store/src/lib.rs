//! Shared on-disk state of the distribution engine.
//!
//! Four records live under the work directory and are shared between the
//! supervisor, its workers and read-only sibling tools:
//!
//! * [`RetrieveList`] - the per-source catalogue of remote files with
//!   per-row assignment state, coordinated by byte-range locks.
//! * [`StatusBlock`] - the supervisor's versioned status record (role
//!   status bytes, counters, log history rings).
//! * [`ActiveFile`] - pid slots, the heartbeat counter and the shutdown
//!   flag; the single-instance beacon.
//! * [`HostTable`] - per-remote-host error counters, queue flags and job
//!   slots with byte-activity stamps.
//!
//! Every record uses an explicit little-endian field layout written
//! through [`mapfile::MapFile`]; nothing here depends on struct layout
//! tricks, so the files survive recompilation. The layouts are versioned,
//! not compatible with any previous encoding.

pub mod active;
pub mod error;
pub mod hosts;
pub mod lock;
pub mod mapfile;
pub mod retrieve;
pub mod status;

pub use active::ActiveFile;
pub use error::StoreError;
pub use hosts::{HostEntry, HostTable, JobSlot, HOST_JOB_SLOTS};
pub use retrieve::{RetrieveEntry, RetrieveList};
pub use status::{RoleStatus, StatusBlock};

/// Store result type.
pub type Result<T> = std::result::Result<T, StoreError>;
