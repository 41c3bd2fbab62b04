//! The work-directory tree and its startup verification.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::{DaemonError, Result};

/// Typed view of the `<work>` directory layout.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join("fifo")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("files").join("incoming")
    }

    pub fn mask_dir(&self) -> PathBuf {
        self.incoming_dir().join("mask")
    }

    pub fn ls_data_dir(&self) -> PathBuf {
        self.incoming_dir().join("ls_data")
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.root.join("files").join("outgoing")
    }

    pub fn time_dir(&self) -> PathBuf {
        self.root.join("files").join("time")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("files").join("tmp")
    }

    pub fn host_status_path(&self) -> PathBuf {
        self.fifo_dir().join("host_status")
    }

    /// The disabled-sources configuration the supervisor re-reads.
    pub fn disabled_sources_path(&self) -> PathBuf {
        self.etc_dir().join("disabled_sources")
    }

    /// Every directory the engine expects, in verification order.
    fn tree(&self) -> Vec<PathBuf> {
        vec![
            self.fifo_dir(),
            self.messages_dir(),
            self.log_dir(),
            self.archive_dir(),
            self.etc_dir(),
            self.etc_dir().join("groups"),
            self.etc_dir().join("info"),
            self.etc_dir().join("action"),
            self.files_dir(),
            self.incoming_dir(),
            self.mask_dir(),
            self.ls_data_dir(),
            self.outgoing_dir(),
            self.time_dir(),
            self.tmp_dir(),
        ]
    }

    /// Creates whatever is missing with `mode`. The step index of the
    /// first failure is carried in the error so the log pinpoints which
    /// part of the tree could not be set up.
    pub fn verify(&self, mode: u32) -> Result<()> {
        for (step, dir) in self.tree().into_iter().enumerate() {
            if dir.is_dir() {
                continue;
            }
            fs::create_dir_all(&dir)
                .and_then(|_| fs::set_permissions(&dir, fs::Permissions::from_mode(mode)))
                .map_err(|source| DaemonError::Dirs {
                    path: dir.clone(),
                    step,
                    source,
                })?;
            log::debug!("created {}", dir.display());
        }
        Ok(())
    }
}
