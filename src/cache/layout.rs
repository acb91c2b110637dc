//! Where the load cache finds files on disk.

use std::path::{Path, PathBuf};

use super::Resolution;

/// Maps data identities to the files they are loaded from.
pub trait SourceLocator: Send + Sync {
    /// Neutron event file of `run` at `resolution`.
    fn neutron_data_path(&self, run: &str, resolution: Resolution) -> PathBuf;

    /// Grouping definition file of `scheme` at `resolution`.
    fn grouping_path(&self, scheme: &str, resolution: Resolution) -> PathBuf;

    /// File an instrument donor for `run` is loaded from. Defaults to the neutron file.
    fn instrument_donor_path(&self, run: &str, resolution: Resolution) -> PathBuf {
        self.neutron_data_path(run, resolution)
    }
}

/// Stock locator: one directory per resolution plus a grouping directory.
///
/// ```text
/// <full_root>/<prefix><run>.nxs.h5
/// <reduced_root>/<prefix><run>.lite.nxs.h5
/// <grouping_root>/<scheme>_<native|lite>.hdf
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLayout {
    /// Full-resolution event files.
    pub full_root: PathBuf,
    /// Reduced-resolution event files.
    pub reduced_root: PathBuf,
    /// Grouping definition files.
    pub grouping_root: PathBuf,
    /// Prepended to the run number in event file names.
    pub file_prefix: String,
}

impl DirectoryLayout {
    /// Layout with `native/`, `lite/` and `groupings/` under `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            full_root: root.join("native"),
            reduced_root: root.join("lite"),
            grouping_root: root.join("groupings"),
            file_prefix: "SNAP_".to_string(),
        }
    }

    /// Replaces the event file prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }
}

impl SourceLocator for DirectoryLayout {
    fn neutron_data_path(&self, run: &str, resolution: Resolution) -> PathBuf {
        let run = run.trim();
        match resolution {
            Resolution::Full => self.full_root.join(format!("{}{run}.nxs.h5", self.file_prefix)),
            Resolution::Reduced => {
                self.reduced_root.join(format!("{}{run}.lite.nxs.h5", self.file_prefix))
            }
        }
    }

    fn grouping_path(&self, scheme: &str, resolution: Resolution) -> PathBuf {
        self.grouping_root.join(format!("{scheme}_{}.hdf", resolution.label()))
    }
}
