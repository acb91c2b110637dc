//! # calib-store - versioned artifact storage for instrument calibration
//!
//! Calibration, normalization, reduction and instrument-parameter artifacts
//! are stored per version in `v_*` directories. A JSON ledger beside them
//! records which version applies to which runs.
//!
//! ## Core Concepts
//!
//! - **Version**: a concrete number, or the `Default`/`Next` sentinels resolved at write time
//! - **AppliesTo**: a run-number predicate such as `>=46000, <47000`
//! - **VersionLedger**: the per-directory index, reconciled against the directories on disk
//! - **FileLock**: cross-process mutual exclusion for ledger updates
//! - **Indexer**: typed read/write of records and parameters for one artifact domain
//! - **LoadCache**: loads each expensive input once and hands out copies
//!
//! ## Usage
//!
//! ```rust,no_run
//! use calib_store::{Calibration, CalibrationOutputs, Indexer, IndexEntry, Record, StoreConfig, Version};
//!
//! # fn main() -> Result<(), calib_store::IndexError> {
//! let mut indexer = Indexer::<Calibration>::open("/data/calibration/state_abc", StoreConfig::default())?;
//!
//! let entry = IndexEntry::builder("46680").author("jdoe").build()?;
//! let record = Record::new("46680", true, entry, CalibrationOutputs::default());
//! let written = indexer.write_record(record, false)?;
//!
//! let applicable = indexer.latest_applicable_version("46700")?;
//! assert_eq!(applicable, Some(written.version.require_concrete()?));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod applicability;
pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod store;
pub mod version;

pub use applicability::{parse_run_number, AppliesTo, Clause, Comparator};
pub use cache::{
    DirectoryLayout, FetchExecutor, FetchOutcome, FetchRequest, Fetched, LoadCache, MemoryBackend,
    Resolution, ResidentItems, SourceLocator,
};
pub use config::{OpenMode, StoreConfig};
pub use error::{CacheError, CalibError, CalibResult, IndexError};
pub use index::{FileLock, IndexEntry, IndexEntryBuilder, IndexRead, VersionLedger};
pub use store::{
    ArtifactDomain, ArtifactKind, ArtifactPayload, CalculationParameters, Calibration,
    CalibrationInputs, CalibrationOutputs, CalibrationParameters, CalibrationRecord, Indexer,
    InstrumentParameter, InstrumentParameterRecord, InstrumentParameterSource,
    InstrumentParameterValues, InstrumentParameters, Normalization, NormalizationInputs,
    NormalizationOutputs, NormalizationParameters, NormalizationRecord, Record, RecoveryReport,
    Reduction, ReductionInputs, ReductionOutputs, ReductionParameters, ReductionRecord,
};
pub use version::{Version, DEFAULT_VERSION};
