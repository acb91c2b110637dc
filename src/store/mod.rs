//! Versioned artifact store.
//!
//! An [`Indexer`] owns one [`VersionLedger`](crate::index::VersionLedger) and
//! the directory tree beside it:
//!
//! ```text
//! <root>/<Domain>Index.json
//! <root>/v_default/<Record>.json, <Parameters>.json
//! <root>/v_0001/<Record>.json, <Parameters>.json
//! ...
//! ```
//!
//! The artifact domain fixes the payload types and file names through
//! [`ArtifactKind`].

mod artifacts;
pub(crate) mod codec;
mod indexer;

use std::fmt;

pub use artifacts::{
    ArtifactPayload, CalculationParameters, CalibrationInputs, CalibrationOutputs,
    CalibrationParameters, CalibrationRecord, InstrumentParameterRecord,
    InstrumentParameterSource, InstrumentParameterValues, InstrumentParameters,
    NormalizationInputs, NormalizationOutputs, NormalizationParameters, NormalizationRecord,
    Record, ReductionInputs, ReductionOutputs, ReductionParameters, ReductionRecord,
};
pub use indexer::{Indexer, RecoveryReport};

/// The artifact domains the store knows how to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactDomain {
    /// Diffraction calibration.
    Calibration,
    /// Vanadium normalization.
    Normalization,
    /// Reduced data.
    Reduction,
    /// Per-state instrument parameters.
    InstrumentParameter,
}

impl ArtifactDomain {
    /// Prefix of the domain's file names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Calibration => "Calibration",
            Self::Normalization => "Normalization",
            Self::Reduction => "Reduction",
            Self::InstrumentParameter => "InstrumentParameter",
        }
    }

    /// Ledger file name, e.g. `CalibrationIndex.json`.
    #[must_use]
    pub fn index_file_name(self) -> String {
        format!("{}Index.json", self.name())
    }

    /// Record file name, e.g. `CalibrationRecord.json`.
    #[must_use]
    pub fn record_file_name(self) -> String {
        format!("{}Record.json", self.name())
    }

    /// Parameters file name, e.g. `CalibrationParameters.json`.
    #[must_use]
    pub fn parameters_file_name(self) -> String {
        format!("{}Parameters.json", self.name())
    }
}

impl fmt::Display for ArtifactDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Binds an artifact domain to its concrete record and parameter types.
pub trait ArtifactKind {
    /// Domain that names the files.
    const DOMAIN: ArtifactDomain;
    /// Payload stored in the record file.
    type Record: ArtifactPayload;
    /// Payload stored in the parameters file.
    type Parameters: ArtifactPayload;
}

/// Diffraction calibration artifacts.
#[derive(Debug, Clone, Copy)]
pub struct Calibration;

/// Normalization artifacts.
#[derive(Debug, Clone, Copy)]
pub struct Normalization;

/// Reduction artifacts.
#[derive(Debug, Clone, Copy)]
pub struct Reduction;

/// Instrument parameter artifacts.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentParameter;

impl ArtifactKind for Calibration {
    const DOMAIN: ArtifactDomain = ArtifactDomain::Calibration;
    type Record = CalibrationRecord;
    type Parameters = CalibrationParameters;
}

impl ArtifactKind for Normalization {
    const DOMAIN: ArtifactDomain = ArtifactDomain::Normalization;
    type Record = NormalizationRecord;
    type Parameters = NormalizationParameters;
}

impl ArtifactKind for Reduction {
    const DOMAIN: ArtifactDomain = ArtifactDomain::Reduction;
    type Record = ReductionRecord;
    type Parameters = ReductionParameters;
}

impl ArtifactKind for InstrumentParameter {
    const DOMAIN: ArtifactDomain = ArtifactDomain::InstrumentParameter;
    type Record = InstrumentParameterRecord;
    type Parameters = InstrumentParameters;
}
