//! Records, calculation parameters and their per-domain details.
//!
//! Every payload carries its own `version` and an embedded [`IndexEntry`].
//! Both versions must agree with each other and with the `v_*` directory the
//! payload is stored in; [`ArtifactPayload::set_version`] keeps them in step.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::index::IndexEntry;
use crate::version::Version;

/// Capabilities the artifact store needs from a versioned payload.
pub trait ArtifactPayload: Serialize + DeserializeOwned + Clone + Debug {
    /// The version the payload is stored under.
    fn version(&self) -> Version;

    /// Sets the payload version and the embedded entry's version together.
    fn set_version(&mut self, version: Version);

    /// The ledger entry embedded in the payload.
    fn index_entry(&self) -> &IndexEntry;

    /// Mutable access to the embedded ledger entry.
    fn index_entry_mut(&mut self) -> &mut IndexEntry;

    /// Run the payload was computed for.
    fn run_number(&self) -> &str;

    /// Checks that both embedded versions equal the directory version `expected`.
    ///
    /// # Errors
    /// Returns a description of the first mismatch.
    fn check_version(&self, expected: u32) -> Result<(), String> {
        let expected = Version::Number(expected);
        if self.version() != expected {
            return Err(format!("version field is {}, directory is {expected}", self.version()));
        }
        if self.index_entry().version != expected {
            return Err(format!(
                "index entry version is {}, directory is {expected}",
                self.index_entry().version
            ));
        }
        Ok(())
    }
}

/// The computed output stored for one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<D> {
    /// Run the record was computed from.
    pub run_number: String,
    /// True for reduced-resolution data.
    #[serde(default)]
    pub use_lite_mode: bool,
    /// Version directory the record lives in.
    pub version: Version,
    /// Ledger entry written alongside the record.
    pub index_entry: IndexEntry,
    /// Domain-specific outputs, flattened into the record object.
    #[serde(flatten)]
    pub detail: D,
}

impl<D> Record<D> {
    /// Creates a record whose version is taken from `index_entry`.
    pub fn new(run_number: impl Into<String>, use_lite_mode: bool, index_entry: IndexEntry, detail: D) -> Self {
        Self {
            run_number: run_number.into(),
            use_lite_mode,
            version: index_entry.version,
            index_entry,
            detail,
        }
    }
}

/// The input parameter set stored for one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationParameters<D> {
    /// Run the parameters apply to.
    pub run_number: String,
    /// True for reduced-resolution data.
    #[serde(default)]
    pub use_lite_mode: bool,
    /// Version directory the parameters live in.
    pub version: Version,
    /// Ledger entry of the version.
    pub index_entry: IndexEntry,
    /// Domain-specific inputs, flattened into the parameters object.
    #[serde(flatten)]
    pub detail: D,
}

impl<D> CalculationParameters<D> {
    /// Creates a parameter set whose version is taken from `index_entry`.
    pub fn new(run_number: impl Into<String>, use_lite_mode: bool, index_entry: IndexEntry, detail: D) -> Self {
        Self {
            run_number: run_number.into(),
            use_lite_mode,
            version: index_entry.version,
            index_entry,
            detail,
        }
    }
}

macro_rules! impl_payload {
    ($ty:ident) => {
        impl<D> ArtifactPayload for $ty<D>
        where
            D: Serialize + DeserializeOwned + Clone + Debug,
        {
            fn version(&self) -> Version {
                self.version
            }

            fn set_version(&mut self, version: Version) {
                self.version = version;
                self.index_entry.version = version;
            }

            fn index_entry(&self) -> &IndexEntry {
                &self.index_entry
            }

            fn index_entry_mut(&mut self) -> &mut IndexEntry {
                &mut self.index_entry
            }

            fn run_number(&self) -> &str {
                &self.run_number
            }
        }
    };
}

impl_payload!(Record);
impl_payload!(CalculationParameters);

/// Outputs of a diffraction calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationOutputs {
    /// Focus grouping the calibration was fitted with.
    pub focus_group: String,
    /// Output workspace names keyed by workspace type.
    #[serde(default)]
    pub workspaces: BTreeMap<String, Vec<String>>,
    /// Fit quality metrics keyed by metric name.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// Inputs of a diffraction calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationInputs {
    /// Instrument state identifier.
    pub instrument_state: String,
    /// Fit stops once the offset change drops below this.
    pub convergence_threshold: f64,
    /// Peak shape used in the fit.
    pub peak_function: String,
    /// Lower d-spacing bound of the crystal peaks used.
    pub crystal_d_min: f64,
    /// Upper d-spacing bound of the crystal peaks used.
    pub crystal_d_max: f64,
}

/// Outputs of a normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationOutputs {
    /// Run subtracted as background.
    pub background_run_number: String,
    /// Smoothing applied to the normalization curve.
    pub smoothing_parameter: f64,
    /// Output workspace names keyed by workspace type.
    #[serde(default)]
    pub workspaces: BTreeMap<String, Vec<String>>,
}

/// Inputs of a normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationInputs {
    /// Run subtracted as background.
    pub background_run_number: String,
    /// Smoothing applied to the normalization curve.
    pub smoothing_parameter: f64,
    /// Peaks weaker than this are not removed.
    pub peak_intensity_threshold: f64,
}

/// Outputs of a reduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReductionOutputs {
    /// Reduced output workspaces.
    #[serde(default)]
    pub workspace_names: Vec<String>,
    /// Calibration version the reduction used, if any.
    pub calibration_version: Option<u32>,
    /// Normalization version the reduction used, if any.
    pub normalization_version: Option<u32>,
}

/// Inputs of a reduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReductionInputs {
    /// Pixel masks applied before focusing.
    #[serde(default)]
    pub pixel_masks: Vec<String>,
    /// Focus groupings to reduce into.
    #[serde(default)]
    pub focus_groups: Vec<String>,
    /// Also keep the unfocused data.
    pub keep_unfocused: bool,
}

/// Instrument parameters derived for an instrument state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentParameterValues {
    /// Instrument state identifier.
    pub instrument_state: String,
    /// Parameter values keyed by name.
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
}

/// Where instrument parameters were read from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentParameterSource {
    /// File the parameters were read from.
    pub source_file: String,
}

/// Calibration record.
pub type CalibrationRecord = Record<CalibrationOutputs>;
/// Calibration parameters.
pub type CalibrationParameters = CalculationParameters<CalibrationInputs>;
/// Normalization record.
pub type NormalizationRecord = Record<NormalizationOutputs>;
/// Normalization parameters.
pub type NormalizationParameters = CalculationParameters<NormalizationInputs>;
/// Reduction record.
pub type ReductionRecord = Record<ReductionOutputs>;
/// Reduction parameters.
pub type ReductionParameters = CalculationParameters<ReductionInputs>;
/// Instrument parameter record.
pub type InstrumentParameterRecord = Record<InstrumentParameterValues>;
/// Instrument parameter source.
pub type InstrumentParameters = CalculationParameters<InstrumentParameterSource>;
