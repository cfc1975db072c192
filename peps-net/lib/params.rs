//! Run parameters for optimization and measurement, read from JSON.
//!
//! ```json
//! {
//!   "Dmin": 4, "Dmax": 8, "trunc_err": 1e-10,
//!   "mc_samples": 200,
//!   "mc_warm_up_sweeps": 50,
//!   "mc_sweeps_between_sample": 1,
//!   "occupancy": [8, 8],
//!   "step_lens": [0.1, 0.1, 0.05],
//!   "update_scheme": "StochasticReconfiguration",
//!   "mc_sweep_scheme": "SequentiallyNNSiteFlip",
//!   "cg_params": { "max_iter": 100, "tolerance": 1e-8, "diag_shift": 1e-3 },
//!   "wavefunction_path": "tps",
//!   "seed": 1234
//! }
//! ```

use std::{
    fmt,
    fs,
    io,
    path::{ Path, PathBuf },
    str::FromStr,
};
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{ sr::ConjugateGradientParams, tensor::TruncatePara };

#[derive(Debug, Error)]
pub enum ParamsError {
    /// Returned for an update scheme name that isn't recognized.
    #[error("unsupported wavefunction update scheme {0:?}")]
    UnknownUpdateScheme(String),

    /// Returned for a sweep scheme name that isn't recognized.
    #[error("unsupported Monte Carlo sweep scheme {0:?}")]
    UnknownSweepScheme(String),

    /// Returned for parameter values that can't describe a run.
    #[error("invalid parameters: {0}")]
    Invalid(String),

    #[error("error reading parameter file: {0}")]
    Io(#[from] io::Error),

    #[error("error parsing parameters: {0}")]
    Json(#[from] serde_json::Error),
}
use ParamsError::*;
pub type ParamsResult<T> = Result<T, ParamsError>;

impl ParamsError {
    /// Process exit code for a run that fails on these parameters.
    pub fn exit_code(&self) -> i32 {
        match self {
            UnknownSweepScheme(_) => 1,
            UnknownUpdateScheme(_) => 2,
            _ => 4,
        }
    }
}

/// How the wavefunction moves along the estimated gradient.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WavefunctionUpdateScheme {
    /// `T -= step * g`.
    #[default]
    StochasticGradient,
    /// `T -= step * u * g` with `u` uniform in `[0, 1)`.
    RandomStepStochasticGradient,
    /// Clamp every element of `g` to `[-step, step]` first.
    BoundGradientElement,
    /// Step along the natural gradient `S^-1 g`.
    StochasticReconfiguration,
}

impl WavefunctionUpdateScheme {
    pub fn name(self) -> &'static str {
        match self {
            Self::StochasticGradient => "StochasticGradient",
            Self::RandomStepStochasticGradient => "RandomStepStochasticGradient",
            Self::BoundGradientElement => "BoundGradientElement",
            Self::StochasticReconfiguration => "StochasticReconfiguration",
        }
    }
}

impl FromStr for WavefunctionUpdateScheme {
    type Err = ParamsError;

    fn from_str(s: &str) -> ParamsResult<Self> {
        match s {
            "StochasticGradient" => Ok(Self::StochasticGradient),
            "RandomStepStochasticGradient" => Ok(Self::RandomStepStochasticGradient),
            "BoundGradientElement" => Ok(Self::BoundGradientElement),
            "StochasticReconfiguration" => Ok(Self::StochasticReconfiguration),
            other => Err(UnknownUpdateScheme(other.to_string())),
        }
    }
}

impl TryFrom<String> for WavefunctionUpdateScheme {
    type Error = ParamsError;

    fn try_from(s: String) -> ParamsResult<Self> { s.parse() }
}

impl From<WavefunctionUpdateScheme> for String {
    fn from(scheme: WavefunctionUpdateScheme) -> Self { scheme.name().to_string() }
}

impl fmt::Display for WavefunctionUpdateScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Move set of the Monte Carlo chain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MCSweepScheme {
    /// Nearest-neighbor exchanges over every bond.
    #[default]
    SequentiallyNNSiteFlip,
    /// Bit rotations and bond exchanges on the compressed Kagome lattice.
    CompressedLatticeKagomeLocalUpdate,
}

impl MCSweepScheme {
    pub fn name(self) -> &'static str {
        match self {
            Self::SequentiallyNNSiteFlip => "SequentiallyNNSiteFlip",
            Self::CompressedLatticeKagomeLocalUpdate => "CompressedLatticeKagomeLocalUpdate",
        }
    }
}

impl FromStr for MCSweepScheme {
    type Err = ParamsError;

    fn from_str(s: &str) -> ParamsResult<Self> {
        match s {
            "SequentiallyNNSiteFlip" => Ok(Self::SequentiallyNNSiteFlip),
            "CompressedLatticeKagomeLocalUpdate" => Ok(Self::CompressedLatticeKagomeLocalUpdate),
            other => Err(UnknownSweepScheme(other.to_string())),
        }
    }
}

impl TryFrom<String> for MCSweepScheme {
    type Error = ParamsError;

    fn try_from(s: String) -> ParamsResult<Self> { s.parse() }
}

impl From<MCSweepScheme> for String {
    fn from(scheme: MCSweepScheme) -> Self { scheme.name().to_string() }
}

impl fmt::Display for MCSweepScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_sweeps_between_sample() -> usize { 1 }

fn default_wavefunction_path() -> PathBuf { PathBuf::from("tps") }

fn default_energy_path() -> PathBuf { PathBuf::from("energy") }

/// Monte Carlo sampling parameters shared by optimization and measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MCParams {
    #[serde(flatten)]
    pub trunc_para: TruncatePara,
    /// Samples per rank and per optimization iteration.
    pub mc_samples: usize,
    #[serde(default)]
    pub mc_warm_up_sweeps: usize,
    #[serde(default = "default_sweeps_between_sample")]
    pub mc_sweeps_between_sample: usize,
    #[serde(default)]
    pub mc_sweep_scheme: MCSweepScheme,
    /// Number of sites holding each basis value in a random configuration.
    #[serde(default)]
    pub occupancy: Vec<usize>,
    /// Starting configuration, one vector per lattice row; takes precedence
    /// over `occupancy`.
    #[serde(default)]
    pub init_config: Option<Vec<Vec<usize>>>,
    /// Directory of the stored wavefunction and per-rank configurations.
    #[serde(default = "default_wavefunction_path")]
    pub wavefunction_path: PathBuf,
    /// Base seed; per-rank seeds are derived from it. Entropy from the OS is
    /// used when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl MCParams {
    pub fn validate(&self) -> ParamsResult<()> {
        let trunc = &self.trunc_para;
        if trunc.d_max == 0 || trunc.d_min > trunc.d_max {
            return Err(Invalid(format!(
                "boundary bond dimensions Dmin = {}, Dmax = {}", trunc.d_min, trunc.d_max)));
        }
        if !(0.0..1.0).contains(&trunc.trunc_err) {
            return Err(Invalid(format!("truncation error {}", trunc.trunc_err)));
        }
        if self.mc_samples == 0 {
            return Err(Invalid("mc_samples must be positive".to_string()));
        }
        if self.mc_sweeps_between_sample == 0 {
            return Err(Invalid("mc_sweeps_between_sample must be positive".to_string()));
        }
        if self.occupancy.is_empty() && self.init_config.is_none() {
            return Err(Invalid("one of occupancy or init_config is required".to_string()));
        }
        Ok(())
    }
}

/// Parameters of a variational optimization run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VMCOptimizePara {
    #[serde(flatten)]
    pub mc: MCParams,
    /// One step length per optimization iteration.
    pub step_lens: Vec<f64>,
    #[serde(default)]
    pub update_scheme: WavefunctionUpdateScheme,
    #[serde(default)]
    pub cg_params: ConjugateGradientParams,
    /// Directory receiving the energy samples and trajectories.
    #[serde(default = "default_energy_path")]
    pub energy_path: PathBuf,
}

/// Parse the scheme selectors on their own first, so that an unsupported
/// scheme is reported as such rather than as a generic JSON error.
fn check_schemes(value: &serde_json::Value) -> ParamsResult<()> {
    if let Some(s) = value.get("update_scheme").and_then(|v| v.as_str()) {
        s.parse::<WavefunctionUpdateScheme>()?;
    }
    if let Some(s) = value.get("mc_sweep_scheme").and_then(|v| v.as_str()) {
        s.parse::<MCSweepScheme>()?;
    }
    Ok(())
}

impl VMCOptimizePara {
    pub fn from_json(text: &str) -> ParamsResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        check_schemes(&value)?;
        let params: Self = serde_json::from_value(value)?;
        params.validate()?;
        Ok(params)
    }

    pub fn load<P>(path: P) -> ParamsResult<Self>
    where P: AsRef<Path>
    {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> ParamsResult<()> {
        self.mc.validate()?;
        if let Some(step) = self.step_lens.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(Invalid(format!("step length {step}")));
        }
        let cg = &self.cg_params;
        if cg.tolerance < 0.0 || cg.diag_shift < 0.0 {
            return Err(Invalid(format!(
                "CG tolerance {} and diagonal shift {} must be non-negative",
                cg.tolerance, cg.diag_shift,
            )));
        }
        Ok(())
    }
}

/// Parameters of a measurement run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MCMeasurementPara {
    #[serde(flatten)]
    pub mc: MCParams,
    /// Directory receiving the measured observables.
    #[serde(default = "default_measurement_path")]
    pub output_path: PathBuf,
}

fn default_measurement_path() -> PathBuf { PathBuf::from(".") }

impl MCMeasurementPara {
    pub fn from_json(text: &str) -> ParamsResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        check_schemes(&value)?;
        let params: Self = serde_json::from_value(value)?;
        params.validate()?;
        Ok(params)
    }

    pub fn load<P>(path: P) -> ParamsResult<Self>
    where P: AsRef<Path>
    {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> ParamsResult<()> { self.mc.validate() }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"{
        "Dmin": 2, "Dmax": 6, "trunc_err": 1e-12,
        "mc_samples": 50,
        "occupancy": [2, 2],
        "step_lens": [0.1, 0.05],
        "update_scheme": "StochasticReconfiguration",
        "cg_params": { "max_iter": 30, "diag_shift": 0.01 }
    }"#;

    #[test]
    fn defaults_fill_optional_knobs() {
        let params = VMCOptimizePara::from_json(RUN).unwrap();
        assert_eq!(params.mc.trunc_para, TruncatePara::new(2, 6, 1e-12));
        assert_eq!(params.mc.mc_warm_up_sweeps, 0);
        assert_eq!(params.mc.mc_sweeps_between_sample, 1);
        assert_eq!(params.mc.mc_sweep_scheme, MCSweepScheme::SequentiallyNNSiteFlip);
        assert_eq!(params.update_scheme, WavefunctionUpdateScheme::StochasticReconfiguration);
        assert_eq!(params.cg_params.max_iter, 30);
        assert_eq!(params.cg_params.tolerance, ConjugateGradientParams::default().tolerance);
        assert_eq!(params.mc.wavefunction_path, PathBuf::from("tps"));
        assert_eq!(params.energy_path, PathBuf::from("energy"));
        assert_eq!(params.mc.seed, None);
    }

    #[test]
    fn serialization_round_trips_scheme_names() {
        let params = VMCOptimizePara::from_json(RUN).unwrap();
        let text = serde_json::to_string(&params).unwrap();
        assert!(text.contains("\"StochasticReconfiguration\""));
        assert_eq!(VMCOptimizePara::from_json(&text).unwrap(), params);
    }

    #[test]
    fn unknown_schemes_have_distinct_exit_codes() {
        let bad_update = RUN.replace("StochasticReconfiguration", "LineSearch");
        let err = VMCOptimizePara::from_json(&bad_update).unwrap_err();
        assert!(matches!(err, ParamsError::UnknownUpdateScheme(_)));
        assert_eq!(err.exit_code(), 2);

        let bad_sweep = RUN.replace("\"mc_samples\"", "\"mc_sweep_scheme\": \"Exchange3\", \"mc_samples\"");
        let err = VMCOptimizePara::from_json(&bad_sweep).unwrap_err();
        assert!(matches!(err, ParamsError::UnknownSweepScheme(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = VMCOptimizePara::from_json(&RUN.replace("\"Dmin\": 2", "\"Dmin\": 9")).unwrap_err();
        assert!(matches!(err, ParamsError::Invalid(_)));
        let err = VMCOptimizePara::from_json(&RUN.replace("\"mc_samples\": 50", "\"mc_samples\": 0"))
            .unwrap_err();
        assert!(matches!(err, ParamsError::Invalid(_)));
        assert!(matches!(VMCOptimizePara::from_json("{"), Err(ParamsError::Json(_))));
    }
}
