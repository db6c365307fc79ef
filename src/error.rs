use crate::parameter::FittingMode;
use crate::validate::DerivativeReport;

/// Error returned from [crate::DecayModel] configuration and evaluation
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("no instrument response function loaded")]
    MissingIrf,

    #[error("IRF has {irf} channels but the data has {data}")]
    ChannelMismatch { irf: usize, data: usize },

    #[error("shared data context has not been set")]
    MissingContext,

    #[error("model has not been initialised, call init() first")]
    NotInitialised,

    #[error("parameter vector has {actual} slots but the model requires {expected}")]
    ParameterVectorLength { actual: usize, expected: usize },

    #[error("fitting mode {mode:?} is not permitted for parameter {name}")]
    DisallowedFittingMode { name: String, mode: FittingMode },

    #[error("bad channel factor index {0}")]
    BadChannelFactorIndex(usize),

    #[error("anisotropy groups require exactly two detector channels, got {0}")]
    AnisotropyChannelCount(usize),

    #[error("pattern length {actual} does not match the measurement size {expected}")]
    PatternLength { actual: usize, expected: usize },

    #[error("incidence matrix capacity exceeded: {rows} variables, {cols} columns")]
    IncidenceOverflow { rows: usize, cols: usize },

    #[error("model reported {actual} {kind} but the structural count is {expected}")]
    StructuralMismatch {
        kind: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error(
        "analytic derivatives disagree with finite differences for {} parameter/column pair(s)",
        report.failed_checks().count()
    )]
    DerivativeValidation { report: DerivativeReport },
}
