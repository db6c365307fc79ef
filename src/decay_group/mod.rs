use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::parameter::{ParamId, ParameterStore};

use enum_dispatch::enum_dispatch;
use std::sync::Arc;

mod multi_exponential;
pub use multi_exponential::MultiExponentialDecayGroup;

mod fret;
pub use fret::FretDecayGroup;

mod anisotropy;
pub use anisotropy::AnisotropyDecayGroup;

mod scatter;
pub use scatter::ScatterDecayGroup;

mod offset;
pub use offset::OffsetDecayGroup;

mod pattern;
pub use pattern::PatternDecayGroup;

/// Capability set shared by every decay group variant
///
/// A group owns a slice of the model: it turns its parameters into one or
/// more basis columns of the expected photon-arrival-time distribution, and
/// into the analytic derivative columns of those basis columns with respect
/// to each of its globally fitted parameters.
#[enum_dispatch]
pub trait DecayGroupTrait {
    fn name(&self) -> &str;

    /// Handles of this group's parameters, in parameter-vector traversal
    /// order
    fn parameter_ids(&self) -> &[ParamId];

    /// Propagate the channel count before a context is available
    fn set_num_channels(&mut self, n_chan: usize);

    fn set_context(&mut self, ctx: &Arc<DataContext>);

    /// Allocate working buffers and recompute structural counts; must be
    /// called again after any structural change
    fn init(&mut self, params: &ParameterStore) -> Result<(), ModelError>;

    /// Basis columns this group currently contributes
    fn num_components(&self) -> usize;

    /// Globally fitted parameters this group currently exposes
    fn num_nonlinear_parameters(&self) -> usize;

    fn set_irf_position(&mut self, irf_idx: usize, t0_shift: f64, reference_lifetime: f64);

    /// Consume a prefix of the parameter vector and recompute all derived
    /// per-evaluation state; returns the number of slots consumed
    fn set_variables(&mut self, params: &ParameterStore, values: &[f64]) -> usize;

    /// Write this group's basis columns; returns the number written.
    /// `bin_shift` of ±1 evaluates the model shifted by one whole time bin,
    /// used for the numerical t0 derivative.
    fn calculate_model(&self, columns: &mut ColumnsMut<'_>, kappa: &mut f64, bin_shift: i32)
    -> usize;

    /// Write the analytic derivative columns in incidence-matrix order;
    /// advances `kappa_derv` once per globally fitted parameter
    fn calculate_derivatives(
        &self,
        columns: &mut ColumnsMut<'_>,
        kappa_derv: &mut KappaDerivatives<'_>,
    ) -> usize;

    /// Mark which output columns each globally fitted parameter influences,
    /// advancing both cursors
    fn setup_inc_matrix(
        &self,
        params: &ParameterStore,
        inc: &mut IncidenceMatrix,
        row: &mut usize,
        col: &mut usize,
    );

    /// Seed the parameter vector with initial values; returns slots written
    fn initial_variables(&self, params: &ParameterStore, values: &mut [f64]) -> usize;

    /// Append fitted-result values in the same order as
    /// [DecayGroupTrait::nonlinear_output_param_names]
    fn nonlinear_outputs(
        &self,
        params: &ParameterStore,
        nonlin: &[f64],
        outputs: &mut Vec<f64>,
        nonlin_idx: &mut usize,
    );

    /// Append normalised linear-amplitude results
    fn linear_outputs(&self, lin: &[f64], outputs: &mut Vec<f64>, lin_idx: &mut usize);

    fn nonlinear_output_param_names(&self, params: &ParameterStore) -> Vec<String>;

    fn linear_output_param_names(&self) -> Vec<String>;

    /// Add any contribution that is constant for the whole fit (for
    /// background subtraction by the caller); default none
    fn add_constant_contribution(&self, _params: &ParameterStore, _buf: &mut [f64]) {}

    /// Named per-channel weight sets; most groups carry exactly one
    fn channel_factor_names(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }

    fn channel_factors(&self, index: usize) -> Result<&[f64], ModelError>;

    fn set_channel_factors(&mut self, index: usize, factors: Vec<f64>) -> Result<(), ModelError>;
}

/// All decay group variants available to a [crate::DecayModel]
#[enum_dispatch(DecayGroupTrait)]
#[derive(Clone, Debug)]
pub enum DecayGroup {
    MultiExponentialDecayGroup,
    FretDecayGroup,
    AnisotropyDecayGroup,
    ScatterDecayGroup,
    OffsetDecayGroup,
    PatternDecayGroup,
}

/// Normalise channel weights to unit sum
pub(crate) fn normalise_channel_factors(factors: &[f64]) -> Vec<f64> {
    let sum: f64 = factors.iter().sum();
    if sum == 0.0 {
        return factors.to_vec();
    }
    factors.iter().map(|&f| f / sum).collect()
}

/// Report a total intensity followed by per-column fractions
///
/// Used by groups whose linear amplitudes are best read as a brightness
/// times a set of population fractions.
pub(crate) fn normalise_linear_parameters(
    lin: &[f64],
    n: usize,
    outputs: &mut Vec<f64>,
    lin_idx: &mut usize,
) {
    let values = &lin[*lin_idx..*lin_idx + n];
    *lin_idx += n;

    let total: f64 = values.iter().sum();
    outputs.push(total);
    if n > 1 {
        for &v in values {
            outputs.push(if total != 0.0 { v / total } else { 0.0 });
        }
    }
}
