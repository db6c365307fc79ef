use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::decay_group::DecayGroupTrait;
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::parameter::{ParamId, ParameterStore};

use std::sync::Arc;

/// Caller-supplied fixed decay shape, e.g. a measured autofluorescence
/// profile
///
/// Contributes the pattern as a single column whose amplitude is fitted
/// linearly; the shape itself never varies, so the group carries no
/// non-linear parameters and no derivatives.
#[derive(Clone, Debug)]
pub struct PatternDecayGroup {
    name: String,
    pattern: Vec<f64>,
    ctx: Option<Arc<DataContext>>,
}

impl PatternDecayGroup {
    pub fn new(pattern: Vec<f64>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern,
            ctx: None,
        }
    }
}

impl DecayGroupTrait for PatternDecayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_ids(&self) -> &[ParamId] {
        &[]
    }

    fn set_num_channels(&mut self, _n_chan: usize) {}

    fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.ctx = Some(ctx.clone());
    }

    fn init(&mut self, _params: &ParameterStore) -> Result<(), ModelError> {
        let ctx = self.ctx.as_ref().ok_or(ModelError::MissingContext)?;
        if self.pattern.len() != ctx.n_meas() {
            return Err(ModelError::PatternLength {
                actual: self.pattern.len(),
                expected: ctx.n_meas(),
            });
        }
        Ok(())
    }

    fn num_components(&self) -> usize {
        1
    }

    fn num_nonlinear_parameters(&self) -> usize {
        0
    }

    fn set_irf_position(&mut self, _irf_idx: usize, _t0_shift: f64, _reference_lifetime: f64) {}

    fn set_variables(&mut self, _params: &ParameterStore, _values: &[f64]) -> usize {
        0
    }

    fn calculate_model(
        &self,
        columns: &mut ColumnsMut<'_>,
        _kappa: &mut f64,
        _bin_shift: i32,
    ) -> usize {
        columns
            .clear_column(0)
            .copy_from_slice(&self.pattern);
        1
    }

    fn calculate_derivatives(
        &self,
        _columns: &mut ColumnsMut<'_>,
        _kappa_derv: &mut KappaDerivatives<'_>,
    ) -> usize {
        0
    }

    fn setup_inc_matrix(
        &self,
        _params: &ParameterStore,
        _inc: &mut IncidenceMatrix,
        _row: &mut usize,
        col: &mut usize,
    ) {
        *col += 1;
    }

    fn initial_variables(&self, _params: &ParameterStore, _values: &mut [f64]) -> usize {
        0
    }

    fn nonlinear_outputs(
        &self,
        _params: &ParameterStore,
        _nonlin: &[f64],
        _outputs: &mut Vec<f64>,
        _nonlin_idx: &mut usize,
    ) {
    }

    fn linear_outputs(&self, lin: &[f64], outputs: &mut Vec<f64>, lin_idx: &mut usize) {
        outputs.push(lin[*lin_idx]);
        *lin_idx += 1;
    }

    fn nonlinear_output_param_names(&self, _params: &ParameterStore) -> Vec<String> {
        Vec::new()
    }

    fn linear_output_param_names(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn channel_factors(&self, index: usize) -> Result<&[f64], ModelError> {
        Err(ModelError::BadChannelFactorIndex(index))
    }

    fn set_channel_factors(&mut self, index: usize, _factors: Vec<f64>) -> Result<(), ModelError> {
        Err(ModelError::BadChannelFactorIndex(index))
    }
}
