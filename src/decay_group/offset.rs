use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::decay_group::DecayGroupTrait;
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::parameter::{FittingMode, FittingParameter, ParamId, ParameterStore};

use std::sync::Arc;

/// Time-independent background
///
/// Fitted locally the offset adds a constant column and its amplitude comes
/// out of the linear stage; fixed, it bypasses the basis entirely and is
/// handed to the caller through `add_constant_contribution` for subtraction
/// before fitting.
#[derive(Clone, Debug)]
pub struct OffsetDecayGroup {
    name: String,
    offset_id: ParamId,
    ids: Vec<ParamId>,
    ctx: Option<Arc<DataContext>>,
    fit_column: bool,
}

impl OffsetDecayGroup {
    pub fn new(store: &mut ParameterStore) -> Self {
        let offset_id = store.insert(FittingParameter::new(
            "offset",
            0.0,
            0.0,
            f64::INFINITY,
            1.0,
            vec![FittingMode::Fixed, FittingMode::FittedLocally],
            FittingMode::FittedLocally,
        ));
        Self {
            name: "Offset".to_string(),
            offset_id,
            ids: vec![offset_id],
            ctx: None,
            fit_column: true,
        }
    }

    pub fn offset_id(&self) -> ParamId {
        self.offset_id
    }
}

impl DecayGroupTrait for OffsetDecayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_ids(&self) -> &[ParamId] {
        &self.ids
    }

    fn set_num_channels(&mut self, _n_chan: usize) {}

    fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.ctx = Some(ctx.clone());
    }

    fn init(&mut self, params: &ParameterStore) -> Result<(), ModelError> {
        if self.ctx.is_none() {
            return Err(ModelError::MissingContext);
        }
        self.fit_column = !params.get(self.offset_id).is_fixed();
        Ok(())
    }

    fn num_components(&self) -> usize {
        self.fit_column as usize
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
        if !self.fit_column {
            return 0;
        }
        columns.clear_column(0).fill(1.0);
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
        *col += self.num_components();
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
        if self.fit_column {
            outputs.push(lin[*lin_idx]);
            *lin_idx += 1;
        }
    }

    fn nonlinear_output_param_names(&self, _params: &ParameterStore) -> Vec<String> {
        Vec::new()
    }

    fn linear_output_param_names(&self) -> Vec<String> {
        if self.fit_column {
            vec!["offset".to_string()]
        } else {
            Vec::new()
        }
    }

    fn add_constant_contribution(&self, params: &ParameterStore, buf: &mut [f64]) {
        if !self.fit_column {
            let offset = params.get(self.offset_id).initial_value;
            for v in buf.iter_mut() {
                *v += offset;
            }
        }
    }

    fn channel_factors(&self, index: usize) -> Result<&[f64], ModelError> {
        Err(ModelError::BadChannelFactorIndex(index))
    }

    fn set_channel_factors(&mut self, index: usize, _factors: Vec<f64>) -> Result<(), ModelError> {
        Err(ModelError::BadChannelFactorIndex(index))
    }
}
