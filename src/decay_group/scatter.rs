use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::decay_group::{DecayGroupTrait, normalise_channel_factors};
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::parameter::{ParamId, ParameterStore};

use ndarray::Array2;
use std::sync::Arc;

/// Scattered excitation light, modelled as the IRF shape itself
///
/// Contributes a single column holding the (t0-shifted) instrument response,
/// normalised to unit total, so the associated linear amplitude reads
/// directly as the scatter intensity. Carries no non-linear parameters.
#[derive(Clone, Debug)]
pub struct ScatterDecayGroup {
    name: String,
    channel_factors: Vec<f64>,
    norm_channel_factors: Vec<f64>,
    ctx: Option<Arc<DataContext>>,

    trace: Vec<f64>,
    shift_storage: Array2<f64>,
    irf_idx: usize,
    t0_shift: f64,
}

impl ScatterDecayGroup {
    pub fn new() -> Self {
        Self {
            name: "Scatter".to_string(),
            channel_factors: vec![1.0],
            norm_channel_factors: Vec::new(),
            ctx: None,
            trace: Vec::new(),
            shift_storage: Array2::zeros((0, 0)),
            irf_idx: 0,
            t0_shift: 0.0,
        }
    }
}

impl Default for ScatterDecayGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl DecayGroupTrait for ScatterDecayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_ids(&self) -> &[ParamId] {
        &[]
    }

    fn set_num_channels(&mut self, n_chan: usize) {
        if self.ctx.is_none() {
            self.channel_factors = vec![1.0; n_chan];
        }
    }

    fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.ctx = Some(ctx.clone());
    }

    fn init(&mut self, _params: &ParameterStore) -> Result<(), ModelError> {
        let ctx = self.ctx.clone().ok_or(ModelError::MissingContext)?;
        let irf = ctx.irf()?;

        if self.channel_factors.len() != ctx.n_chan {
            self.channel_factors = vec![1.0; ctx.n_chan];
        }
        self.norm_channel_factors = normalise_channel_factors(&self.channel_factors);

        self.trace = vec![0.0; ctx.n_meas()];
        self.shift_storage = Array2::zeros((irf.num_channels(), irf.num_bins()));

        Ok(())
    }

    fn num_components(&self) -> usize {
        1
    }

    fn num_nonlinear_parameters(&self) -> usize {
        0
    }

    fn set_irf_position(&mut self, irf_idx: usize, t0_shift: f64, _reference_lifetime: f64) {
        self.irf_idx = irf_idx;
        self.t0_shift = t0_shift;
    }

    fn set_variables(&mut self, _params: &ParameterStore, _values: &[f64]) -> usize {
        let ctx = self.ctx.clone().expect("group not initialised");
        let irf = ctx.irf.as_ref().expect("scatter requires an IRF");

        let g = irf.irf(self.irf_idx, self.t0_shift, &mut self.shift_storage);
        let n_irf = g.ncols();

        self.trace.fill(0.0);
        for (c, &cf) in self.norm_channel_factors.iter().enumerate() {
            for i in 0..ctx.n_t.min(n_irf) {
                self.trace[c * ctx.n_t + i] = g[[c, i]] * cf;
            }
        }
        let total: f64 = self.trace.iter().sum();
        if total != 0.0 {
            for v in self.trace.iter_mut() {
                *v /= total;
            }
        }

        0
    }

    fn calculate_model(
        &self,
        columns: &mut ColumnsMut<'_>,
        _kappa: &mut f64,
        bin_shift: i32,
    ) -> usize {
        let ctx = self.ctx.as_ref().expect("group not initialised");
        let n_t = ctx.n_t;

        let out = columns.clear_column(0);
        for c in 0..ctx.n_chan {
            let block = &self.trace[c * n_t..(c + 1) * n_t];
            for i in 0..n_t {
                let s = i as i64 - bin_shift as i64;
                out[c * n_t + i] = if s < 0 {
                    0.0
                } else if s >= n_t as i64 {
                    block[n_t - 1]
                } else {
                    block[s as usize]
                };
            }
        }
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
        vec!["scatter".to_string()]
    }

    fn channel_factors(&self, index: usize) -> Result<&[f64], ModelError> {
        match index {
            0 => Ok(&self.channel_factors),
            _ => Err(ModelError::BadChannelFactorIndex(index)),
        }
    }

    fn set_channel_factors(&mut self, index: usize, factors: Vec<f64>) -> Result<(), ModelError> {
        match index {
            0 => {
                self.channel_factors = factors;
                Ok(())
            }
            _ => Err(ModelError::BadChannelFactorIndex(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::gaussian_irf_context;

    use approx::assert_relative_eq;

    #[test]
    fn column_is_unit_normalised_irf() {
        let ctx = gaussian_irf_context(64, 2, 25.0);
        let mut group = ScatterDecayGroup::new();
        group.set_context(&ctx);
        group.init(&ParameterStore::new()).unwrap();
        group.set_irf_position(0, 0.0, 0.0);
        assert_eq!(group.set_variables(&ParameterStore::new(), &[]), 0);

        let mut buf = vec![0.0; ctx.n_meas()];
        let mut cols = ColumnsMut::new(&mut buf, ctx.n_meas());
        let mut kappa = 0.0;
        assert_eq!(group.calculate_model(&mut cols, &mut kappa, 0), 1);

        let total: f64 = buf.iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);

        // peak position follows the IRF peak
        let irf = ctx.irf.as_ref().unwrap();
        let irf_peak = irf
            .irf(0, 0.0, &mut Array2::zeros((2, 64)))
            .row(0)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        let col_peak = buf[..64]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(col_peak, irf_peak);
    }

    #[test]
    fn re_evaluation_overwrites_previous_trace() {
        let ctx = gaussian_irf_context(64, 1, 25.0);
        let mut group = ScatterDecayGroup::new();
        group.set_context(&ctx);
        group.init(&ParameterStore::new()).unwrap();

        group.set_irf_position(0, 0.0, 0.0);
        group.set_variables(&ParameterStore::new(), &[]);
        let unshifted = group.trace.clone();

        // a shifted pixel re-fills the same buffer
        group.set_irf_position(0, 50.0, 0.0);
        group.set_variables(&ParameterStore::new(), &[]);
        assert_eq!(group.trace.len(), ctx.n_meas());
        assert_relative_eq!(group.trace.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_ne!(group.trace, unshifted);

        group.set_irf_position(0, 0.0, 0.0);
        group.set_variables(&ParameterStore::new(), &[]);
        assert_eq!(group.trace, unshifted);
    }

    #[test]
    fn contributes_no_nonlinear_structure() {
        let ctx = gaussian_irf_context(32, 1, 25.0);
        let mut group = ScatterDecayGroup::new();
        group.set_context(&ctx);
        group.init(&ParameterStore::new()).unwrap();

        assert_eq!(group.num_nonlinear_parameters(), 0);
        let mut inc = IncidenceMatrix::new();
        let mut row = 0;
        let mut col = 0;
        group.setup_inc_matrix(&ParameterStore::new(), &mut inc, &mut row, &mut col);
        assert_eq!((row, col), (0, 1));
        assert_eq!(inc.count_ones(), 0);
    }
}
