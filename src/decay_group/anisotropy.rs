use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::convolver::Convolver;
use crate::decay_group::multi_exponential::MultiExponentialDecayGroup;
use crate::decay_group::DecayGroupTrait;
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::parameter::{FittingParameter, ParamId, ParameterStore};

use std::sync::Arc;

/// Time-resolved anisotropy in parallel/perpendicular detection channels
///
/// The intensity decay is a multi-exponential with globally normalised
/// contributions, observed as `I(t)(1 + 2r(t))` in the parallel channel and
/// `I(t)(1 - r(t))` in the perpendicular channel. Each rotational
/// correlation time `theta_k` adds one column decaying at the combined rate
/// `1/tau_j + 1/theta_k`, weighted `(2g, -1)` across the channels; the
/// associated linear amplitudes are the initial anisotropies `r_k`.
#[derive(Clone, Debug)]
pub struct AnisotropyDecayGroup {
    intensity: MultiExponentialDecayGroup,
    name: String,
    n_theta: usize,
    theta_ids: Vec<ParamId>,
    all_ids: Vec<ParamId>,
    /// Channel weights of the anisotropy columns, `(2g, -1)` for detector
    /// sensitivity ratio `g`
    aniso_channel_factors: Vec<f64>,

    theta_fitted: Vec<bool>,

    // per-evaluation state
    theta: Vec<f64>,
    /// `[theta][exponential]` convolvers at the combined decay rates
    theta_buffers: Vec<Vec<Convolver>>,
    reference_lifetime: f64,

    n_nl_parameters: usize,
}

impl AnisotropyDecayGroup {
    pub fn new(n_exponential: usize, n_theta: usize, store: &mut ParameterStore) -> Self {
        let intensity =
            MultiExponentialDecayGroup::new(n_exponential, true, store).with_name("Intensity");
        let mut group = Self {
            intensity,
            name: "Anisotropy Decay".to_string(),
            n_theta,
            theta_ids: Vec::new(),
            all_ids: Vec::new(),
            aniso_channel_factors: vec![2.0, -1.0],
            theta_fitted: Vec::new(),
            theta: Vec::new(),
            theta_buffers: Vec::new(),
            reference_lifetime: 0.0,
            n_nl_parameters: 0,
        };
        group.setup_parameters(store);
        group
    }

    fn setup_parameters(&mut self, store: &mut ParameterStore) {
        self.theta_ids.truncate(self.n_theta);
        for i in self.theta_ids.len()..self.n_theta {
            let param = FittingParameter::fixed_or_global(
                format!("theta_{}", i + 1),
                1000.0 * (i + 1) as f64,
            )
            .with_bounds(50.0, 1e6)
            .with_scale(1e-3);
            self.theta_ids.push(store.insert(param));
        }

        self.all_ids = self.intensity.parameter_ids().to_vec();
        self.all_ids.extend_from_slice(&self.theta_ids);
    }

    pub fn set_num_exponential(&mut self, n_exponential: usize, store: &mut ParameterStore) {
        self.intensity.set_num_exponential(n_exponential, store);
        self.setup_parameters(store);
    }

    pub fn set_num_theta(&mut self, n_theta: usize, store: &mut ParameterStore) {
        self.n_theta = n_theta;
        self.setup_parameters(store);
    }

    /// Relative sensitivity of the parallel versus perpendicular channel
    pub fn set_g_factor(&mut self, g: f64) {
        self.aniso_channel_factors = vec![2.0 * g, -1.0];
    }
}

impl DecayGroupTrait for AnisotropyDecayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_ids(&self) -> &[ParamId] {
        &self.all_ids
    }

    fn set_num_channels(&mut self, n_chan: usize) {
        self.intensity.set_num_channels(n_chan);
    }

    fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.intensity.set_context(ctx);
    }

    fn init(&mut self, params: &ParameterStore) -> Result<(), ModelError> {
        self.intensity.init(params)?;
        let ctx = self.intensity.context().clone();

        if ctx.n_chan != 2 {
            return Err(ModelError::AnisotropyChannelCount(ctx.n_chan));
        }

        self.theta_fitted = self
            .theta_ids
            .iter()
            .map(|&id| params.get(id).is_fitted_globally())
            .collect();
        self.n_nl_parameters = self.intensity.num_nonlinear_parameters()
            + self.theta_fitted.iter().filter(|&&f| f).count();

        let n_exp = self.intensity.num_exponential();
        self.theta = vec![0.0; self.n_theta];
        self.theta_buffers = (0..self.n_theta)
            .map(|_| Convolver::make_vector(n_exp, &ctx))
            .collect();

        Ok(())
    }

    fn num_components(&self) -> usize {
        1 + self.n_theta
    }

    fn num_nonlinear_parameters(&self) -> usize {
        self.n_nl_parameters
    }

    fn set_irf_position(&mut self, irf_idx: usize, t0_shift: f64, reference_lifetime: f64) {
        self.intensity
            .set_irf_position(irf_idx, t0_shift, reference_lifetime);
        self.reference_lifetime = reference_lifetime;
    }

    fn set_variables(&mut self, params: &ParameterStore, values: &[f64]) -> usize {
        let mut idx = self.intensity.set_variables(params, values);

        let (irf_idx, t0_shift, _) = self.intensity.irf_position();
        let tau = self.intensity.tau().to_vec();

        for k in 0..self.n_theta {
            self.theta[k] = params.get(self.theta_ids[k]).value(values, &mut idx);
            for (j, &tau_j) in tau.iter().enumerate() {
                let rate = 1.0 / tau_j + 1.0 / self.theta[k];
                self.theta_buffers[k][j].compute(rate, irf_idx, t0_shift);
            }
        }

        idx
    }

    fn calculate_model(
        &self,
        columns: &mut ColumnsMut<'_>,
        _kappa: &mut f64,
        bin_shift: i32,
    ) -> usize {
        let beta = self.intensity.beta();

        let out = columns.clear_column(0);
        self.intensity.add_decay_sum(
            self.intensity.buffers(),
            1.0,
            self.intensity.norm_channel_factors(),
            out,
            bin_shift,
        );

        for k in 0..self.n_theta {
            let out = columns.clear_column(1 + k);
            for (j, buf) in self.theta_buffers[k].iter().enumerate() {
                buf.add_decay(
                    beta[j],
                    &self.aniso_channel_factors,
                    self.reference_lifetime,
                    out,
                    bin_shift,
                );
            }
        }

        1 + self.n_theta
    }

    fn calculate_derivatives(
        &self,
        columns: &mut ColumnsMut<'_>,
        kappa_derv: &mut KappaDerivatives<'_>,
    ) -> usize {
        let mut col = 0;
        let beta = self.intensity.beta();
        let tau = self.intensity.tau();
        let n_exp = self.intensity.num_exponential();

        for j in 0..n_exp {
            if !self.intensity.tau_fitted()[j] {
                continue;
            }
            let fact = beta[j] / (tau[j] * tau[j]);

            let out = columns.clear_column(col);
            self.intensity.buffers()[j].add_derivative(
                fact,
                self.intensity.norm_channel_factors(),
                self.reference_lifetime,
                out,
            );
            col += 1;

            for k in 0..self.n_theta {
                let out = columns.clear_column(col);
                self.theta_buffers[k][j].add_derivative(
                    fact,
                    &self.aniso_channel_factors,
                    self.reference_lifetime,
                    out,
                );
                col += 1;
            }
            kappa_derv.advance();
        }

        if self.intensity.has_free_contributions() {
            for j in 0..n_exp {
                if !self.intensity.beta_fitted()[j] {
                    continue;
                }

                let out = columns.clear_column(col);
                for q in 0..n_exp {
                    self.intensity.buffers()[q].add_decay(
                        self.intensity.beta_derivative(q, j),
                        self.intensity.norm_channel_factors(),
                        self.reference_lifetime,
                        out,
                        0,
                    );
                }
                col += 1;

                for k in 0..self.n_theta {
                    let out = columns.clear_column(col);
                    for q in 0..n_exp {
                        self.theta_buffers[k][q].add_decay(
                            self.intensity.beta_derivative(q, j),
                            &self.aniso_channel_factors,
                            self.reference_lifetime,
                            out,
                            0,
                        );
                    }
                    col += 1;
                }
                kappa_derv.advance();
            }
        }

        for k in 0..self.n_theta {
            if !self.theta_fitted[k] {
                continue;
            }
            let out = columns.clear_column(col);
            for j in 0..n_exp {
                let fact = beta[j] / (self.theta[k] * self.theta[k]);
                self.theta_buffers[k][j].add_derivative(
                    fact,
                    &self.aniso_channel_factors,
                    self.reference_lifetime,
                    out,
                );
            }
            col += 1;
            kappa_derv.advance();
        }

        col
    }

    fn setup_inc_matrix(
        &self,
        params: &ParameterStore,
        inc: &mut IncidenceMatrix,
        row: &mut usize,
        col: &mut usize,
    ) {
        let n_group = self.num_components();

        for &id in self.intensity.tau_ids() {
            if params.get(id).is_fitted_globally() {
                for j in 0..n_group {
                    inc.set(*row, *col + j);
                }
                *row += 1;
            }
        }

        if self.intensity.has_free_contributions() {
            for &id in self.intensity.beta_ids() {
                if params.get(id).is_fitted_globally() {
                    for j in 0..n_group {
                        inc.set(*row, *col + j);
                    }
                    *row += 1;
                }
            }
        }

        for (k, &id) in self.theta_ids.iter().enumerate() {
            if params.get(id).is_fitted_globally() {
                inc.set(*row, *col + 1 + k);
                *row += 1;
            }
        }

        *col += n_group;
    }

    fn initial_variables(&self, params: &ParameterStore, values: &mut [f64]) -> usize {
        let mut idx = self.intensity.initial_variables(params, values);
        for &id in &self.theta_ids {
            let p = params.get(id);
            if p.is_fitted_globally() {
                values[idx] = p.initial_value;
                idx += 1;
            }
        }
        idx
    }

    fn nonlinear_outputs(
        &self,
        params: &ParameterStore,
        nonlin: &[f64],
        outputs: &mut Vec<f64>,
        nonlin_idx: &mut usize,
    ) {
        self.intensity
            .nonlinear_outputs(params, nonlin, outputs, nonlin_idx);
        for &id in &self.theta_ids {
            outputs.push(params.get(id).value(nonlin, nonlin_idx));
        }
    }

    fn linear_outputs(&self, lin: &[f64], outputs: &mut Vec<f64>, lin_idx: &mut usize) {
        let intensity = lin[*lin_idx];
        outputs.push(intensity);
        for k in 0..self.n_theta {
            let r = lin[*lin_idx + 1 + k];
            outputs.push(if intensity != 0.0 { r / intensity } else { 0.0 });
        }
        *lin_idx += self.num_components();
    }

    fn nonlinear_output_param_names(&self, params: &ParameterStore) -> Vec<String> {
        self.all_ids
            .iter()
            .map(|&id| params.get(id).name.clone())
            .collect()
    }

    fn linear_output_param_names(&self) -> Vec<String> {
        let mut names = vec!["I".to_string()];
        for k in 0..self.n_theta {
            names.push(format!("r_{}", k + 1));
        }
        names
    }

    fn channel_factor_names(&self) -> Vec<String> {
        vec!["Intensity".to_string(), "Anisotropy".to_string()]
    }

    fn channel_factors(&self, index: usize) -> Result<&[f64], ModelError> {
        match index {
            0 => self.intensity.channel_factors(0),
            1 => Ok(&self.aniso_channel_factors),
            _ => Err(ModelError::BadChannelFactorIndex(index)),
        }
    }

    fn set_channel_factors(&mut self, index: usize, factors: Vec<f64>) -> Result<(), ModelError> {
        match index {
            0 => self.intensity.set_channel_factors(0, factors),
            1 => {
                self.aniso_channel_factors = factors;
                Ok(())
            }
            _ => Err(ModelError::BadChannelFactorIndex(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::FittingMode;
    use crate::tests::{central_difference, gaussian_irf_context};

    use approx::assert_relative_eq;

    fn setup(
        n_exp: usize,
        n_theta: usize,
    ) -> (AnisotropyDecayGroup, ParameterStore, Arc<DataContext>) {
        let mut store = ParameterStore::new();
        let mut group = AnisotropyDecayGroup::new(n_exp, n_theta, &mut store);
        for &id in group.parameter_ids() {
            store
                .set_fitting_mode(id, FittingMode::FittedGlobally)
                .unwrap();
        }
        let ctx = gaussian_irf_context(128, 2, 50.0);
        group.set_context(&ctx);
        group.init(&store).unwrap();
        (group, store, ctx)
    }

    fn model_columns(
        group: &mut AnisotropyDecayGroup,
        params: &ParameterStore,
        alf: &[f64],
    ) -> Vec<f64> {
        let n_meas = group.intensity.context().n_meas();
        group.set_variables(params, alf);
        let mut buf = vec![0.0; n_meas * group.num_components()];
        let mut cols = ColumnsMut::new(&mut buf, n_meas);
        let mut kappa = 0.0;
        group.calculate_model(&mut cols, &mut kappa, 0);
        buf
    }

    #[test]
    fn requires_two_channels() {
        let mut store = ParameterStore::new();
        let mut group = AnisotropyDecayGroup::new(1, 1, &mut store);
        let ctx = gaussian_irf_context(64, 1, 50.0);
        group.set_context(&ctx);
        assert!(matches!(
            group.init(&store),
            Err(ModelError::AnisotropyChannelCount(1))
        ));
    }

    #[test]
    fn anisotropy_column_is_polarised() {
        let (mut group, store, ctx) = setup(1, 1);
        let cols = model_columns(&mut group, &store, &[3000.0, 2000.0]);

        let n_t = ctx.n_t;
        let n_meas = ctx.n_meas();
        // anisotropy column: positive parallel, negative perpendicular
        let par: f64 = cols[n_meas..n_meas + n_t].iter().sum();
        let perp: f64 = cols[n_meas + n_t..2 * n_meas].iter().sum();
        assert!(par > 0.0);
        assert!(perp < 0.0);
        assert_relative_eq!(par / -perp, 2.0, max_relative = 1e-10);
    }

    #[test]
    fn theta_derivative_matches_finite_difference() {
        let (mut group, store, ctx) = setup(2, 1);
        let n_meas = ctx.n_meas();

        // taus, betas, theta
        let alf = [3500.0, 1200.0, 0.6, 0.4, 1500.0];
        group.set_variables(&store, &alf);

        // per tau: 2 cols, per beta: 2 cols, theta: 1 col
        let n_derv_cols = 2 * 2 + 2 * 2 + 1;
        let mut dbuf = vec![0.0; n_meas * n_derv_cols];
        let mut dcols = ColumnsMut::new(&mut dbuf, n_meas);
        let mut slots = vec![0.0; 5];
        let mut kd = KappaDerivatives::new(&mut slots);
        assert_eq!(group.calculate_derivatives(&mut dcols, &mut kd), n_derv_cols);

        let mut probe = group.clone();
        let fd = central_difference(|a| model_columns(&mut probe, &store, a), &alf, 4, 1e-2);
        // theta marks only its own column
        let theta_derv = &dbuf[(n_derv_cols - 1) * n_meas..];
        for i in 0..n_meas {
            assert_relative_eq!(
                theta_derv[i],
                fd[n_meas + i],
                max_relative = 1e-4,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn incidence_spans_all_columns_for_lifetimes() {
        let (group, store, _) = setup(2, 2);
        let mut inc = IncidenceMatrix::new();
        let mut row = 0;
        let mut col = 0;
        group.setup_inc_matrix(&store, &mut inc, &mut row, &mut col);

        assert_eq!((row, col), (6, 3));
        // taus and betas touch every column
        for r in 0..4 {
            for c in 0..3 {
                assert!(inc.get(r, c));
            }
        }
        // thetas are diagonal over the anisotropy columns
        assert!(inc.get(4, 1) && !inc.get(4, 2));
        assert!(inc.get(5, 2) && !inc.get(5, 1));
    }
}
