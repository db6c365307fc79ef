use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::convolver::Convolver;
use crate::decay_group::{DecayGroupTrait, normalise_channel_factors, normalise_linear_parameters};
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::parameter::{FittingParameter, ParamId, ParameterStore};

use std::sync::Arc;

/// Fixed offset applied when two lifetimes coincide exactly
///
/// Equal lifetimes make the basis columns numerically degenerate, so one of
/// the pair is nudged and the pairwise scan restarted until all lifetimes
/// differ. This is a stability safeguard, not a modelling choice.
pub(crate) const TAU_DEGENERACY_PERTURBATION: f64 = 20.0;

/// Sum of `n` exponential decays convolved with the IRF
///
/// With local contributions every exponential gets its own basis column and
/// the amplitudes are left to the linear stage of the solver. With global
/// contributions the group collapses to a single column whose fractional
/// contributions ("beta") are non-linear parameters, normalised to unit sum.
#[derive(Clone, Debug)]
pub struct MultiExponentialDecayGroup {
    name: String,
    n_exponential: usize,
    contributions_global: bool,
    tau_ids: Vec<ParamId>,
    beta_ids: Vec<ParamId>,
    all_ids: Vec<ParamId>,
    channel_factors: Vec<f64>,
    norm_channel_factors: Vec<f64>,
    ctx: Option<Arc<DataContext>>,

    // fitting modes frozen at init()
    tau_fitted: Vec<bool>,
    beta_fitted: Vec<bool>,

    // per-evaluation state
    tau: Vec<f64>,
    beta: Vec<f64>,
    beta_sum: f64,
    buffers: Vec<Convolver>,
    irf_idx: usize,
    t0_shift: f64,
    reference_lifetime: f64,

    n_lin_components: usize,
    n_nl_parameters: usize,
}

impl MultiExponentialDecayGroup {
    pub fn new(
        n_exponential: usize,
        contributions_global: bool,
        store: &mut ParameterStore,
    ) -> Self {
        let mut group = Self {
            name: "Multi-Exponential Decay".to_string(),
            n_exponential,
            contributions_global,
            tau_ids: Vec::new(),
            beta_ids: Vec::new(),
            all_ids: Vec::new(),
            channel_factors: vec![1.0],
            norm_channel_factors: Vec::new(),
            ctx: None,
            tau_fitted: Vec::new(),
            beta_fitted: Vec::new(),
            tau: Vec::new(),
            beta: Vec::new(),
            beta_sum: 0.0,
            buffers: Vec::new(),
            irf_idx: 0,
            t0_shift: 0.0,
            reference_lifetime: 0.0,
            n_lin_components: 0,
            n_nl_parameters: 0,
        };
        group.setup_parameters(store);
        group
    }

    pub(crate) fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn setup_parameters(&mut self, store: &mut ParameterStore) {
        resize_lifetime_parameters(store, &mut self.tau_ids, self.n_exponential, "tau_");

        // a lone exponential has no free contribution, so no beta parameter
        if self.contributions_global && self.n_exponential > 1 {
            let initial = 1.0 / self.n_exponential as f64;
            resize_fraction_parameters(store, &mut self.beta_ids, self.n_exponential, initial);
        } else {
            self.beta_ids.clear();
        }

        self.all_ids = self
            .tau_ids
            .iter()
            .chain(&self.beta_ids)
            .copied()
            .collect();
    }

    /// Structural change: number of exponential components
    pub fn set_num_exponential(&mut self, n_exponential: usize, store: &mut ParameterStore) {
        self.n_exponential = n_exponential;
        self.setup_parameters(store);
    }

    /// Structural change: switch between local amplitudes and global
    /// normalised contributions
    pub fn set_contributions_global(&mut self, contributions_global: bool, store: &mut ParameterStore) {
        self.contributions_global = contributions_global;
        self.setup_parameters(store);
    }

    pub fn num_exponential(&self) -> usize {
        self.n_exponential
    }

    pub fn contributions_global(&self) -> bool {
        self.contributions_global
    }

    pub(crate) fn tau_ids(&self) -> &[ParamId] {
        &self.tau_ids
    }

    pub(crate) fn beta_ids(&self) -> &[ParamId] {
        &self.beta_ids
    }

    pub(crate) fn tau(&self) -> &[f64] {
        &self.tau
    }

    pub(crate) fn beta(&self) -> &[f64] {
        &self.beta
    }

    pub(crate) fn buffers(&self) -> &[Convolver] {
        &self.buffers
    }

    pub(crate) fn norm_channel_factors(&self) -> &[f64] {
        &self.norm_channel_factors
    }

    pub(crate) fn tau_fitted(&self) -> &[bool] {
        &self.tau_fitted
    }

    pub(crate) fn beta_fitted(&self) -> &[bool] {
        &self.beta_fitted
    }

    pub(crate) fn context(&self) -> &Arc<DataContext> {
        self.ctx.as_ref().expect("group not initialised")
    }

    pub(crate) fn irf_position(&self) -> (usize, f64, f64) {
        (self.irf_idx, self.t0_shift, self.reference_lifetime)
    }

    /// `∂beta_q / ∂b_j` for sum-normalised contributions `beta = b / Σb`
    pub(crate) fn beta_derivative(&self, q: usize, j: usize) -> f64 {
        let delta = if q == j { 1.0 } else { 0.0 };
        (delta - self.beta[q]) / self.beta_sum
    }

    /// True when betas are non-linear parameters of this configuration
    pub(crate) fn has_free_contributions(&self) -> bool {
        self.contributions_global && self.n_exponential > 1
    }

    /// `Σ_j beta_j * decay_j` accumulated into one column
    pub(crate) fn add_decay_sum(
        &self,
        buffers: &[Convolver],
        factor: f64,
        channel_factors: &[f64],
        out: &mut [f64],
        bin_shift: i32,
    ) {
        for (j, buf) in buffers.iter().enumerate() {
            buf.add_decay(
                factor * self.beta[j],
                channel_factors,
                self.reference_lifetime,
                out,
                bin_shift,
            );
        }
    }

    /// Ensure no two lifetimes coincide; restart the scan on every hit
    fn fix_degenerate_lifetimes(tau: &mut [f64]) {
        let n = tau.len();
        let mut j = 0;
        while j < n {
            let mut perturbed = false;
            for k in j + 1..n {
                if tau[j] == tau[k] {
                    tau[j] += TAU_DEGENERACY_PERTURBATION;
                    perturbed = true;
                    break;
                }
            }
            j = if perturbed { 0 } else { j + 1 };
        }
    }

    fn init_base(&mut self, params: &ParameterStore) -> Result<(), ModelError> {
        let ctx = self.ctx.clone().ok_or(ModelError::MissingContext)?;
        ctx.irf()?;

        if self.channel_factors.len() != ctx.n_chan {
            self.channel_factors = vec![1.0; ctx.n_chan];
        }
        self.norm_channel_factors = normalise_channel_factors(&self.channel_factors);

        self.tau = vec![0.0; self.n_exponential];
        self.beta = vec![1.0; self.n_exponential];
        self.beta_sum = self.n_exponential as f64;
        self.buffers = Convolver::make_vector(self.n_exponential, &ctx);

        self.n_lin_components = if self.contributions_global {
            1
        } else {
            self.n_exponential
        };

        self.tau_fitted = self
            .tau_ids
            .iter()
            .map(|&id| params.get(id).is_fitted_globally())
            .collect();
        self.beta_fitted = if self.has_free_contributions() {
            self.beta_ids
                .iter()
                .map(|&id| params.get(id).is_fitted_globally())
                .collect()
        } else {
            Vec::new()
        };

        self.n_nl_parameters = self.tau_fitted.iter().filter(|&&f| f).count()
            + self.beta_fitted.iter().filter(|&&f| f).count();

        Ok(())
    }

    fn set_variables_base(&mut self, params: &ParameterStore, values: &[f64]) -> usize {
        let mut idx = 0;

        for (i, &id) in self.tau_ids.iter().enumerate() {
            self.tau[i] = params.get(id).value(values, &mut idx);
        }
        Self::fix_degenerate_lifetimes(&mut self.tau);

        if self.has_free_contributions() {
            let raw: Vec<f64> = self
                .beta_ids
                .iter()
                .map(|&id| params.get(id).value(values, &mut idx))
                .collect();
            self.beta_sum = raw.iter().sum();
            debug_assert!(self.beta_sum > 0.0, "contributions must have positive sum");
            for (b, &r) in self.beta.iter_mut().zip(&raw) {
                *b = r / self.beta_sum;
            }
        } else {
            self.beta.fill(1.0);
            self.beta_sum = self.n_exponential as f64;
        }

        for (j, buf) in self.buffers.iter_mut().enumerate() {
            buf.compute(1.0 / self.tau[j], self.irf_idx, self.t0_shift);
        }

        idx
    }
}

impl DecayGroupTrait for MultiExponentialDecayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_ids(&self) -> &[ParamId] {
        // taus first, then betas: the parameter-vector traversal order
        &self.all_ids
    }

    fn set_num_channels(&mut self, n_chan: usize) {
        if self.ctx.is_none() {
            self.channel_factors = vec![1.0; n_chan];
        }
    }

    fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.ctx = Some(ctx.clone());
    }

    fn init(&mut self, params: &ParameterStore) -> Result<(), ModelError> {
        self.init_base(params)
    }

    fn num_components(&self) -> usize {
        self.n_lin_components
    }

    fn num_nonlinear_parameters(&self) -> usize {
        self.n_nl_parameters
    }

    fn set_irf_position(&mut self, irf_idx: usize, t0_shift: f64, reference_lifetime: f64) {
        self.irf_idx = irf_idx;
        self.t0_shift = t0_shift;
        self.reference_lifetime = reference_lifetime;
    }

    fn set_variables(&mut self, params: &ParameterStore, values: &[f64]) -> usize {
        self.set_variables_base(params, values)
    }

    fn calculate_model(
        &self,
        columns: &mut ColumnsMut<'_>,
        _kappa: &mut f64,
        bin_shift: i32,
    ) -> usize {
        if self.contributions_global {
            let out = columns.clear_column(0);
            self.add_decay_sum(&self.buffers, 1.0, &self.norm_channel_factors, out, bin_shift);
            1
        } else {
            for (j, buf) in self.buffers.iter().enumerate() {
                let out = columns.clear_column(j);
                buf.add_decay(
                    1.0,
                    &self.norm_channel_factors,
                    self.reference_lifetime,
                    out,
                    bin_shift,
                );
            }
            self.n_exponential
        }
    }

    fn calculate_derivatives(
        &self,
        columns: &mut ColumnsMut<'_>,
        kappa_derv: &mut KappaDerivatives<'_>,
    ) -> usize {
        let mut col = 0;

        for j in 0..self.n_exponential {
            if !self.tau_fitted[j] {
                continue;
            }
            let out = columns.clear_column(col);
            let fact = self.beta[j] / (self.tau[j] * self.tau[j]);
            self.buffers[j].add_derivative(
                fact,
                &self.norm_channel_factors,
                self.reference_lifetime,
                out,
            );
            col += 1;
            kappa_derv.advance();
        }

        if self.has_free_contributions() {
            for j in 0..self.n_exponential {
                if !self.beta_fitted[j] {
                    continue;
                }
                let out = columns.clear_column(col);
                for q in 0..self.n_exponential {
                    self.buffers[q].add_decay(
                        self.beta_derivative(q, j),
                        &self.norm_channel_factors,
                        self.reference_lifetime,
                        out,
                        0,
                    );
                }
                col += 1;
                kappa_derv.advance();
            }
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
        let col0 = *col;
        for (j, &id) in self.tau_ids.iter().enumerate() {
            if params.get(id).is_fitted_globally() {
                let target = if self.contributions_global { col0 } else { col0 + j };
                inc.set(*row, target);
                *row += 1;
            }
        }

        if self.has_free_contributions() {
            for &id in &self.beta_ids {
                if params.get(id).is_fitted_globally() {
                    inc.set(*row, col0);
                    *row += 1;
                }
            }
        }

        *col += self.n_lin_components;
    }

    fn initial_variables(&self, params: &ParameterStore, values: &mut [f64]) -> usize {
        let mut idx = 0;
        for &id in &self.tau_ids {
            let p = params.get(id);
            if p.is_fitted_globally() {
                values[idx] = p.initial_value;
                idx += 1;
            }
        }
        if self.has_free_contributions() {
            for &id in &self.beta_ids {
                let p = params.get(id);
                if p.is_fitted_globally() {
                    values[idx] = p.initial_value;
                    idx += 1;
                }
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
        for &id in &self.tau_ids {
            outputs.push(params.get(id).value(nonlin, nonlin_idx));
        }

        if self.has_free_contributions() {
            let raw: Vec<f64> = self
                .beta_ids
                .iter()
                .map(|&id| params.get(id).value(nonlin, nonlin_idx))
                .collect();
            let sum: f64 = raw.iter().sum();
            for r in raw {
                outputs.push(if sum != 0.0 { r / sum } else { 0.0 });
            }
        }
    }

    fn linear_outputs(&self, lin: &[f64], outputs: &mut Vec<f64>, lin_idx: &mut usize) {
        if self.contributions_global {
            outputs.push(lin[*lin_idx]);
            *lin_idx += 1;
        } else {
            normalise_linear_parameters(lin, self.n_exponential, outputs, lin_idx);
        }
    }

    fn nonlinear_output_param_names(&self, params: &ParameterStore) -> Vec<String> {
        let mut names: Vec<String> = self
            .tau_ids
            .iter()
            .map(|&id| params.get(id).name.clone())
            .collect();
        if self.has_free_contributions() {
            names.extend(self.beta_ids.iter().map(|&id| params.get(id).name.clone()));
        }
        names
    }

    fn linear_output_param_names(&self) -> Vec<String> {
        if self.contributions_global {
            vec!["I".to_string()]
        } else {
            let mut names = vec!["I_0".to_string()];
            if self.n_exponential > 1 {
                for i in 0..self.n_exponential {
                    names.push(format!("beta_{}", i + 1));
                }
            }
            names
        }
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

pub(crate) fn resize_lifetime_parameters(
    store: &mut ParameterStore,
    ids: &mut Vec<ParamId>,
    n: usize,
    prefix: &str,
) {
    ids.truncate(n);
    for i in ids.len()..n {
        let initial = 4000.0 / (1 << i) as f64;
        let param = FittingParameter::fixed_or_global(format!("{}{}", prefix, i + 1), initial)
            .with_bounds(50.0, 1e6)
            .with_scale(1e-3);
        ids.push(store.insert(param));
    }
}

pub(crate) fn resize_fraction_parameters(
    store: &mut ParameterStore,
    ids: &mut Vec<ParamId>,
    n: usize,
    initial: f64,
) {
    ids.truncate(n);
    for i in ids.len()..n {
        let param = FittingParameter::fixed_or_global(format!("beta_{}", i + 1), initial)
            .with_bounds(0.0, 1.0);
        ids.push(store.insert(param));
    }
}
