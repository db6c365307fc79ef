use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::convolver::Convolver;
use crate::decay_group::multi_exponential::MultiExponentialDecayGroup;
use crate::decay_group::{DecayGroupTrait, normalise_channel_factors, normalise_linear_parameters};
use crate::error::ModelError;
use crate::inc_matrix::IncidenceMatrix;
use crate::kappa::KappaFactor;
use crate::parameter::{FittingParameter, ParamId, ParameterStore};

use std::sync::Arc;

/// Lower clamp applied to transfer and acceptor lifetimes
///
/// Rates diverge as these lifetimes approach zero; the solver may probe that
/// region, so the group evaluates as if the lifetime were at the floor.
const MIN_FRET_LIFETIME: f64 = 50.0;

/// Donor decay quenched by resonance energy transfer, with optional
/// sensitised acceptor emission
///
/// Each FRET population `i` adds a column built from the donor exponentials
/// decaying at the quenched rates `1/tau_j + 1/tauT_i`, averaged over the
/// orientation-factor samples of [KappaFactor]. When the acceptor is
/// included, every population column also carries the sensitised acceptor
/// emission (rising with the quenched donor decay, falling with `tauA`) and
/// a directly excited acceptor term weighted by `Qsigma`. An optional
/// donor-only column models the unquenched fraction.
#[derive(Clone, Debug)]
pub struct FretDecayGroup {
    donor: MultiExponentialDecayGroup,
    name: String,
    n_fret_populations: usize,
    include_donor_only: bool,
    include_acceptor: bool,
    kappa_factor: KappaFactor,

    a_id: ParamId,
    q_id: ParamId,
    qsigma_id: ParamId,
    taua_id: ParamId,
    taut_ids: Vec<ParamId>,
    all_ids: Vec<ParamId>,

    acceptor_channel_factors: Vec<f64>,
    norm_acceptor_channel_factors: Vec<f64>,

    // fitting modes frozen at init()
    taut_fitted: Vec<bool>,
    q_fitted: bool,
    qsigma_fitted: bool,
    taua_fitted: bool,

    // per-evaluation state
    a: f64,
    q: f64,
    qsigma: f64,
    taua: f64,
    /// `[population][kappa]` effective transfer lifetime
    tau_transfer: Vec<Vec<f64>>,
    /// `[population][kappa][exponential]` sensitised-emission amplitude
    /// `kt / (kd + kt - ka)`
    a_star: Vec<Vec<Vec<f64>>>,
    fret_buffers: Vec<Vec<Vec<Convolver>>>,
    acceptor_buffer: Option<Convolver>,
    reference_lifetime: f64,

    n_lin_components: usize,
    n_nl_parameters: usize,
}

impl FretDecayGroup {
    pub fn new(
        n_donor_exponential: usize,
        n_fret_populations: usize,
        include_donor_only: bool,
        store: &mut ParameterStore,
    ) -> Self {
        let donor =
            MultiExponentialDecayGroup::new(n_donor_exponential, true, store).with_name("Donor");

        let a_id = store.insert(FittingParameter::fixed("A", 1.0));
        let q_id = store.insert(FittingParameter::fixed_or_global("Q", 1.0).with_bounds(0.0, 4.0));
        let qsigma_id =
            store.insert(FittingParameter::fixed_or_global("Qsigma", 0.1).with_bounds(0.0, 4.0));
        let taua_id = store.insert(
            FittingParameter::fixed_or_global("tauA", 4000.0)
                .with_bounds(500.0, 8000.0)
                .with_scale(1e-3),
        );

        let mut group = Self {
            donor,
            name: "FRET Decay".to_string(),
            n_fret_populations,
            include_donor_only,
            include_acceptor: false,
            kappa_factor: KappaFactor::dynamic(),
            a_id,
            q_id,
            qsigma_id,
            taua_id,
            taut_ids: Vec::new(),
            all_ids: Vec::new(),
            acceptor_channel_factors: vec![1.0],
            norm_acceptor_channel_factors: Vec::new(),
            taut_fitted: Vec::new(),
            q_fitted: false,
            qsigma_fitted: false,
            taua_fitted: false,
            a: 1.0,
            q: 0.0,
            qsigma: 0.0,
            taua: 0.0,
            tau_transfer: Vec::new(),
            a_star: Vec::new(),
            fret_buffers: Vec::new(),
            acceptor_buffer: None,
            reference_lifetime: 0.0,
            n_lin_components: 0,
            n_nl_parameters: 0,
        };
        group.setup_parameters(store);
        group
    }

    fn setup_parameters(&mut self, store: &mut ParameterStore) {
        self.taut_ids.truncate(self.n_fret_populations);
        for i in self.taut_ids.len()..self.n_fret_populations {
            let param = FittingParameter::fixed_or_global(
                format!("tauT_{}", i + 1),
                1000.0 * (i + 1) as f64,
            )
            .with_bounds(MIN_FRET_LIFETIME, 1e6)
            .with_scale(1e-3);
            self.taut_ids.push(store.insert(param));
        }

        self.all_ids = self.donor.parameter_ids().to_vec();
        self.all_ids.push(self.a_id);
        self.all_ids.extend_from_slice(&self.taut_ids);
        if self.include_acceptor {
            self.all_ids
                .extend_from_slice(&[self.q_id, self.qsigma_id, self.taua_id]);
        }
    }

    pub fn set_num_exponential(&mut self, n_exponential: usize, store: &mut ParameterStore) {
        self.donor.set_num_exponential(n_exponential, store);
        self.setup_parameters(store);
    }

    pub fn set_num_fret_populations(&mut self, n: usize, store: &mut ParameterStore) {
        self.n_fret_populations = n;
        self.setup_parameters(store);
    }

    pub fn set_include_donor_only(&mut self, include: bool, store: &mut ParameterStore) {
        self.include_donor_only = include;
        self.setup_parameters(store);
    }

    pub fn set_include_acceptor(&mut self, include: bool, store: &mut ParameterStore) {
        self.include_acceptor = include;
        self.setup_parameters(store);
    }

    /// Replace the orientation-factor quadrature; requires re-init
    pub fn set_kappa_factor(&mut self, kappa_factor: KappaFactor) {
        self.kappa_factor = kappa_factor;
    }

    fn n_fret_group(&self) -> usize {
        self.n_fret_populations + self.include_donor_only as usize
    }

    fn n_kappa(&self) -> usize {
        self.kappa_factor.len()
    }

    fn acceptor(&self) -> &Convolver {
        self.acceptor_buffer
            .as_ref()
            .expect("acceptor buffer allocated at init")
    }

    /// Sensitised acceptor emission for population `i`: rise terms matching
    /// the quenched donor decays plus the fall with the acceptor lifetime
    fn add_acceptor_contribution(&self, i: usize, factor: f64, out: &mut [f64], bin_shift: i32) {
        let beta = self.donor.beta();
        let mut a_star_sum = 0.0;
        for j in 0..self.donor.num_exponential() {
            for k in 0..self.n_kappa() {
                let f = factor * self.kappa_factor.p[k] * beta[j] * self.a_star[i][k][j];
                self.fret_buffers[i][k][j].add_decay(
                    -f,
                    &self.norm_acceptor_channel_factors,
                    self.reference_lifetime,
                    out,
                    bin_shift,
                );
                a_star_sum += f;
            }
        }
        self.acceptor().add_decay(
            a_star_sum,
            &self.norm_acceptor_channel_factors,
            self.reference_lifetime,
            out,
            bin_shift,
        );
    }

    /// `fact * a_star * (acceptor - rise)` for one `(i, j, k)` term
    fn add_acceptor_derivative_contribution(
        &self,
        i: usize,
        j: usize,
        k: usize,
        fact: f64,
        out: &mut [f64],
    ) {
        let f = fact * self.a_star[i][k][j];
        self.fret_buffers[i][k][j].add_decay(
            -f,
            &self.norm_acceptor_channel_factors,
            self.reference_lifetime,
            out,
            0,
        );
        self.acceptor().add_decay(
            f,
            &self.norm_acceptor_channel_factors,
            self.reference_lifetime,
            out,
            0,
        );
    }
}

impl DecayGroupTrait for FretDecayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_ids(&self) -> &[ParamId] {
        &self.all_ids
    }

    fn set_num_channels(&mut self, n_chan: usize) {
        self.donor.set_num_channels(n_chan);
        self.acceptor_channel_factors = vec![1.0; n_chan];
    }

    fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.donor.set_context(ctx);
    }

    fn init(&mut self, params: &ParameterStore) -> Result<(), ModelError> {
        self.donor.init(params)?;
        let ctx = self.donor.context().clone();

        self.n_lin_components = self.n_fret_group();

        self.taut_fitted = self
            .taut_ids
            .iter()
            .map(|&id| params.get(id).is_fitted_globally())
            .collect();
        self.q_fitted = self.include_acceptor && params.get(self.q_id).is_fitted_globally();
        self.qsigma_fitted =
            self.include_acceptor && params.get(self.qsigma_id).is_fitted_globally();
        self.taua_fitted = self.include_acceptor && params.get(self.taua_id).is_fitted_globally();

        self.n_nl_parameters = self.donor.num_nonlinear_parameters()
            + self.taut_fitted.iter().filter(|&&f| f).count()
            + self.q_fitted as usize
            + self.qsigma_fitted as usize
            + self.taua_fitted as usize;

        let n_exp = self.donor.num_exponential();
        let n_kappa = self.n_kappa();
        self.fret_buffers = (0..self.n_fret_populations)
            .map(|_| {
                (0..n_kappa)
                    .map(|_| Convolver::make_vector(n_exp, &ctx))
                    .collect()
            })
            .collect();
        self.tau_transfer = vec![vec![0.0; n_kappa]; self.n_fret_populations];
        self.a_star = vec![vec![vec![0.0; n_exp]; n_kappa]; self.n_fret_populations];

        self.acceptor_buffer = self.include_acceptor.then(|| Convolver::new(&ctx));

        if self.acceptor_channel_factors.len() != ctx.n_chan {
            self.acceptor_channel_factors = vec![1.0; ctx.n_chan];
        }
        self.norm_acceptor_channel_factors =
            normalise_channel_factors(&self.acceptor_channel_factors);

        Ok(())
    }

    fn num_components(&self) -> usize {
        self.n_lin_components
    }

    fn num_nonlinear_parameters(&self) -> usize {
        self.n_nl_parameters
    }

    fn set_irf_position(&mut self, irf_idx: usize, t0_shift: f64, reference_lifetime: f64) {
        self.donor
            .set_irf_position(irf_idx, t0_shift, reference_lifetime);
        self.reference_lifetime = reference_lifetime;
    }

    fn set_variables(&mut self, params: &ParameterStore, values: &[f64]) -> usize {
        let mut idx = self.donor.set_variables(params, values);

        self.a = params.get(self.a_id).initial_value;

        let (irf_idx, t0_shift, _) = self.donor.irf_position();
        let tau = self.donor.tau().to_vec();

        for i in 0..self.n_fret_populations {
            let tau_transfer_0 = params.get(self.taut_ids[i]).value(values, &mut idx);
            let tau_transfer_0 = tau_transfer_0.max(MIN_FRET_LIFETIME);

            for k in 0..self.n_kappa() {
                self.tau_transfer[i][k] = tau_transfer_0 / self.kappa_factor.f[k];
                for (j, &tau_j) in tau.iter().enumerate() {
                    let rate = 1.0 / tau_j + 1.0 / self.tau_transfer[i][k];
                    self.fret_buffers[i][k][j].compute(rate, irf_idx, t0_shift);
                }
            }
        }

        if self.include_acceptor {
            self.q = params.get(self.q_id).value(values, &mut idx);
            self.qsigma = params.get(self.qsigma_id).value(values, &mut idx);
            self.taua = params
                .get(self.taua_id)
                .value(values, &mut idx)
                .max(MIN_FRET_LIFETIME);

            self.acceptor_buffer
                .as_mut()
                .expect("acceptor buffer allocated at init")
                .compute(1.0 / self.taua, irf_idx, t0_shift);

            let ka = 1.0 / self.taua;
            for i in 0..self.n_fret_populations {
                for k in 0..self.n_kappa() {
                    let kt = 1.0 / self.tau_transfer[i][k];
                    for (j, &tau_j) in tau.iter().enumerate() {
                        let kd = 1.0 / tau_j;
                        self.a_star[i][k][j] = kt / (kd + kt - ka);
                    }
                }
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
        let mut col = 0;

        if self.include_donor_only {
            let out = columns.clear_column(col);
            self.donor.add_decay_sum(
                self.donor.buffers(),
                1.0,
                self.donor.norm_channel_factors(),
                out,
                bin_shift,
            );
            if self.include_acceptor {
                self.acceptor().add_decay(
                    self.qsigma,
                    &self.norm_acceptor_channel_factors,
                    self.reference_lifetime,
                    out,
                    bin_shift,
                );
            }
            col += 1;
        }

        let beta = self.donor.beta();
        for i in 0..self.n_fret_populations {
            let out = columns.clear_column(col);
            for k in 0..self.n_kappa() {
                let p_k = self.kappa_factor.p[k];
                for (j, buf) in self.fret_buffers[i][k].iter().enumerate() {
                    buf.add_decay(
                        p_k * beta[j],
                        self.donor.norm_channel_factors(),
                        self.reference_lifetime,
                        out,
                        bin_shift,
                    );
                }
            }

            if self.include_acceptor {
                self.add_acceptor_contribution(i, self.q, out, bin_shift);
                self.acceptor().add_decay(
                    self.qsigma,
                    &self.norm_acceptor_channel_factors,
                    self.reference_lifetime,
                    out,
                    bin_shift,
                );
            }

            col += 1;
        }

        // brightness applied after all contributions
        columns.scale(col, self.a);

        col
    }

    fn calculate_derivatives(
        &self,
        columns: &mut ColumnsMut<'_>,
        kappa_derv: &mut KappaDerivatives<'_>,
    ) -> usize {
        let mut col = 0;
        let beta = self.donor.beta();
        let tau = self.donor.tau();

        for j in 0..self.donor.num_exponential() {
            if !self.donor.tau_fitted()[j] {
                continue;
            }
            let fact = beta[j] / (tau[j] * tau[j]);

            if self.include_donor_only {
                let out = columns.clear_column(col);
                self.donor.buffers()[j].add_derivative(
                    fact,
                    self.donor.norm_channel_factors(),
                    self.reference_lifetime,
                    out,
                );
                col += 1;
            }

            for i in 0..self.n_fret_populations {
                let out = columns.clear_column(col);
                for k in 0..self.n_kappa() {
                    let fact_k = fact * self.kappa_factor.p[k];
                    self.fret_buffers[i][k][j].add_derivative(
                        fact_k,
                        self.donor.norm_channel_factors(),
                        self.reference_lifetime,
                        out,
                    );

                    if self.include_acceptor {
                        let mut acceptor_fact = self.q * self.a_star[i][k][j] * fact_k;
                        self.fret_buffers[i][k][j].add_derivative(
                            -acceptor_fact,
                            &self.norm_acceptor_channel_factors,
                            self.reference_lifetime,
                            out,
                        );

                        acceptor_fact *= self.tau_transfer[i][k];
                        self.add_acceptor_derivative_contribution(i, j, k, acceptor_fact, out);
                    }
                }
                col += 1;
            }
            kappa_derv.advance();
        }

        if self.donor.has_free_contributions() {
            for j in 0..self.donor.num_exponential() {
                if !self.donor.beta_fitted()[j] {
                    continue;
                }
                for i in 0..self.n_fret_group() {
                    let out = columns.clear_column(col);
                    for q_exp in 0..self.donor.num_exponential() {
                        let factor = self.donor.beta_derivative(q_exp, j);
                        if i == 0 && self.include_donor_only {
                            self.donor.buffers()[q_exp].add_decay(
                                factor,
                                self.donor.norm_channel_factors(),
                                self.reference_lifetime,
                                out,
                                0,
                            );
                        } else {
                            let fi = i - self.include_donor_only as usize;
                            for k in 0..self.n_kappa() {
                                let factor_k = factor * self.kappa_factor.p[k];
                                self.fret_buffers[fi][k][q_exp].add_decay(
                                    factor_k,
                                    self.donor.norm_channel_factors(),
                                    self.reference_lifetime,
                                    out,
                                    0,
                                );
                                if self.include_acceptor {
                                    let sensitised =
                                        self.q * factor_k * self.a_star[fi][k][q_exp];
                                    self.fret_buffers[fi][k][q_exp].add_decay(
                                        -sensitised,
                                        &self.norm_acceptor_channel_factors,
                                        self.reference_lifetime,
                                        out,
                                        0,
                                    );
                                    self.acceptor().add_decay(
                                        sensitised,
                                        &self.norm_acceptor_channel_factors,
                                        self.reference_lifetime,
                                        out,
                                        0,
                                    );
                                }
                            }
                        }
                    }
                    col += 1;
                }
                kappa_derv.advance();
            }
        }

        for i in 0..self.n_fret_populations {
            if !self.taut_fitted[i] {
                continue;
            }
            let out = columns.clear_column(col);
            for k in 0..self.n_kappa() {
                for j in 0..self.donor.num_exponential() {
                    let fact = beta[j]
                        / (self.kappa_factor.f[k]
                            * self.tau_transfer[i][k]
                            * self.tau_transfer[i][k])
                        * self.kappa_factor.p[k];
                    self.fret_buffers[i][k][j].add_derivative(
                        fact,
                        self.donor.norm_channel_factors(),
                        self.reference_lifetime,
                        out,
                    );

                    if self.include_acceptor {
                        let acceptor_fact = -self.q * self.a_star[i][k][j] * fact;
                        self.fret_buffers[i][k][j].add_derivative(
                            acceptor_fact,
                            &self.norm_acceptor_channel_factors,
                            self.reference_lifetime,
                            out,
                        );

                        let acceptor_fact = beta[j]
                            * self.q
                            * self.a_star[i][k][j]
                            * (1.0 / self.taua - 1.0 / tau[j])
                            * self.kappa_factor.p[k]
                            / self.kappa_factor.f[k];
                        self.add_acceptor_derivative_contribution(i, j, k, acceptor_fact, out);
                    }
                }
            }
            col += 1;
            kappa_derv.advance();
        }

        if self.include_acceptor {
            if self.q_fitted {
                for i in 0..self.n_fret_populations {
                    let out = columns.clear_column(col);
                    self.add_acceptor_contribution(i, 1.0, out, 0);
                    col += 1;
                }
                kappa_derv.advance();
            }

            if self.qsigma_fitted {
                for _ in 0..self.n_fret_group() {
                    let out = columns.clear_column(col);
                    self.acceptor().add_decay(
                        1.0,
                        &self.norm_acceptor_channel_factors,
                        self.reference_lifetime,
                        out,
                        0,
                    );
                    col += 1;
                }
                kappa_derv.advance();
            }

            if self.taua_fitted {
                let direct_fact = self.qsigma / (self.taua * self.taua);

                if self.include_donor_only {
                    let out = columns.clear_column(col);
                    self.acceptor().add_derivative(
                        direct_fact,
                        &self.norm_acceptor_channel_factors,
                        self.reference_lifetime,
                        out,
                    );
                    col += 1;
                }

                for i in 0..self.n_fret_populations {
                    let out = columns.clear_column(col);
                    for j in 0..self.donor.num_exponential() {
                        for k in 0..self.n_kappa() {
                            let mut fact = beta[j] * self.q * self.a_star[i][k][j]
                                / (self.taua * self.taua)
                                * self.kappa_factor.p[k];
                            self.acceptor().add_derivative(
                                fact,
                                &self.norm_acceptor_channel_factors,
                                self.reference_lifetime,
                                out,
                            );

                            fact *= -self.tau_transfer[i][k];
                            self.add_acceptor_derivative_contribution(i, j, k, fact, out);
                        }
                    }
                    self.acceptor().add_derivative(
                        direct_fact,
                        &self.norm_acceptor_channel_factors,
                        self.reference_lifetime,
                        out,
                    );
                    col += 1;
                }
                kappa_derv.advance();
            }
        }

        columns.scale(col, self.a);

        col
    }

    fn setup_inc_matrix(
        &self,
        params: &ParameterStore,
        inc: &mut IncidenceMatrix,
        row: &mut usize,
        col: &mut usize,
    ) {
        let n_fret_group = self.n_fret_group();
        let col0 = *col;

        // every lifetime and contribution touches every group column
        for &id in self.donor.tau_ids() {
            if params.get(id).is_fitted_globally() {
                for j in 0..n_fret_group {
                    inc.set(*row, *col + j);
                }
                *row += 1;
            }
        }

        if self.donor.num_exponential() > 1 {
            for &id in self.donor.beta_ids() {
                if params.get(id).is_fitted_globally() {
                    for j in 0..n_fret_group {
                        inc.set(*row, *col + j);
                    }
                    *row += 1;
                }
            }
        }

        if self.include_donor_only {
            *col += 1;
        }

        // transfer lifetimes are diagonal over the population columns
        for i in 0..self.n_fret_populations {
            if params.get(self.taut_ids[i]).is_fitted_globally() {
                inc.set(*row, *col + i);
                *row += 1;
            }
        }

        if self.include_acceptor && params.get(self.q_id).is_fitted_globally() {
            for i in self.include_donor_only as usize..n_fret_group {
                inc.set(*row, col0 + i);
            }
            *row += 1;
        }

        if self.include_acceptor && params.get(self.qsigma_id).is_fitted_globally() {
            for i in 0..n_fret_group {
                inc.set(*row, col0 + i);
            }
            *row += 1;
        }

        if self.include_acceptor && params.get(self.taua_id).is_fitted_globally() {
            for i in 0..n_fret_group {
                inc.set(*row, col0 + i);
            }
            *row += 1;
        }

        *col += self.n_fret_populations;
    }

    fn initial_variables(&self, params: &ParameterStore, values: &mut [f64]) -> usize {
        let mut idx = self.donor.initial_variables(params, values);

        for &id in &self.taut_ids {
            let p = params.get(id);
            if p.is_fitted_globally() {
                values[idx] = p.initial_value;
                idx += 1;
            }
        }

        if self.include_acceptor {
            for &id in [self.q_id, self.qsigma_id, self.taua_id].iter() {
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
        let base = outputs.len();
        self.donor
            .nonlinear_outputs(params, nonlin, outputs, nonlin_idx);

        outputs.push(params.get(self.a_id).value(nonlin, nonlin_idx));

        let taut_base = outputs.len();
        for &id in &self.taut_ids {
            outputs.push(
                params
                    .get(id)
                    .value(nonlin, nonlin_idx)
                    .max(MIN_FRET_LIFETIME),
            );
        }

        if self.include_acceptor {
            outputs.push(params.get(self.q_id).value(nonlin, nonlin_idx));
            outputs.push(params.get(self.qsigma_id).value(nonlin, nonlin_idx));
            outputs.push(
                params
                    .get(self.taua_id)
                    .value(nonlin, nonlin_idx)
                    .max(MIN_FRET_LIFETIME),
            );
        }

        // apparent FRET efficiency per population
        let n_exp = self.donor.num_exponential();
        for i in 0..self.n_fret_populations {
            let mut e = 0.0;
            for j in 0..n_exp {
                let tau_j = outputs[base + j];
                let tau_f = 1.0 / (1.0 / tau_j + 1.0 / outputs[taut_base + i]);
                let e_j = 1.0 - tau_f / tau_j;
                let b = if n_exp > 1 { outputs[base + n_exp + j] } else { 1.0 };
                e += e_j * b;
            }
            outputs.push(e);
        }
    }

    fn linear_outputs(&self, lin: &[f64], outputs: &mut Vec<f64>, lin_idx: &mut usize) {
        normalise_linear_parameters(lin, self.n_fret_group(), outputs, lin_idx);
    }

    fn nonlinear_output_param_names(&self, params: &ParameterStore) -> Vec<String> {
        let mut names: Vec<String> = self
            .all_ids
            .iter()
            .map(|&id| params.get(id).name.clone())
            .collect();
        for i in 0..self.n_fret_populations {
            names.push(format!("E_{}", i + 1));
        }
        names
    }

    fn linear_output_param_names(&self) -> Vec<String> {
        let mut names = vec!["I_0".to_string()];
        if self.n_fret_group() > 1 {
            if self.include_donor_only {
                names.push("gamma_0".to_string());
            }
            for i in 0..self.n_fret_populations {
                names.push(format!("gamma_{}", i + 1));
            }
        }
        names
    }

    fn channel_factor_names(&self) -> Vec<String> {
        let mut names = vec!["Donor".to_string()];
        if self.include_acceptor {
            names.push("Acceptor".to_string());
        }
        names
    }

    fn channel_factors(&self, index: usize) -> Result<&[f64], ModelError> {
        match index {
            0 => self.donor.channel_factors(0),
            1 if self.include_acceptor => Ok(&self.acceptor_channel_factors),
            _ => Err(ModelError::BadChannelFactorIndex(index)),
        }
    }

    fn set_channel_factors(&mut self, index: usize, factors: Vec<f64>) -> Result<(), ModelError> {
        match index {
            0 => self.donor.set_channel_factors(0, factors),
            1 if self.include_acceptor => {
                self.acceptor_channel_factors = factors;
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
        n_pop: usize,
        donor_only: bool,
        acceptor: bool,
    ) -> (FretDecayGroup, ParameterStore, Arc<DataContext>) {
        let mut store = ParameterStore::new();
        let mut group = FretDecayGroup::new(n_exp, n_pop, donor_only, &mut store);
        if acceptor {
            group.set_include_acceptor(true, &mut store);
        }
        for &id in group.parameter_ids() {
            // brightness A only allows Fixed
            let _ = store.set_fitting_mode(id, FittingMode::FittedGlobally);
        }
        let ctx = gaussian_irf_context(256, 1, 48.0);
        group.set_context(&ctx);
        group.init(&store).unwrap();
        (group, store, ctx)
    }

    fn model_columns(group: &mut FretDecayGroup, params: &ParameterStore, alf: &[f64]) -> Vec<f64> {
        let n_meas = group.donor.context().n_meas();
        group.set_variables(params, alf);
        let mut buf = vec![0.0; n_meas * group.num_components()];
        let mut cols = ColumnsMut::new(&mut buf, n_meas);
        let mut kappa = 0.0;
        group.calculate_model(&mut cols, &mut kappa, 0);
        buf
    }

    #[test]
    fn column_and_parameter_counts() {
        let (group, _, _) = setup(2, 2, true, true);
        // donor only + two populations
        assert_eq!(group.num_components(), 3);
        // 2 taus, 2 betas, 2 tauTs, Q, Qsigma, tauA
        assert_eq!(group.num_nonlinear_parameters(), 9);
    }

    #[test]
    fn transfer_lifetime_is_floored() {
        let (mut group, store, _) = setup(1, 1, false, false);
        group.set_variables(&store, &[3000.0, 1.0]);
        assert_eq!(group.tau_transfer[0][0], MIN_FRET_LIFETIME);
    }

    #[test]
    fn quenched_population_decays_faster_than_donor() {
        let (mut group, store, ctx) = setup(1, 1, true, false);
        let cols = model_columns(&mut group, &store, &[3000.0, 500.0]);

        let n = ctx.n_meas();
        // equal early intensity assumption not needed: compare tail ratios
        let donor_ratio = cols[n - 1] / cols[n / 2];
        let fret_ratio = cols[2 * n - 1] / cols[n + n / 2];
        assert!(fret_ratio < donor_ratio);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let (mut group, store, ctx) = setup(2, 1, true, true);
        let n_meas = ctx.n_meas();

        // taus, betas, tauT, Q, Qsigma, tauA
        let alf = [3500.0, 1200.0, 0.6, 0.4, 900.0, 1.5, 0.2, 4200.0];
        group.set_variables(&store, &alf);

        let n_cols = group.num_components();
        assert_eq!(n_cols, 2); // donor only + one population

        let n_derv_cols = 2 * n_cols // taus
            + 2 * n_cols             // betas
            + 1                      // tauT
            + 1                      // Q (populations only)
            + n_cols                 // Qsigma
            + n_cols; // tauA
        let mut dbuf = vec![0.0; n_meas * n_derv_cols];
        let mut dcols = ColumnsMut::new(&mut dbuf, n_meas);
        let mut slots = vec![0.0; 8];
        let mut kd = KappaDerivatives::new(&mut slots);
        assert_eq!(group.calculate_derivatives(&mut dcols, &mut kd), n_derv_cols);

        // map derivative columns back to (variable, model column)
        let mut pairs = Vec::new();
        for v in 0..4 {
            for c in 0..n_cols {
                pairs.push((v, c));
            }
        }
        pairs.push((4, 1)); // tauT_1
        pairs.push((5, 1)); // Q
        for c in 0..n_cols {
            pairs.push((6, c)); // Qsigma
        }
        for c in 0..n_cols {
            pairs.push((7, c)); // tauA
        }
        assert_eq!(pairs.len(), n_derv_cols);

        let mut probe = group.clone();
        for (derv_col, &(v, c)) in pairs.iter().enumerate() {
            let h = alf[v].abs().max(0.1) * 1e-5;
            let fd = central_difference(|a| model_columns(&mut probe, &store, a), &alf, v, h);
            for i in 0..n_meas {
                assert_relative_eq!(
                    dbuf[derv_col * n_meas + i],
                    fd[c * n_meas + i],
                    max_relative = 1e-3,
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn incidence_matches_derivative_column_count() {
        let (group, store, _) = setup(2, 2, true, true);

        let mut inc = IncidenceMatrix::new();
        let mut row = 0;
        let mut col = 0;
        group.setup_inc_matrix(&store, &mut inc, &mut row, &mut col);

        assert_eq!(row, group.num_nonlinear_parameters());
        assert_eq!(col, group.num_components());

        let n_meas = group.donor.context().n_meas();
        let mut group = group.clone();
        let alf = [3500.0, 1200.0, 0.6, 0.4, 900.0, 1800.0, 1.5, 0.2, 4200.0];
        group.set_variables(&store, &alf);

        let mut dbuf = vec![0.0; n_meas * inc.count_ones()];
        let mut dcols = ColumnsMut::new(&mut dbuf, n_meas);
        let mut slots = vec![0.0; 9];
        let mut kd = KappaDerivatives::new(&mut slots);
        assert_eq!(group.calculate_derivatives(&mut dcols, &mut kd), inc.count_ones());
    }

    #[test]
    fn efficiency_outputs_follow_quenching() {
        let (group, store, _) = setup(1, 1, false, false);

        let mut outputs = Vec::new();
        let mut idx = 0;
        group.nonlinear_outputs(&store, &[4000.0, 1000.0], &mut outputs, &mut idx);

        // tau, A, tauT, E
        assert_eq!(outputs.len(), 4);
        let e = outputs[3];
        let expected = 1.0 - (1.0 / (1.0 / 4000.0 + 1.0 / 1000.0)) / 4000.0;
        assert_relative_eq!(e, expected, max_relative = 1e-12);
    }

    #[test]
    fn reported_lifetimes_respect_the_floor() {
        let (group, store, _) = setup(1, 1, false, true);

        let mut outputs = Vec::new();
        let mut idx = 0;
        // tauT and tauA driven below the floor
        group.nonlinear_outputs(&store, &[4000.0, 5.0, 1.0, 0.1, 10.0], &mut outputs, &mut idx);

        // tau, A, tauT, Q, Qsigma, tauA, E
        assert_eq!(outputs[2], MIN_FRET_LIFETIME);
        assert_eq!(outputs[5], MIN_FRET_LIFETIME);
    }

    #[test]
    fn static_kappa_broadens_transfer() {
        let mut store = ParameterStore::new();
        let mut group = FretDecayGroup::new(1, 1, false, &mut store);
        group.set_kappa_factor(KappaFactor::static_model());
        for &id in group.parameter_ids() {
            let _ = store.set_fitting_mode(id, FittingMode::FittedGlobally);
        }
        let ctx = gaussian_irf_context(256, 1, 48.0);
        group.set_context(&ctx);
        group.init(&store).unwrap();

        group.set_variables(&store, &[3000.0, 800.0]);
        assert_eq!(group.tau_transfer[0].len(), KappaFactor::static_model().len());

        let mut buf = vec![0.0; ctx.n_meas()];
        let mut cols = ColumnsMut::new(&mut buf, ctx.n_meas());
        let mut kappa = 0.0;
        assert_eq!(group.calculate_model(&mut cols, &mut kappa, 0), 1);
        assert!(buf.iter().all(|v| v.is_finite()));
        assert!(buf.iter().any(|&v| v > 0.0));
    }
}
