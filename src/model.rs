use crate::buffers::{ColumnsMut, KappaDerivatives};
use crate::context::DataContext;
use crate::decay_group::{DecayGroup, DecayGroupTrait};
use crate::error::ModelError;
use crate::inc_matrix::{IncidenceMatrix, MAX_COLUMNS, MAX_VARIABLES};
use crate::irf::IrfType;
use crate::parameter::{FittingParameter, ParamId, ParameterStore};

use log::debug;
use std::sync::Arc;

/// Composable forward model for time-resolved fluorescence decays
///
/// Owns the parameter store, an ordered list of decay groups and two shared
/// parameters: the reference-fluorophore lifetime (active only for
/// reference-type IRFs) and the global IRF shift `t0`. The model concatenates
/// the groups' basis columns into the design matrix of a variable-projection
/// solver and produces the matching analytic derivative columns, laid out as
/// dictated by the cached incidence matrix.
///
/// Usage follows a strict order: attach a context, add groups, `init()`,
/// then evaluate. Structural changes (group composition, fitting modes)
/// require another `init()`.
#[derive(Clone, Debug)]
pub struct DecayModel {
    params: ParameterStore,
    groups: Vec<DecayGroup>,
    reference_parameter: ParamId,
    t0_parameter: ParamId,
    ctx: Option<Arc<DataContext>>,
    photons_per_count: f64,
    inc: Option<IncidenceMatrix>,
    adjust_buf: Vec<f64>,
}

/// Human-readable labels for the fitted-result vectors
#[derive(Clone, Debug, PartialEq)]
pub struct OutputNames {
    /// Non-linear labels followed by linear labels, groups prefixed `"[i] "`
    pub names: Vec<String>,
    /// Originating group per label, 0 for shared parameters
    pub group_index: Vec<usize>,
    pub n_nonlinear: usize,
    pub n_linear: usize,
}

impl Default for DecayModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DecayModel {
    pub fn new() -> Self {
        let mut params = ParameterStore::new();
        let reference_parameter =
            params.insert(FittingParameter::fixed_or_global("ref_lifetime", 100.0));
        let t0_parameter = params.insert(FittingParameter::fixed_or_global("t0", 0.0));
        Self {
            params,
            groups: Vec::new(),
            reference_parameter,
            t0_parameter,
            ctx: None,
            photons_per_count: 1.0,
            inc: None,
            adjust_buf: Vec::new(),
        }
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    pub fn t0_id(&self) -> ParamId {
        self.t0_parameter
    }

    pub fn reference_lifetime_id(&self) -> ParamId {
        self.reference_parameter
    }

    pub fn groups(&self) -> &[DecayGroup] {
        &self.groups
    }

    /// All parameter handles: shared first, then group parameters in group
    /// order
    pub fn parameter_ids(&self) -> Vec<ParamId> {
        let mut ids = vec![self.reference_parameter, self.t0_parameter];
        for g in &self.groups {
            ids.extend_from_slice(g.parameter_ids());
        }
        ids
    }

    pub fn set_context(&mut self, ctx: &Arc<DataContext>) {
        self.ctx = Some(ctx.clone());
        self.photons_per_count = 1.0 / ctx.counts_per_photon;
        for g in self.groups.iter_mut() {
            g.set_context(ctx);
        }
    }

    /// Propagate the channel count to groups before a context exists
    pub fn set_num_channels(&mut self, n_chan: usize) {
        if self.ctx.is_some() {
            return;
        }
        for g in self.groups.iter_mut() {
            g.set_num_channels(n_chan);
        }
    }

    pub fn add_decay_group(&mut self, group: impl Into<DecayGroup>) {
        let mut group = group.into();
        if let Some(ctx) = &self.ctx {
            group.set_context(ctx);
        }
        self.groups.push(group);
    }

    /// Validate the configuration, initialise every group and build the
    /// cached incidence matrix
    pub fn init(&mut self) -> Result<(), ModelError> {
        let ctx = self.ctx.clone().ok_or(ModelError::MissingContext)?;
        let irf = ctx.irf()?;
        if irf.num_channels() != ctx.n_chan {
            return Err(ModelError::ChannelMismatch {
                irf: irf.num_channels(),
                data: ctx.n_chan,
            });
        }

        for g in self.groups.iter_mut() {
            g.init(&self.params)?;
        }

        let rows = self.num_incidence_rows();
        let cols = self.num_columns();
        if rows > MAX_VARIABLES || cols > MAX_COLUMNS {
            return Err(ModelError::IncidenceOverflow { rows, cols });
        }
        self.inc = Some(self.build_inc_matrix());

        self.setup_adjust();

        debug!(
            "model initialised: {} groups, {} columns, {} non-linear variables, {} derivatives",
            self.groups.len(),
            cols,
            self.num_nonlinear_variables(),
            self.num_derivatives()
        );

        Ok(())
    }

    fn reference_active(&self) -> bool {
        matches!(
            self.ctx.as_ref().and_then(|c| c.irf.as_ref()),
            Some(irf) if irf.irf_type == IrfType::Reference
        )
    }

    /// True when the reference lifetime occupies a slot of the non-linear
    /// parameter vector
    pub fn reference_fitted(&self) -> bool {
        self.reference_active() && self.params.get(self.reference_parameter).is_fitted_globally()
    }

    pub fn context(&self) -> Option<&Arc<DataContext>> {
        self.ctx.as_ref()
    }

    fn t0_fitted(&self) -> bool {
        self.params.get(self.t0_parameter).is_fitted_globally()
    }

    pub fn num_columns(&self) -> usize {
        self.groups.iter().map(|g| g.num_components()).sum()
    }

    pub fn num_nonlinear_variables(&self) -> usize {
        let groups: usize = self.groups.iter().map(|g| g.num_nonlinear_parameters()).sum();
        groups + self.reference_fitted() as usize + self.t0_fitted() as usize
    }

    /// Incidence rows: every non-linear variable except the reference
    /// lifetime, which has no analytic derivative path
    fn num_incidence_rows(&self) -> usize {
        let groups: usize = self.groups.iter().map(|g| g.num_nonlinear_parameters()).sum();
        groups + self.t0_fitted() as usize
    }

    /// Number of derivative columns produced by `calculate_derivatives`
    pub fn num_derivatives(&self) -> usize {
        self.inc.as_ref().map_or(0, |inc| inc.count_ones())
    }

    pub fn incidence_matrix(&self) -> Result<&IncidenceMatrix, ModelError> {
        self.inc.as_ref().ok_or(ModelError::NotInitialised)
    }

    fn build_inc_matrix(&self) -> IncidenceMatrix {
        let mut inc = IncidenceMatrix::new();
        let mut row = 0;
        let mut col = 0;

        let t0_row = self.t0_fitted().then(|| {
            let r = row;
            row += 1;
            r
        });

        for g in &self.groups {
            g.setup_inc_matrix(&self.params, &mut inc, &mut row, &mut col);
        }

        // the IRF shift moves every column
        if let Some(t0_row) = t0_row {
            for c in 0..col {
                inc.set(t0_row, c);
            }
        }

        inc
    }

    /// Constant (non-fitted) contribution per measurement, in count units,
    /// for subtraction from the data before fitting
    pub fn constant_adjustment(&self) -> &[f64] {
        &self.adjust_buf
    }

    fn setup_adjust(&mut self) {
        let n_meas = self.ctx.as_ref().map_or(0, |c| c.n_meas());
        self.adjust_buf.clear();
        self.adjust_buf.resize(n_meas, 0.0);

        for g in &self.groups {
            g.add_constant_contribution(&self.params, &mut self.adjust_buf);
        }

        for v in self.adjust_buf.iter_mut() {
            *v *= self.photons_per_count;
        }
    }

    fn check_variables(&self, alf: &[f64]) -> Result<(), ModelError> {
        if self.inc.is_none() {
            return Err(ModelError::NotInitialised);
        }
        let expected = self.num_nonlinear_variables();
        if alf.len() != expected {
            return Err(ModelError::ParameterVectorLength {
                actual: alf.len(),
                expected,
            });
        }
        Ok(())
    }

    /// Distribute the parameter vector to the groups and recompute their
    /// convolution state
    fn distribute_variables(&mut self, alf: &[f64], irf_idx: usize) -> usize {
        let mut idx = 0;

        let reference_lifetime = if self.reference_active() {
            self.params
                .get(self.reference_parameter)
                .value(alf, &mut idx)
        } else {
            0.0
        };
        let t0_shift = self.params.get(self.t0_parameter).value(alf, &mut idx);

        for g in self.groups.iter_mut() {
            g.set_irf_position(irf_idx, t0_shift, reference_lifetime);
            idx += g.set_variables(&self.params, &alf[idx..]);
        }

        idx
    }

    /// Evaluate the model columns for the pixel `irf_idx`
    ///
    /// `a` holds `num_columns() + 1` columns of stride `adim`; the final
    /// column is zeroed and reserved for the caller's constant adjustment.
    /// `kappa[0]` receives the soft-constraint penalty (currently zero).
    /// Returns the number of model columns written.
    pub fn calculate_model(
        &mut self,
        a: &mut [f64],
        adim: usize,
        kappa: &mut [f64],
        alf: &[f64],
        irf_idx: usize,
    ) -> Result<usize, ModelError> {
        self.check_variables(alf)?;
        self.distribute_variables(alf, irf_idx);

        kappa[0] = 0.0;
        let mut cols = ColumnsMut::new(a, adim);
        let mut col = 0;
        for g in &self.groups {
            let mut view = cols.offset(col);
            col += g.calculate_model(&mut view, &mut kappa[0], 0);
        }

        cols.clear_column(col);

        // counts -> photons
        for v in a[..adim * (col + 1)].iter_mut() {
            *v *= self.photons_per_count;
        }

        Ok(col)
    }

    /// Evaluate the derivative columns for the pixel `irf_idx`
    ///
    /// Columns appear in incidence-matrix order: the numerical t0 column
    /// block first when t0 is fitted, then each group's analytic columns.
    /// `kappa[1..]` receives the per-variable penalty derivatives.
    pub fn calculate_derivatives(
        &mut self,
        b: &mut [f64],
        bdim: usize,
        kappa: &mut [f64],
        alf: &[f64],
        irf_idx: usize,
    ) -> Result<usize, ModelError> {
        self.check_variables(alf)?;
        self.distribute_variables(alf, irf_idx);

        let n_nl = self.num_nonlinear_variables();
        let mut kappa_derv = KappaDerivatives::new(&mut kappa[1..1 + n_nl]);

        let mut col = 0;
        if self.t0_fitted() {
            col += self.add_t0_derivatives(b, bdim);
            kappa_derv.advance();
        }

        let mut cols = ColumnsMut::new(b, bdim);
        for g in &self.groups {
            let mut view = cols.offset(col);
            col += g.calculate_derivatives(&mut view, &mut kappa_derv);
        }

        for v in b[..bdim * col].iter_mut() {
            *v *= self.photons_per_count;
        }

        Ok(col)
    }

    /// Central difference of the whole model over a one-bin IRF shift
    fn add_t0_derivatives(&mut self, b: &mut [f64], bdim: usize) -> usize {
        let mut kap = 0.0;

        let mut cols = ColumnsMut::new(b, bdim);
        let mut col = 0;
        for g in &self.groups {
            let mut view = cols.offset(col);
            col += g.calculate_model(&mut view, &mut kap, -1);
        }
        for v in b[..bdim * col].iter_mut() {
            *v = -*v;
        }

        let mut shifted = vec![0.0; bdim * col];
        {
            let mut cols = ColumnsMut::new(&mut shifted, bdim);
            let mut c = 0;
            for g in &self.groups {
                let mut view = cols.offset(c);
                c += g.calculate_model(&mut view, &mut kap, 1);
            }
            debug_assert_eq!(c, col);
        }

        let idt = 0.5
            / self
                .ctx
                .as_ref()
                .and_then(|c| c.irf.as_ref())
                .expect("init checked the IRF")
                .timebin_width;
        for (v, s) in b[..bdim * col].iter_mut().zip(&shifted) {
            *v = (*v + s) * idt;
        }

        col
    }

    /// Starting non-linear parameter vector, shared parameters first
    pub fn initial_variables(&self) -> Vec<f64> {
        let mut values = vec![0.0; self.num_nonlinear_variables()];
        let mut idx = 0;

        if self.reference_fitted() {
            values[idx] = self.params.get(self.reference_parameter).initial_value;
            idx += 1;
        }
        if self.t0_fitted() {
            values[idx] = self.params.get(self.t0_parameter).initial_value;
            idx += 1;
        }

        for g in &self.groups {
            idx += g.initial_variables(&self.params, &mut values[idx..]);
        }
        debug_assert_eq!(idx, values.len());

        values
    }

    /// Fitted-result values for the non-linear stage, in
    /// [DecayModel::output_param_names] order
    pub fn nonlinear_outputs(&self, nonlin: &[f64]) -> Vec<f64> {
        let mut outputs = Vec::new();
        let mut nonlin_idx = 0;

        if self.reference_fitted() {
            outputs.push(nonlin[nonlin_idx]);
            nonlin_idx += 1;
        }
        if self.t0_fitted() {
            outputs.push(nonlin[nonlin_idx]);
            nonlin_idx += 1;
        }

        for g in &self.groups {
            g.nonlinear_outputs(&self.params, nonlin, &mut outputs, &mut nonlin_idx);
        }
        outputs
    }

    /// Fitted-result values for the linear stage
    pub fn linear_outputs(&self, lin: &[f64]) -> Vec<f64> {
        let mut outputs = Vec::new();
        let mut lin_idx = 0;
        for g in &self.groups {
            g.linear_outputs(lin, &mut outputs, &mut lin_idx);
        }
        outputs
    }

    pub fn output_param_names(&self) -> OutputNames {
        let mut names = Vec::new();
        let mut group_index = Vec::new();

        if self.reference_fitted() {
            names.push(self.params.get(self.reference_parameter).name.clone());
            group_index.push(0);
        }
        if self.t0_fitted() {
            names.push(self.params.get(self.t0_parameter).name.clone());
            group_index.push(0);
        }

        for (i, g) in self.groups.iter().enumerate() {
            let prefix = format!("[{}] ", i + 1);
            for name in g.nonlinear_output_param_names(&self.params) {
                names.push(format!("{prefix}{name}"));
                group_index.push(i + 1);
            }
        }

        let n_nonlinear = names.len();

        for (i, g) in self.groups.iter().enumerate() {
            let prefix = format!("[{}] ", i + 1);
            for name in g.linear_output_param_names() {
                names.push(format!("{prefix}{name}"));
                group_index.push(i + 1);
            }
        }

        let n_linear = names.len() - n_nonlinear;

        OutputNames {
            names,
            group_index,
            n_nonlinear,
            n_linear,
        }
    }
}
