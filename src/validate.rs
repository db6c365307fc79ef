//! CHKDER-style validation of the analytic Jacobian
//!
//! Ported from the MINPACK CHKDER scoring scheme (Garbow, Hillstrom, More,
//! Argonne National Laboratory, 1980): for every (variable, column) pair the
//! incidence matrix declares, the analytic derivative column is compared
//! against a forward difference of the model, and each measurement is scored
//! on a log scale between 0 (no agreement) and 1 (full agreement to
//! rounding). A pair fails when its mean score drops below 0.5.

use crate::decay_group::DecayGroupTrait;
use crate::error::ModelError;
use crate::model::DecayModel;

use log::{debug, warn};

const FACTOR: f64 = 100.0;
const PASS_THRESHOLD: f64 = 0.5;

/// Score for one (variable, column) pair of the incidence matrix
#[derive(Clone, Debug)]
pub struct DerivativeCheck {
    /// Name of the perturbed parameter
    pub parameter: String,
    /// Index into the non-linear parameter vector
    pub variable: usize,
    /// Model column the derivative belongs to
    pub column: usize,
    /// Mean CHKDER score over all measurements, in `[0, 1]`
    pub mean_err: f64,
}

impl DerivativeCheck {
    pub fn passed(&self) -> bool {
        self.mean_err >= PASS_THRESHOLD
    }
}

/// Full diagnostics from [validate_derivatives]
#[derive(Clone, Debug, Default)]
pub struct DerivativeReport {
    pub checks: Vec<DerivativeCheck>,
}

impl DerivativeReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(DerivativeCheck::passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &DerivativeCheck> {
        self.checks.iter().filter(|c| !c.passed())
    }
}

/// Names of the non-linear variables in parameter-vector order
fn variable_names(model: &DecayModel) -> Vec<String> {
    let mut names = Vec::new();
    for &id in &[model.reference_lifetime_id(), model.t0_id()] {
        let p = model.params().get(id);
        if p.is_fitted_globally() {
            names.push(p.name.clone());
        }
    }
    for g in model.groups() {
        for &id in g.parameter_ids() {
            let p = model.params().get(id);
            if p.is_fitted_globally() {
                names.push(p.name.clone());
            }
        }
    }
    names
}

/// Verify every analytic derivative column against a forward difference
///
/// Evaluates the model at its initial variables, then perturbs one variable
/// at a time by `sqrt(ε)·|value|` and scores the declared derivative columns
/// with the MINPACK CHKDER scheme. Structural counts are cross-checked
/// first: the model must produce exactly the column and derivative counts
/// the incidence matrix declares.
///
/// Returns the full report on success; a structural mismatch or any pair
/// scoring below 0.5 is an error carrying the diagnostics.
pub fn validate_derivatives(model: &mut DecayModel) -> Result<DerivativeReport, ModelError> {
    let epsmch = f64::EPSILON;
    let eps = epsmch.sqrt();
    let epsf = FACTOR * epsmch;
    let epslog = eps.log10();

    let n_nonlinear = model.num_nonlinear_variables();
    let n_cols = model.num_columns();
    let n_der = model.num_derivatives();
    let inc = model.incidence_matrix()?.clone();

    let dim = model
        .context()
        .ok_or(ModelError::MissingContext)?
        .n_meas();

    let mut a = vec![0.0; dim * (n_cols + 1)];
    let mut ap = vec![0.0; dim * (n_cols + 1)];
    let mut b = vec![0.0; dim * n_der];
    let mut kap = vec![0.0; 1 + n_nonlinear];

    let alf = model.initial_variables();

    let n_col_real = model.calculate_model(&mut a, dim, &mut kap, &alf, 0)?;
    let n_der_real = model.calculate_derivatives(&mut b, dim, &mut kap, &alf, 0)?;

    if n_col_real != n_cols {
        return Err(ModelError::StructuralMismatch {
            kind: "columns",
            actual: n_col_real,
            expected: n_cols,
        });
    }
    if n_der_real != n_der {
        return Err(ModelError::StructuralMismatch {
            kind: "derivatives",
            actual: n_der_real,
            expected: n_der,
        });
    }

    let names = variable_names(model);
    debug_assert_eq!(names.len(), n_nonlinear);
    // the reference lifetime occupies a vector slot but no incidence row
    let ref_offset = model.reference_fitted() as usize;

    let mut report = DerivativeReport::default();
    let mut err = vec![0.0; dim];
    let mut m = 0;

    for i in 0..n_nonlinear - ref_offset {
        for j in 0..n_cols {
            if !inc.get(i, j) {
                continue;
            }

            let var = i + ref_offset;
            let mut alf_p = alf.clone();
            let mut temp = eps * alf[var].abs();
            if temp == 0.0 {
                temp = eps;
            }
            alf_p[var] += temp;

            model.calculate_model(&mut ap, dim, &mut kap, &alf_p, 0)?;

            let fvec = &a[dim * j..dim * (j + 1)];
            let fvecp = &ap[dim * j..dim * (j + 1)];
            let fjac = &b[dim * m..dim * (m + 1)];

            let scale = {
                let t = alf[var].abs();
                if t == 0.0 { 1.0 } else { t }
            };
            for k in 0..dim {
                err[k] = scale * fjac[k];
            }

            for k in 0..dim {
                let mut temp = 1.0;
                if fvec[k] != 0.0
                    && fvecp[k] != 0.0
                    && (fvecp[k] - fvec[k]).abs() >= epsf * fvec[k].abs()
                {
                    temp = eps * ((fvecp[k] - fvec[k]) / eps - err[k]).abs()
                        / (fvec[k].abs() + fvecp[k].abs());
                }
                err[k] = 1.0;
                if temp > epsmch && temp < eps {
                    err[k] = (temp.log10() - epslog) / epslog;
                }
                if temp >= eps {
                    err[k] = 0.0;
                }
                if err[k] == 0.0 && fvec[k] - fvecp[k] == 0.0 {
                    err[k] = 1.0;
                }
            }

            let mean_err = err.iter().sum::<f64>() / dim as f64;

            let check = DerivativeCheck {
                parameter: names[var].clone(),
                variable: var,
                column: j,
                mean_err,
            };
            if check.passed() {
                debug!(
                    "derivative check: {} -> column {}: mean score {:.3}",
                    check.parameter, check.column, check.mean_err
                );
            } else {
                warn!(
                    "derivative check FAILED: {} -> column {}: mean score {:.3}",
                    check.parameter, check.column, check.mean_err
                );
            }
            report.checks.push(check);

            m += 1;
        }
    }

    if report.passed() {
        Ok(report)
    } else {
        Err(ModelError::DerivativeValidation { report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decay_group::{
        FretDecayGroup, MultiExponentialDecayGroup, OffsetDecayGroup, ScatterDecayGroup,
    };
    use crate::decay_group::DecayGroupTrait;
    use crate::model::DecayModel;
    use crate::parameter::FittingMode;
    use crate::tests::gaussian_irf_context;

    fn fit_all_globally(model: &mut DecayModel) {
        for id in model.parameter_ids() {
            let _ = model.params_mut().set_fitting_mode(id, FittingMode::FittedGlobally);
        }
        // t0 stays fixed unless a test opts in; its numerical derivative is
        // checked separately
        let t0 = model.t0_id();
        let ref_lifetime = model.reference_lifetime_id();
        model
            .params_mut()
            .set_fitting_mode(t0, FittingMode::Fixed)
            .unwrap();
        model
            .params_mut()
            .set_fitting_mode(ref_lifetime, FittingMode::Fixed)
            .unwrap();
    }

    fn model_with(groups: Vec<crate::decay_group::DecayGroup>) -> DecayModel {
        let ctx = gaussian_irf_context(256, 1, 48.0);
        let mut model = DecayModel::new();
        model.set_context(&ctx);
        for g in groups {
            model.add_decay_group(g);
        }
        model
    }

    fn boxcar_context(n_t: usize) -> std::sync::Arc<crate::context::DataContext> {
        use crate::irf::{Irf, IrfType};
        use ndarray::Array2;

        let mut samples = Array2::zeros((1, n_t));
        samples[[0, 0]] = 1.0;
        let irf = std::sync::Arc::new(Irf::new(samples, 0.0, 25.0, IrfType::Scatter));
        crate::context::DataContext::new(n_t, 1, 1.0, irf)
    }

    #[test]
    fn multi_exponential_derivatives_validate() {
        let ctx = boxcar_context(256);
        let mut model = DecayModel::new();
        model.set_context(&ctx);
        let group = MultiExponentialDecayGroup::new(3, true, model.params_mut());
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        model.init().unwrap();

        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
        // 3 taus + 3 betas, one column
        assert_eq!(report.checks.len(), 6);
        assert!(report.checks.iter().all(|c| c.mean_err >= 0.5));
    }

    #[test]
    fn global_contributions_validate() {
        let mut model = model_with(vec![]);
        let group = MultiExponentialDecayGroup::new(2, true, model.params_mut());
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        model.init().unwrap();

        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
        // 2 taus + 2 betas, one column
        assert_eq!(report.checks.len(), 4);
    }

    #[test]
    fn fret_with_acceptor_validates() {
        let mut model = model_with(vec![]);
        let mut group = FretDecayGroup::new(2, 2, true, model.params_mut());
        group.set_include_acceptor(true, model.params_mut());
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        model.init().unwrap();

        assert_eq!(model.num_columns(), 3);

        let dim = 256;
        let mut a = vec![0.0; dim * 4];
        let mut kap = vec![0.0; 1 + model.num_nonlinear_variables()];
        let alf = model.initial_variables();
        model.calculate_model(&mut a, dim, &mut kap, &alf, 0).unwrap();
        assert!(a.iter().all(|v| v.is_finite()));

        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
        assert!(report.checks.iter().all(|c| c.mean_err.is_finite()));
    }

    #[test]
    fn t0_numerical_derivative_validates() {
        let mut model = model_with(vec![]);
        let group = MultiExponentialDecayGroup::new(1, false, model.params_mut());
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        let t0 = model.t0_id();
        model
            .params_mut()
            .set_fitting_mode(t0, FittingMode::FittedGlobally)
            .unwrap();
        model.params_mut().get_mut(t0).initial_value = 10.0;
        model.init().unwrap();

        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
    }

    #[test]
    fn degenerate_lifetimes_fail_validation() {
        // identical initial values trigger the +20 safeguard: the analytic
        // derivative is taken at the perturbed lifetime while the finite
        // difference steps off the degenerate point and skips the safeguard,
        // so the first lifetime of the pair cannot agree
        let mut model = model_with(vec![]);
        let group = MultiExponentialDecayGroup::new(2, false, model.params_mut());
        for &id in group.parameter_ids().to_vec().iter() {
            model.params_mut().get_mut(id).initial_value = 2500.0;
        }
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        model.init().unwrap();

        let err = validate_derivatives(&mut model).unwrap_err();
        let ModelError::DerivativeValidation { report } = err else {
            panic!("expected a derivative validation failure");
        };
        assert!(report.failed_checks().all(|c| c.parameter == "tau_1"));
        assert!(report.failed_checks().count() > 0);
    }

    #[test]
    fn nearly_degenerate_lifetimes_validate() {
        // distinct by more than the safeguard offset, so no perturbation
        let mut model = model_with(vec![]);
        let group = MultiExponentialDecayGroup::new(2, false, model.params_mut());
        let ids = group.parameter_ids().to_vec();
        model.params_mut().get_mut(ids[0]).initial_value = 2530.0;
        model.params_mut().get_mut(ids[1]).initial_value = 2500.0;
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        model.init().unwrap();

        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
    }

    #[test]
    fn single_exponential_fret_validates() {
        let mut model = model_with(vec![]);
        let group = FretDecayGroup::new(1, 1, false, model.params_mut());
        model.add_decay_group(group);
        fit_all_globally(&mut model);
        model.init().unwrap();

        // one donor lifetime and one transfer lifetime, one column
        assert_eq!(model.num_nonlinear_variables(), 2);
        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
        assert_eq!(report.checks.len(), 2);
    }

    #[test]
    fn background_groups_validate_trivially() {
        let mut model = model_with(vec![ScatterDecayGroup::new().into()]);
        let offset = OffsetDecayGroup::new(model.params_mut());
        model.add_decay_group(offset);
        model.init().unwrap();

        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
        assert!(report.checks.is_empty());
    }

    #[test]
    fn random_lifetimes_validate() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        use rand_distr::LogNormal;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let lifetime = LogNormal::new(2000.0_f64.ln(), 0.5).unwrap();

        for _ in 0..10 {
            let mut model = model_with(vec![]);
            let group = MultiExponentialDecayGroup::new(2, true, model.params_mut());
            for &id in group.parameter_ids().to_vec().iter().take(2) {
                model.params_mut().get_mut(id).initial_value = rng.sample(lifetime);
            }
            model.add_decay_group(group);
            fit_all_globally(&mut model);
            model.init().unwrap();

            let report = validate_derivatives(&mut model).unwrap();
            assert!(report.passed());
        }
    }

    #[test]
    fn combined_groups_validate() {
        let mut model = model_with(vec![]);
        let g1 = MultiExponentialDecayGroup::new(2, true, model.params_mut());
        let g2 = MultiExponentialDecayGroup::new(1, true, model.params_mut());
        model.add_decay_group(g1);
        model.add_decay_group(g2);
        fit_all_globally(&mut model);
        model.init().unwrap();

        assert_eq!(model.num_columns(), 2);
        let report = validate_derivatives(&mut model).unwrap();
        assert!(report.passed());
        // taus and betas of the first group, tau of the second
        assert_eq!(report.checks.len(), 5);
    }
}
