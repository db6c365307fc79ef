use criterion::{criterion_group, criterion_main, Criterion};
use flim_decay_model::{
    DataContext, DecayModel, FittingMode, FretDecayGroup, Irf, IrfType,
    MultiExponentialDecayGroup,
};
use ndarray::Array2;
use std::hint::black_box;
use std::sync::Arc;

fn gaussian_context(n_t: usize, n_chan: usize, dt: f64) -> Arc<DataContext> {
    let centre = 8.0;
    let sigma = 2.0;
    let norm = sigma * dt * (2.0 * std::f64::consts::PI).sqrt();
    let samples = Array2::from_shape_fn((n_chan, n_t), |(_, i)| {
        let x = (i as f64 - centre) / sigma;
        (-0.5 * x * x).exp() / norm
    });
    let irf = Arc::new(Irf::new(samples, 0.0, dt, IrfType::Scatter));
    DataContext::new(n_t, n_chan, 1.0, irf)
}

fn fit_globally(model: &mut DecayModel) {
    for id in model.parameter_ids() {
        let _ = model
            .params_mut()
            .set_fitting_mode(id, FittingMode::FittedGlobally);
    }
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

pub fn bench_multi_exponential(c: &mut Criterion) {
    let ctx = gaussian_context(256, 1, 48.0);

    for n_exp in [1, 2, 3] {
        let mut model = DecayModel::new();
        model.set_context(&ctx);
        let group = MultiExponentialDecayGroup::new(n_exp, false, model.params_mut());
        model.add_decay_group(group);
        fit_globally(&mut model);
        model.init().unwrap();

        let dim = ctx.n_meas();
        let mut a = vec![0.0; dim * (model.num_columns() + 1)];
        let mut b = vec![0.0; dim * model.num_derivatives()];
        let mut kap = vec![0.0; 1 + model.num_nonlinear_variables()];
        let alf = model.initial_variables();

        c.bench_function(format!("{n_exp}-exp model").as_str(), |bch| {
            bch.iter(|| {
                model
                    .calculate_model(black_box(&mut a), dim, &mut kap, black_box(&alf), 0)
                    .unwrap()
            });
        });
        c.bench_function(format!("{n_exp}-exp derivatives").as_str(), |bch| {
            bch.iter(|| {
                model
                    .calculate_derivatives(black_box(&mut b), dim, &mut kap, black_box(&alf), 0)
                    .unwrap()
            });
        });
    }
}

pub fn bench_fret(c: &mut Criterion) {
    let ctx = gaussian_context(256, 2, 48.0);

    let mut model = DecayModel::new();
    model.set_context(&ctx);
    let mut group = FretDecayGroup::new(2, 2, true, model.params_mut());
    group.set_include_acceptor(true, model.params_mut());
    model.add_decay_group(group);
    fit_globally(&mut model);
    model.init().unwrap();

    let dim = ctx.n_meas();
    let mut a = vec![0.0; dim * (model.num_columns() + 1)];
    let mut b = vec![0.0; dim * model.num_derivatives()];
    let mut kap = vec![0.0; 1 + model.num_nonlinear_variables()];
    let alf = model.initial_variables();

    c.bench_function("FRET model", |bch| {
        bch.iter(|| {
            model
                .calculate_model(black_box(&mut a), dim, &mut kap, black_box(&alf), 0)
                .unwrap()
        });
    });
    c.bench_function("FRET derivatives", |bch| {
        bch.iter(|| {
            model
                .calculate_derivatives(black_box(&mut b), dim, &mut kap, black_box(&alf), 0)
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_multi_exponential, bench_fret);
criterion_main!(benches);
