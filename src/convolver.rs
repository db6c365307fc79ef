use crate::context::DataContext;

use ndarray::Array2;
use std::sync::Arc;

/// Convolution of a single-rate exponential decay against the IRF
///
/// [Convolver::compute] evaluates, per channel, the discrete convolution of
/// `exp(-rate * t)` with the (possibly t0-shifted) instrument response, and
/// alongside it the exact derivative of that trace with respect to the
/// decay rate. The two are produced by one recursion pair,
///
/// ```text
/// d[i] = e * d[i-1] + g[i] * dt        e = exp(-rate * dt)
/// D[i] = e * (D[i-1] + dt * d[i-1])
/// ```
///
/// so `D = -∂d/∂rate` holds to machine precision. That exactness is what
/// lets the analytic Jacobian agree with finite differences of the forward
/// model down to truncation error.
#[derive(Clone, Debug)]
pub struct Convolver {
    ctx: Arc<DataContext>,
    decay: Vec<f64>,
    rate_derivative: Vec<f64>,
    shift_storage: Array2<f64>,
}

impl Convolver {
    pub fn new(ctx: &Arc<DataContext>) -> Self {
        let irf = ctx.irf.as_ref().expect("convolver requires an IRF");
        Self {
            ctx: ctx.clone(),
            decay: vec![0.0; ctx.n_meas()],
            rate_derivative: vec![0.0; ctx.n_meas()],
            shift_storage: Array2::zeros((irf.num_channels(), irf.num_bins())),
        }
    }

    /// A bank of convolvers, one per exponential component
    pub fn make_vector(n: usize, ctx: &Arc<DataContext>) -> Vec<Self> {
        (0..n).map(|_| Self::new(ctx)).collect()
    }

    /// Recompute both traces for a new decay rate and IRF position
    pub fn compute(&mut self, rate: f64, irf_idx: usize, t0_shift: f64) {
        let n_t = self.ctx.n_t;
        let irf = self.ctx.irf.as_ref().expect("convolver requires an IRF");
        let dt = irf.timebin_width;
        let g = irf.irf(irf_idx, t0_shift, &mut self.shift_storage);
        let n_irf = g.ncols();

        let e = f64::exp(-rate * dt);
        for c in 0..self.ctx.n_chan {
            let offset = c * n_t;
            let mut d = 0.0;
            let mut dd = 0.0;
            for i in 0..n_t {
                dd = e * (dd + dt * d);
                d *= e;
                if i < n_irf {
                    d += g[[c, i]] * dt;
                }
                self.decay[offset + i] = d;
                self.rate_derivative[offset + i] = dd;
            }
        }
    }

    /// Accumulate `factor * decay` into `out`, weighted per channel
    ///
    /// `bin_shift = +1` reads the trace delayed by one whole bin (flat hold
    /// past the last bin, zero before the first); used for the numerical t0
    /// derivative. `reference_lifetime` of zero means no reference
    /// normalisation.
    pub fn add_decay(
        &self,
        factor: f64,
        channel_factors: &[f64],
        reference_lifetime: f64,
        out: &mut [f64],
        bin_shift: i32,
    ) {
        self.accumulate(&self.decay, factor, channel_factors, reference_lifetime, out, bin_shift);
    }

    /// Accumulate `factor * (-∂decay/∂rate)` into `out`
    pub fn add_derivative(
        &self,
        factor: f64,
        channel_factors: &[f64],
        reference_lifetime: f64,
        out: &mut [f64],
    ) {
        self.accumulate(
            &self.rate_derivative,
            factor,
            channel_factors,
            reference_lifetime,
            out,
            0,
        );
    }

    fn accumulate(
        &self,
        trace: &[f64],
        factor: f64,
        channel_factors: &[f64],
        reference_lifetime: f64,
        out: &mut [f64],
        bin_shift: i32,
    ) {
        let n_t = self.ctx.n_t;
        debug_assert!(out.len() >= self.ctx.n_meas());
        debug_assert_eq!(channel_factors.len(), self.ctx.n_chan);

        let norm = if reference_lifetime == 0.0 {
            1.0
        } else {
            1.0 / reference_lifetime
        };

        for (c, &cf) in channel_factors.iter().enumerate() {
            let offset = c * n_t;
            let f = factor * norm * cf;
            let block = &trace[offset..offset + n_t];
            for i in 0..n_t {
                let s = i as i64 - bin_shift as i64;
                let v = if s < 0 {
                    0.0
                } else if s >= n_t as i64 {
                    block[n_t - 1]
                } else {
                    block[s as usize]
                };
                out[offset + i] += f * v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irf::{Irf, IrfType};

    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn boxcar_context(n_t: usize, n_chan: usize) -> Arc<DataContext> {
        let mut samples = Array2::zeros((n_chan, n_t));
        for c in 0..n_chan {
            samples[[c, 0]] = 1.0;
        }
        let irf = Arc::new(Irf::new(samples, 0.0, 1.0, IrfType::Scatter));
        DataContext::new(n_t, n_chan, 1.0, irf)
    }

    #[test]
    fn boxcar_convolution_is_pure_exponential() {
        let ctx = boxcar_context(64, 1);
        let mut conv = Convolver::new(&ctx);
        let rate = 0.05;
        conv.compute(rate, 0, 0.0);

        let mut out = vec![0.0; 64];
        conv.add_decay(1.0, &[1.0], 0.0, &mut out, 0);
        for (i, &v) in out.iter().enumerate() {
            assert_relative_eq!(v, f64::exp(-rate * i as f64), max_relative = 1e-12);
        }
    }

    #[test]
    fn derivative_matches_finite_difference_in_rate() {
        let ctx = boxcar_context(128, 2);
        let rate = 0.02;
        let h = 1e-7;

        let mut conv = Convolver::new(&ctx);
        let cf = [0.6, 0.4];

        conv.compute(rate + h, 0, 0.0);
        let mut hi = vec![0.0; ctx.n_meas()];
        conv.add_decay(1.0, &cf, 0.0, &mut hi, 0);

        conv.compute(rate - h, 0, 0.0);
        let mut lo = vec![0.0; ctx.n_meas()];
        conv.add_decay(1.0, &cf, 0.0, &mut lo, 0);

        conv.compute(rate, 0, 0.0);
        let mut der = vec![0.0; ctx.n_meas()];
        conv.add_derivative(1.0, &cf, 0.0, &mut der);

        for i in 0..ctx.n_meas() {
            let fd = -(hi[i] - lo[i]) / (2.0 * h);
            assert_relative_eq!(der[i], fd, max_relative = 1e-6, epsilon = 1e-12);
        }
    }

    #[test]
    fn bin_shift_delays_trace() {
        let ctx = boxcar_context(32, 1);
        let mut conv = Convolver::new(&ctx);
        conv.compute(0.1, 0, 0.0);

        let mut plain = vec![0.0; 32];
        conv.add_decay(1.0, &[1.0], 0.0, &mut plain, 0);
        let mut delayed = vec![0.0; 32];
        conv.add_decay(1.0, &[1.0], 0.0, &mut delayed, 1);

        assert_eq!(delayed[0], 0.0);
        for i in 1..32 {
            assert_eq!(delayed[i], plain[i - 1]);
        }
    }

    #[test]
    fn reference_lifetime_rescales() {
        let ctx = boxcar_context(16, 1);
        let mut conv = Convolver::new(&ctx);
        conv.compute(0.1, 0, 0.0);

        let mut plain = vec![0.0; 16];
        conv.add_decay(1.0, &[1.0], 0.0, &mut plain, 0);
        let mut normed = vec![0.0; 16];
        conv.add_decay(1.0, &[1.0], 100.0, &mut normed, 0);

        for i in 0..16 {
            assert_relative_eq!(normed[i], plain[i] / 100.0, max_relative = 1e-14);
        }
    }
}
