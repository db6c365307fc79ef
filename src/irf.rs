use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};

/// Origin of the instrument response samples
///
/// `Reference` marks an IRF measured against a reference fluorophore of
/// known lifetime; the model then applies reference-lifetime normalisation
/// during convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrfType {
    Scatter,
    Reference,
    Gaussian,
}

/// Sampled instrument response function, one trace per detector channel
///
/// Loaded once by the caller and read-only to the engine. Optionally carries
/// a per-pixel t0 map or a full per-pixel set of traces for spatially
/// variant instruments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Irf {
    /// `(n_chan, n_irf)` samples
    samples: Array2<f64>,
    /// `(n_rep, n_chan, n_irf)` per-pixel samples, indexed by `irf_idx`
    image_samples: Option<Array3<f64>>,
    t0_image: Option<Vec<f64>>,
    pub timebin_t0: f64,
    pub timebin_width: f64,
    pub irf_type: IrfType,
}

impl Irf {
    pub fn new(samples: Array2<f64>, timebin_t0: f64, timebin_width: f64, irf_type: IrfType) -> Self {
        assert!(timebin_width > 0.0, "time bin width must be positive");
        Self {
            samples,
            image_samples: None,
            t0_image: None,
            timebin_t0,
            timebin_width,
            irf_type,
        }
    }

    /// Spatially variant IRF: one trace set per pixel, selected by `irf_idx`
    pub fn with_image_irf(mut self, image_samples: Array3<f64>) -> Self {
        assert_eq!(image_samples.shape()[1..], *self.samples.shape());
        self.image_samples = Some(image_samples);
        self
    }

    /// Per-pixel t0 shifts, overriding the caller-supplied shift
    pub fn with_t0_image(mut self, t0_image: Vec<f64>) -> Self {
        self.t0_image = Some(t0_image);
        self
    }

    pub fn num_channels(&self) -> usize {
        self.samples.nrows()
    }

    pub fn num_bins(&self) -> usize {
        self.samples.ncols()
    }

    /// IRF traces for one pixel at the requested t0 shift
    ///
    /// A shift of exactly zero returns the stored samples untouched. Any
    /// other shift is produced by a sub-bin Catmull-Rom shift written into
    /// `storage`, which must have the same shape as the stored samples.
    pub fn irf<'a>(
        &'a self,
        irf_idx: usize,
        t0_shift: f64,
        storage: &'a mut Array2<f64>,
    ) -> ArrayView2<'a, f64> {
        if let Some(image) = &self.image_samples {
            return image.index_axis(ndarray::Axis(0), irf_idx);
        }

        let t0_shift = match &self.t0_image {
            Some(map) => map[irf_idx],
            None => t0_shift,
        };

        if t0_shift == 0.0 {
            return self.samples.view();
        }

        self.shift_irf(t0_shift, storage);
        storage.view()
    }

    /// Sub-bin shift by piecewise cubic interpolation
    ///
    /// Bins whose 4-point window would leave `[0, n_irf)` hold the boundary
    /// sample instead of extrapolating.
    fn shift_irf(&self, t0_shift: f64, storage: &mut Array2<f64>) {
        let n_irf = self.num_bins() as isize;

        let shift = -t0_shift / self.timebin_width;
        let c_shift = shift.floor();
        let f_shift = shift - c_shift;
        let c_shift = c_shift as isize;

        let start = 0.max(1 - c_shift).min(n_irf - 1);
        let end = n_irf.min(n_irf - c_shift - 3).max(1);

        for (row, out) in self.samples.rows().into_iter().zip(storage.rows_mut()) {
            let y = row.as_slice().expect("IRF samples are contiguous");
            let out = out.into_slice().expect("IRF storage is contiguous");

            for i in 0..start as usize {
                out[i] = y[0];
            }
            for i in start..end {
                let w = (i + c_shift - 1) as usize;
                debug_assert!(w + 3 < y.len());
                out[i as usize] = cubic_interpolate(&y[w..w + 4], f_shift);
            }
            for i in end as usize..y.len() {
                out[i] = y[y.len() - 1];
            }
        }
    }
}

/// Catmull-Rom interpolation between `y[1]` and `y[2]`, `mu` in `[0, 1)`
fn cubic_interpolate(y: &[f64], mu: f64) -> f64 {
    let mu2 = mu * mu;
    let a0 = -0.5 * y[0] + 1.5 * y[1] - 1.5 * y[2] + 0.5 * y[3];
    let a1 = y[0] - 2.5 * y[1] + 2.0 * y[2] - 0.5 * y[3];
    let a2 = -0.5 * y[0] + 0.5 * y[2];
    let a3 = y[1];

    a0 * mu * mu2 + a1 * mu2 + a2 * mu + a3
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn gaussian_irf(n: usize, center: f64, sigma: f64) -> Irf {
        let trace = Array1::from_shape_fn(n, |i| {
            let x = (i as f64 - center) / sigma;
            f64::exp(-0.5 * x * x)
        });
        Irf::new(
            trace.insert_axis(ndarray::Axis(0)),
            0.0,
            1.0,
            IrfType::Scatter,
        )
    }

    #[test]
    fn zero_shift_returns_stored_trace() {
        let irf = gaussian_irf(64, 20.0, 3.0);
        let mut storage = Array2::zeros((1, 64));
        let view = irf.irf(0, 0.0, &mut storage);
        // binary identical, no interpolation applied
        assert_eq!(view, irf.samples.view());
        assert!(storage.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn shift_round_trip_recovers_trace() {
        let irf = gaussian_irf(128, 40.0, 5.0);
        let s = 0.7;

        let mut fwd = Array2::zeros((1, 128));
        irf.shift_irf(s, &mut fwd);
        let shifted = Irf::new(fwd.clone(), 0.0, 1.0, IrfType::Scatter);

        let mut back = Array2::zeros((1, 128));
        shifted.shift_irf(-s, &mut back);

        // interior bins only, the boundary is held flat
        for i in 8..120 {
            assert_relative_eq!(back[[0, i]], irf.samples[[0, i]], epsilon = 1e-3);
        }
    }

    #[test]
    fn whole_bin_shift_translates_peak() {
        let irf = gaussian_irf(64, 20.0, 2.0);
        let mut storage = Array2::zeros((1, 64));
        // +2 bins of t0 delays the IRF by two bins
        let view = irf.irf(0, 2.0, &mut storage);
        let peak = view
            .row(0)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(peak, 22);
    }

    #[test]
    fn image_irf_selects_per_pixel_trace() {
        let irf = gaussian_irf(32, 10.0, 2.0);
        let image = ndarray::Array3::from_shape_fn((2, 1, 32), |(p, _, i)| {
            (p * 100 + i) as f64
        });
        let irf = irf.with_image_irf(image);

        let mut storage = Array2::zeros((1, 32));
        let view = irf.irf(1, 0.0, &mut storage);
        assert_eq!(view[[0, 0]], 100.0);
        assert_eq!(view[[0, 31]], 131.0);
    }

    #[test]
    fn survives_serde_round_trip() {
        let irf = gaussian_irf(32, 10.0, 2.0).with_t0_image(vec![0.5]);
        let json = serde_json::to_string(&irf).unwrap();
        let back: Irf = serde_json::from_str(&json).unwrap();

        assert_eq!(back.samples, irf.samples);
        assert_eq!(back.timebin_width, irf.timebin_width);
        assert_eq!(back.irf_type, irf.irf_type);
        assert_eq!(back.t0_image, irf.t0_image);
    }

    #[test]
    fn t0_image_overrides_shift() {
        let irf = gaussian_irf(64, 20.0, 2.0).with_t0_image(vec![0.0, 1.0]);
        let mut storage = Array2::zeros((1, 64));
        // pixel 0 has zero shift regardless of the argument
        let view = irf.irf(0, 5.0, &mut storage);
        assert_eq!(view, irf.samples.view());
    }
}
