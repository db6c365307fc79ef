use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Discrete quadrature over the FRET orientation factor κ²
///
/// The dipole-orientation average is handled by a fixed set of samples
/// rather than a closed form: sample `k` carries a probability weight
/// `p[k]` and a transfer-rate scale `f[k]` relative to the dynamic
/// (κ² = 2/3) average.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KappaFactor {
    pub p: Vec<f64>,
    pub f: Vec<f64>,
}

const N_KAPPA_STATIC: usize = 30;

impl KappaFactor {
    /// Dynamic (fast-rotation) regime: orientations average out before
    /// transfer, a single effective sample suffices
    pub fn dynamic() -> Self {
        Self {
            p: vec![1.0],
            f: vec![1.0],
        }
    }

    /// Static regime: dipoles frozen over the transfer timescale, sampled on
    /// a fixed grid where each sample carries the exact probability mass of
    /// its bin under the isotropic κ² distribution
    pub fn static_model() -> Self {
        STATIC_KAPPA.clone()
    }

    pub fn len(&self) -> usize {
        self.p.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p.is_empty()
    }
}

lazy_static! {
    static ref STATIC_KAPPA: KappaFactor = build_static_table(N_KAPPA_STATIC);
}

/// Cumulative distribution of κ² for isotropically distributed static
/// dipoles, supported on [0, 4]
///
/// The density is `ln(2+√3) / (2√3·√κ²)` below κ² = 1 and
/// `ln((2+√3)/(√κ² + √(κ²-1))) / (2√3·√κ²)` above; both branches integrate
/// in closed form, which sidesteps the 1/√κ² singularity at the origin
fn kappa_squared_cdf(k2: f64) -> f64 {
    let root3 = 3.0f64.sqrt();
    let c = f64::ln(2.0 + root3);
    if k2 <= 0.0 {
        0.0
    } else if k2 <= 1.0 {
        c * k2.sqrt() / root3
    } else if k2 < 4.0 {
        let u = k2.sqrt();
        let s = (u * u - 1.0).sqrt();
        (c * u - u * f64::ln(u + s) + s) / root3
    } else {
        1.0
    }
}

fn build_static_table(n: usize) -> KappaFactor {
    let width = 4.0 / n as f64;
    let p = (0..n)
        .map(|k| kappa_squared_cdf((k + 1) as f64 * width) - kappa_squared_cdf(k as f64 * width))
        .collect();

    // rate scale relative to the dynamic average kappa^2 = 2/3
    let f = (0..n)
        .map(|k| (k as f64 + 0.5) * width / (2.0 / 3.0))
        .collect();

    KappaFactor { p, f }
}
