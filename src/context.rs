use crate::error::ModelError;
use crate::irf::Irf;

use std::sync::Arc;

/// Shared per-fit description of the transformed data
///
/// Owned by the caller, shared by reference with the model and every decay
/// group. Must be attached exactly once before [crate::DecayModel::init] and
/// is immutable for the life of a fit.
#[derive(Clone, Debug)]
pub struct DataContext {
    /// Time bins per detector channel
    pub n_t: usize,
    /// Detector channels
    pub n_chan: usize,
    /// Detector counts recorded per detected photon
    pub counts_per_photon: f64,
    pub irf: Option<Arc<Irf>>,
}

impl DataContext {
    pub fn new(n_t: usize, n_chan: usize, counts_per_photon: f64, irf: Arc<Irf>) -> Arc<Self> {
        Arc::new(Self {
            n_t,
            n_chan,
            counts_per_photon,
            irf: Some(irf),
        })
    }

    /// Total measurements per pixel, channel blocks concatenated
    pub fn n_meas(&self) -> usize {
        self.n_t * self.n_chan
    }

    pub fn irf(&self) -> Result<&Arc<Irf>, ModelError> {
        self.irf.as_ref().ok_or(ModelError::MissingIrf)
    }
}
