use crate::error::ModelError;

use serde::{Deserialize, Serialize};

/// How a [FittingParameter] participates in the fit
///
/// `Fixed` parameters keep their initial value, `FittedLocally` parameters
/// are estimated independently for every pixel by the linear stage of the
/// solver, and `FittedGlobally` parameters occupy one slot of the shared
/// non-linear parameter vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FittingMode {
    Fixed,
    FittedLocally,
    FittedGlobally,
}

/// One fittable scalar with bounds, an initial value and a fitting mode
///
/// The identity fields (name, bounds, scale) are set at construction and
/// never change; only the fitting mode is mutated between fit
/// configurations, through [FittingParameter::set_fitting_mode].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FittingParameter {
    pub name: String,
    pub initial_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Suggested rescaling for the external optimizer; the engine itself
    /// always works with unscaled values.
    pub scale_factor: f64,
    fitting_mode: FittingMode,
    allowed_modes: Vec<FittingMode>,
}

impl FittingParameter {
    pub fn new(
        name: impl Into<String>,
        initial_value: f64,
        lower_bound: f64,
        upper_bound: f64,
        scale_factor: f64,
        allowed_modes: Vec<FittingMode>,
        fitting_mode: FittingMode,
    ) -> Self {
        Self {
            name: name.into(),
            initial_value,
            lower_bound,
            upper_bound,
            scale_factor,
            fitting_mode,
            allowed_modes,
        }
    }

    /// A parameter that is either fixed or fitted globally, starting fixed
    pub fn fixed_or_global(name: impl Into<String>, initial_value: f64) -> Self {
        Self::new(
            name,
            initial_value,
            f64::NEG_INFINITY,
            f64::INFINITY,
            1.0,
            vec![FittingMode::Fixed, FittingMode::FittedGlobally],
            FittingMode::Fixed,
        )
    }

    /// A parameter that can never leave its initial value
    pub fn fixed(name: impl Into<String>, initial_value: f64) -> Self {
        Self::new(
            name,
            initial_value,
            f64::NEG_INFINITY,
            f64::INFINITY,
            1.0,
            vec![FittingMode::Fixed],
            FittingMode::Fixed,
        )
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale_factor = scale;
        self
    }

    pub fn fitting_mode(&self) -> FittingMode {
        self.fitting_mode
    }

    pub fn set_fitting_mode(&mut self, mode: FittingMode) -> Result<(), ModelError> {
        if !self.allowed_modes.contains(&mode) {
            return Err(ModelError::DisallowedFittingMode {
                name: self.name.clone(),
                mode,
            });
        }
        self.fitting_mode = mode;
        Ok(())
    }

    pub fn is_fixed(&self) -> bool {
        self.fitting_mode == FittingMode::Fixed
    }

    pub fn is_fitted_globally(&self) -> bool {
        self.fitting_mode == FittingMode::FittedGlobally
    }

    /// Current value of this parameter for one evaluation
    ///
    /// Globally fitted parameters consume the next slot of the non-linear
    /// parameter vector, advancing `cursor`; all others report the initial
    /// value. This is the single place where the "one slot per globally
    /// fitted parameter" rule lives.
    pub fn value(&self, values: &[f64], cursor: &mut usize) -> f64 {
        if self.is_fitted_globally() {
            let v = values[*cursor];
            *cursor += 1;
            v
        } else {
            self.initial_value
        }
    }
}

/// Handle into a [ParameterStore]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(usize);

/// Central arena for every [FittingParameter] of a model
///
/// The model owns the store; decay groups hold [ParamId] handles only, so
/// there is exactly one owner allowed to mutate fitting modes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterStore {
    params: Vec<FittingParameter>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, param: FittingParameter) -> ParamId {
        self.params.push(param);
        ParamId(self.params.len() - 1)
    }

    pub fn get(&self, id: ParamId) -> &FittingParameter {
        &self.params[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut FittingParameter {
        &mut self.params[id.0]
    }

    pub fn set_fitting_mode(&mut self, id: ParamId, mode: FittingMode) -> Result<(), ModelError> {
        self.get_mut(id).set_fitting_mode(mode)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
