#![doc = include_str!("../README.md")]


mod buffers;
pub use buffers::{ColumnsMut, KappaDerivatives};

mod context;
pub use context::DataContext;

mod convolver;
pub use convolver::Convolver;

pub mod decay_group;
pub use decay_group::{
    AnisotropyDecayGroup, DecayGroup, DecayGroupTrait, FretDecayGroup, MultiExponentialDecayGroup,
    OffsetDecayGroup, PatternDecayGroup, ScatterDecayGroup,
};

mod error;
pub use error::ModelError;

mod inc_matrix;
pub use inc_matrix::{IncidenceMatrix, MAX_COLUMNS, MAX_VARIABLES};

mod irf;
pub use irf::{Irf, IrfType};

mod kappa;
pub use kappa::KappaFactor;

mod model;
pub use model::{DecayModel, OutputNames};

mod parameter;
pub use parameter::{FittingMode, FittingParameter, ParamId, ParameterStore};

mod validate;
pub use validate::{validate_derivatives, DerivativeCheck, DerivativeReport};
