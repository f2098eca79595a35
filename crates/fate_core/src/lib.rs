pub mod action;
pub mod arclength;
pub mod autodiff;
pub mod error;
pub mod fate;
pub mod field;
pub mod graph;
pub mod init_path;
pub mod integration;
pub mod lap;
pub mod optimize;
pub mod path;
pub mod solvers;
/// The `fate_core` crate predicts where cells go under a learned vector field and
/// finds the most probable transition paths between cell states.
///
/// Key components:
/// - **Traits**: `VectorField` (velocity and Jacobian of a field), `Steppable` (solvers).
/// - **Integration**: batched forward/backward integration on time grids, flat-tail
///   trimming, resampling and averaging, plus an adaptive dense-output variant.
/// - **Fate**: time horizon estimation and fate prediction from embedded cells.
/// - **Least action**: graph-seeded initial paths, the discretised action with its
///   gradient, BFGS minimization and the resulting `LeastActionPath`.
/// - **Autodiff**: dual numbers for exact Jacobians of generic fields.
pub mod traits;
pub mod trajectory;

pub use error::FateError;
pub use fate::{fate, fate_from_cells, FateSettings};
pub use integration::{integrate_vector_field, integrate_vector_field_ivp, Direction};
pub use lap::{least_action, least_action_path, LapSettings, LeastActionSolution};
pub use path::Path;
pub use traits::VectorField;
pub use trajectory::{LeastActionPath, Trajectory};
