//! 2D geometric constraint solver for interactive sketching.
//!
//! Points belong to the caller's scene and are addressed by [`PointId`]. A
//! [`SketchSolver`] session binds registered points to solver variables,
//! collects linear constraints (horizontal, vertical, parallel, perpendicular,
//! angle) and nonlinear ones (length, tangency), and on [`SketchSolver::solve`]
//! runs the linear stage followed by nonlinear refinement, writing the result
//! back into the scene's [`PointStore`].

pub mod catalog;
pub mod entity;
pub mod error;
pub mod linear;
pub mod point;
pub mod refine;
pub mod registry;
pub mod solver;

pub use entity::{CenteredRadial, Circle, CircularArc, Segment, TangentTarget};
pub use error::ConstraintError;
pub use linear::{LinearExpr, LinearSystem, Var};
pub use point::{PointId, PointStore};
pub use refine::{GradientSpec, RefinementEngine, StepRule};
pub use registry::PointRegistry;
pub use solver::*;
