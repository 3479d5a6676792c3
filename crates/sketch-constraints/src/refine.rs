//! Iterative refinement of nonlinear constraints.
//!
//! Each constraint is a scalar error function that is zero exactly when the
//! geometric relation holds, plus the partial derivatives of that error with
//! respect to every point it involves. Points are addressed by their slot in a
//! flat parameter vector laid out as `[x0, y0, x1, y1, ...]`.

use std::fmt;

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub type ErrorFn = Box<dyn Fn(&[f64]) -> f64>;
pub type GradientFn = Box<dyn Fn(&[f64]) -> Vector2<f64>>;

/// Position of the point stored in `slot`.
pub fn point_at(params: &[f64], slot: usize) -> Point2<f64> {
    Point2::new(params[2 * slot], params[2 * slot + 1])
}

/// How far a violated constraint moves its points in one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepRule {
    /// Fixed-rate gradient descent: every point moves by
    /// `-rate * error * gradient`. Only stable when the error and gradient
    /// scales are small; quadratic error terms such as line/circle tangency
    /// can diverge.
    Gradient { rate: f64 },
    /// First-order Newton step for the single constraint: every point moves
    /// by `-relaxation * error * gradient / |gradient|²`, which zeroes a
    /// linearized error when `relaxation` is 1.
    Newton { relaxation: f64 },
}

impl Default for StepRule {
    fn default() -> Self {
        StepRule::Newton { relaxation: 1.0 }
    }
}

/// Partial derivative of a constraint's error with respect to one point.
pub struct GradientSpec {
    pub slot: usize,
    pub partial: GradientFn,
}

impl GradientSpec {
    pub fn new(slot: usize, partial: impl Fn(&[f64]) -> Vector2<f64> + 'static) -> Self {
        Self {
            slot,
            partial: Box::new(partial),
        }
    }
}

struct NonlinearConstraint {
    error: ErrorFn,
    gradients: Vec<GradientSpec>,
}

/// Settings for one call to [`RefinementEngine::solve`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub step: StepRule,
}

/// Outcome of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refinement {
    /// Number of sweeps performed.
    pub iterations: usize,
    /// Sum of |error| over all constraints after the last sweep.
    pub total_error: f64,
    pub converged: bool,
}

#[derive(Default)]
pub struct RefinementEngine {
    constraints: Vec<NonlinearConstraint>,
}

impl fmt::Debug for RefinementEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefinementEngine")
            .field("constraints", &self.constraints.len())
            .finish()
    }
}

impl RefinementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an error function and the gradients of every point it reads.
    pub fn add_constraint(
        &mut self,
        error: impl Fn(&[f64]) -> f64 + 'static,
        gradients: Vec<GradientSpec>,
    ) {
        self.constraints.push(NonlinearConstraint {
            error: Box::new(error),
            gradients,
        });
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn clear(&mut self) {
        self.constraints.clear();
    }

    /// Sum of |error| over all constraints. Non-finite errors count as zero.
    pub fn total_error(&self, params: &[f64]) -> f64 {
        self.constraints
            .iter()
            .map(|c| (c.error)(params))
            .filter(|e| e.is_finite())
            .map(f64::abs)
            .sum()
    }

    /// Sweep over the constraints in insertion order, moving the points of
    /// every violated constraint, until the summed error drops below the
    /// tolerance or the iteration cap is reached.
    pub fn solve(&self, params: &mut [f64], settings: &RefineSettings) -> Refinement {
        if self.constraints.is_empty() {
            return Refinement {
                iterations: 0,
                total_error: 0.0,
                converged: true,
            };
        }

        let mut iterations = 0;
        for sweep in 0..settings.max_iterations {
            iterations = sweep + 1;
            let mut sweep_error = 0.0;

            for constraint in &self.constraints {
                let error = (constraint.error)(params);
                if !error.is_finite() {
                    continue;
                }
                sweep_error += error.abs();
                if error.abs() < settings.tolerance {
                    continue;
                }
                apply_step(constraint, error, params, settings.step);
            }

            trace!(sweep, sweep_error, "refinement sweep");
            if sweep_error < settings.tolerance {
                break;
            }
        }

        let total_error = self.total_error(params);
        let converged = total_error < settings.tolerance;
        debug!(iterations, total_error, converged, "refinement finished");
        Refinement {
            iterations,
            total_error,
            converged,
        }
    }
}

fn apply_step(constraint: &NonlinearConstraint, error: f64, params: &mut [f64], rule: StepRule) {
    let gradients: Vec<(usize, Vector2<f64>)> = constraint
        .gradients
        .iter()
        .map(|g| (g.slot, (g.partial)(params)))
        .collect();

    let factor = match rule {
        StepRule::Gradient { rate } => rate * error,
        StepRule::Newton { relaxation } => {
            let norm_sq: f64 = gradients.iter().map(|(_, g)| g.norm_squared()).sum();
            if norm_sq < f64::EPSILON {
                return;
            }
            relaxation * error / norm_sq
        }
    };

    for (slot, gradient) in gradients {
        let delta = gradient * -factor;
        if !(delta.x.is_finite() && delta.y.is_finite()) {
            continue;
        }
        params[2 * slot] += delta.x;
        params[2 * slot + 1] += delta.y;
    }
}
