use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::ConstraintError;
use crate::linear::{LinearSystem, STRONG, Var, WEAK};
use crate::point::{PointId, PointStore};
use crate::refine::{RefineSettings, RefinementEngine, StepRule};
use crate::registry::PointRegistry;

/// Tunables for a solver session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Maximum refinement sweeps per solve.
    pub max_iterations: usize,
    /// Errors below this are treated as satisfied.
    pub tolerance: f64,
    /// Step rule for nonlinear refinement.
    pub step: StepRule,
    /// Weight of a suggested value while a point is dragged.
    pub edit_strength: f64,
    /// Weight keeping otherwise free variables at their current value.
    pub stay_strength: f64,
    /// Reference segments and point separations shorter than this are
    /// considered degenerate.
    pub degeneracy_epsilon: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
            step: StepRule::default(),
            edit_strength: STRONG,
            stay_strength: WEAK,
            degeneracy_epsilon: 1e-9,
        }
    }
}

impl SolverConfig {
    fn refine_settings(&self) -> RefineSettings {
        RefineSettings {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            step: self.step,
        }
    }
}

/// Summary of one [`SketchSolver::solve`] call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    /// Refinement sweeps performed.
    pub iterations: usize,
    /// Whether the nonlinear constraints ended below tolerance.
    pub converged: bool,
    /// Sum of |error| over the nonlinear constraints at the final positions.
    pub total_error: f64,
    /// Largest linear equality residual at the final positions.
    pub linear_residual: f64,
    /// Registered points that were missing from the store on write-back.
    pub missing_points: usize,
}

/// A constraint-solving session over externally owned points.
///
/// Linear relations (horizontal, vertical, parallel, perpendicular, angle) are
/// solved first; nonlinear ones (length, tangency) are then refined starting
/// from the linear solution. Results are written back to the point store.
#[derive(Debug)]
pub struct SketchSolver {
    pub(crate) config: SolverConfig,
    pub(crate) registry: PointRegistry,
    pub(crate) linear: LinearSystem,
    pub(crate) refinement: RefinementEngine,
}

impl Default for SketchSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SketchSolver {
    pub fn new() -> Self {
        Self::with_config(SolverConfig::default())
    }

    pub fn with_config(config: SolverConfig) -> Self {
        Self {
            config,
            registry: PointRegistry::new(),
            linear: LinearSystem::new(config.edit_strength, config.stay_strength),
            refinement: RefinementEngine::new(),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Register a point so constraints can refer to it. Registering the same
    /// point twice is a no-op.
    pub fn add_point(&mut self, points: &impl PointStore, id: PointId) -> Result<(), ConstraintError> {
        if self.registry.contains(id) {
            return Ok(());
        }
        let at = points.position(id).ok_or(ConstraintError::MissingPoint(id))?;
        let slot = self.registry.register(id, at, &mut self.linear);
        debug!(?id, slot, "registered point");
        Ok(())
    }

    pub fn is_registered(&self, id: PointId) -> bool {
        self.registry.contains(id)
    }

    pub fn point_count(&self) -> usize {
        self.registry.len()
    }

    pub fn linear_constraint_count(&self) -> usize {
        self.linear.equality_count()
    }

    pub fn nonlinear_constraint_count(&self) -> usize {
        self.refinement.len()
    }

    /// Begin dragging `id`. Starting an edit on a point already being edited
    /// is a no-op.
    pub fn start_edit(&mut self, id: PointId) -> Result<(), ConstraintError> {
        let (x, y) = self.vars(id)?;
        self.linear.begin_edit(x);
        self.linear.begin_edit(y);
        Ok(())
    }

    /// Propose a new position for a dragged point. The linear system is
    /// re-solved immediately; the point store is only updated by `solve`.
    pub fn suggest_value(&mut self, id: PointId, at: Point2<f64>) -> Result<(), ConstraintError> {
        let (x, y) = self.vars(id)?;
        if !(self.linear.is_editing(x) && self.linear.is_editing(y)) {
            return Err(ConstraintError::NotEditing(id));
        }
        self.linear.suggest_value(x, at.x);
        self.linear.suggest_value(y, at.y);
        Ok(())
    }

    /// Stop dragging `id`. The last suggested position is kept.
    pub fn end_edit(&mut self, id: PointId) -> Result<(), ConstraintError> {
        let (x, y) = self.vars(id)?;
        self.linear.end_edit(x);
        self.linear.end_edit(y);
        Ok(())
    }

    pub fn is_editing(&self, id: PointId) -> bool {
        self.registry
            .binding(id)
            .is_some_and(|b| self.linear.is_editing(b.x) || self.linear.is_editing(b.y))
    }

    /// Solve all constraints and write the result into `points`.
    ///
    /// The linear system runs first; its solution seeds the nonlinear
    /// refinement. The final positions become the stay targets of the next
    /// solve, so repeated calls keep refining from what the caller last saw.
    #[instrument(skip_all, fields(registered = self.registry.len(), linear = self.linear.equality_count(), nonlinear = self.refinement.len()))]
    pub fn solve(&mut self, points: &mut impl PointStore) -> SolveReport {
        self.linear.solve_linear();

        let values = self.linear.values();
        let mut params = Vec::with_capacity(self.registry.len() * 2);
        for binding in self.registry.iter() {
            params.push(values[binding.x.index()]);
            params.push(values[binding.y.index()]);
        }

        let refinement = self
            .refinement
            .solve(&mut params, &self.config.refine_settings());

        let mut missing_points = 0;
        for (slot, binding) in self.registry.iter().enumerate() {
            let at = Point2::new(params[2 * slot], params[2 * slot + 1]);
            self.linear.set_value(binding.x, at.x);
            self.linear.set_value(binding.y, at.y);
            if !points.set_position(binding.point, at) {
                warn!(point = ?binding.point, "registered point missing from store");
                missing_points += 1;
            }
        }

        let report = SolveReport {
            iterations: refinement.iterations,
            converged: refinement.converged,
            total_error: refinement.total_error,
            linear_residual: self.linear.max_violation(),
            missing_points,
        };
        debug!(?report, "solve finished");
        report
    }

    /// Reload every registered point's variables from the store, for points
    /// moved without going through the edit protocol.
    pub fn sync_points(&mut self, points: &impl PointStore) {
        for binding in self.registry.iter() {
            if let Some(at) = points.position(binding.point) {
                self.linear.set_value(binding.x, at.x);
                self.linear.set_value(binding.y, at.y);
            }
        }
    }

    /// Total constraint error at the store's current positions: summed
    /// nonlinear |error| plus the largest linear residual.
    pub fn residual(&self, points: &impl PointStore) -> f64 {
        let mut values = self.linear.values().to_vec();
        let mut params = Vec::with_capacity(self.registry.len() * 2);
        for binding in self.registry.iter() {
            if let Some(at) = points.position(binding.point) {
                values[binding.x.index()] = at.x;
                values[binding.y.index()] = at.y;
            }
            params.push(values[binding.x.index()]);
            params.push(values[binding.y.index()]);
        }
        self.linear.max_violation_at(&values) + self.refinement.total_error(&params)
    }

    /// Approximate remaining degrees of freedom: two per point, minus the rank
    /// of the linear equalities, minus one per nonlinear constraint. Negative
    /// values indicate an over-constrained sketch.
    pub fn degrees_of_freedom(&self) -> i64 {
        2 * self.registry.len() as i64 - self.linear.rank() as i64 - self.refinement.len() as i64
    }

    /// Forget every point and constraint. The configuration is kept.
    pub fn clear(&mut self) {
        self.linear = LinearSystem::new(self.config.edit_strength, self.config.stay_strength);
        self.refinement.clear();
        self.registry.clear();
        debug!("solver session cleared");
    }

    pub(crate) fn vars(&self, id: PointId) -> Result<(Var, Var), ConstraintError> {
        self.registry
            .binding(id)
            .map(|b| (b.x, b.y))
            .ok_or(ConstraintError::UnregisteredPoint(id))
    }

    pub(crate) fn slot(&self, id: PointId) -> Result<usize, ConstraintError> {
        self.registry
            .slot(id)
            .ok_or(ConstraintError::UnregisteredPoint(id))
    }
}
