//! Incremental solver for linear equality constraints.
//!
//! Hard equalities are enforced exactly. Subject to them, the solver picks the
//! configuration closest to a set of weighted targets:
//!
//! - an edited variable is pulled towards its suggested value with the edit
//!   strength,
//! - every other variable "stays" at its current value with the stay strength.
//!
//! This is the least-squares problem
//!
//!   minimize   Σ w_i (x_i - t_i)²
//!   subject to A x = b
//!
//! solved through its KKT system
//!
//!   | W  Aᵀ | |x|   |W t|
//!   | A  0  | |λ| = | b |
//!
//! The KKT matrix only depends on the equalities and on which variables are
//! being edited, so its pseudo-inverse is cached. Suggesting a new value or
//! re-solving after the stays moved only rebuilds the right-hand side. Redundant
//! or contradictory equalities make the KKT matrix singular; the pseudo-inverse
//! then yields the least-squares compromise instead of failing.

use std::collections::BTreeMap;
use std::ops::{Add, Mul, Neg, Sub};

use nalgebra::{DMatrix, DVector, SVD};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Weight of a suggested value while a variable is being edited.
pub const STRONG: f64 = 1e6;
/// Weight that keeps an unconstrained variable where it is.
pub const WEAK: f64 = 1.0;

/// Singular values below this fraction of the largest are treated as zero
/// when inverting the KKT matrix.
const PSEUDO_INVERSE_CUTOFF: f64 = 1e-11;

/// A scalar unknown owned by a [`LinearSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Var(usize);

impl Var {
    pub fn index(self) -> usize {
        self.0
    }
}

/// `Σ coefficient·var + constant`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearExpr {
    terms: Vec<(Var, f64)>,
    constant: f64,
}

impl LinearExpr {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    /// Append `coefficient·var`.
    pub fn term(mut self, var: Var, coefficient: f64) -> Self {
        self.terms.push((var, coefficient));
        self
    }

    /// Terms with duplicate variables merged, in variable order.
    fn collapsed(&self) -> Vec<(Var, f64)> {
        let mut merged: BTreeMap<Var, f64> = BTreeMap::new();
        for &(var, coefficient) in &self.terms {
            *merged.entry(var).or_insert(0.0) += coefficient;
        }
        merged.into_iter().collect()
    }
}

impl From<Var> for LinearExpr {
    fn from(var: Var) -> Self {
        LinearExpr::zero().term(var, 1.0)
    }
}

impl From<f64> for LinearExpr {
    fn from(value: f64) -> Self {
        LinearExpr::constant(value)
    }
}

impl Add for LinearExpr {
    type Output = LinearExpr;

    fn add(mut self, rhs: LinearExpr) -> LinearExpr {
        self.terms.extend(rhs.terms);
        self.constant += rhs.constant;
        self
    }
}

impl Neg for LinearExpr {
    type Output = LinearExpr;

    fn neg(self) -> LinearExpr {
        self * -1.0
    }
}

impl Sub for LinearExpr {
    type Output = LinearExpr;

    fn sub(self, rhs: LinearExpr) -> LinearExpr {
        self + (-rhs)
    }
}

impl Mul<f64> for LinearExpr {
    type Output = LinearExpr;

    fn mul(mut self, factor: f64) -> LinearExpr {
        for (_, coefficient) in &mut self.terms {
            *coefficient *= factor;
        }
        self.constant *= factor;
        self
    }
}

impl Sub for Var {
    type Output = LinearExpr;

    fn sub(self, rhs: Var) -> LinearExpr {
        LinearExpr::from(self).term(rhs, -1.0)
    }
}

impl Mul<f64> for Var {
    type Output = LinearExpr;

    fn mul(self, factor: f64) -> LinearExpr {
        LinearExpr::zero().term(self, factor)
    }
}

/// One hard equality `Σ c·x = rhs`, scaled so the largest |c| is 1.
#[derive(Debug, Clone)]
struct Row {
    coefficients: Vec<(Var, f64)>,
    rhs: f64,
}

impl Row {
    fn violation(&self, values: &[f64]) -> f64 {
        let lhs: f64 = self
            .coefficients
            .iter()
            .map(|(var, coefficient)| coefficient * values[var.0])
            .sum();
        (lhs - self.rhs).abs()
    }
}

/// Linear equality system with edit variables.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    values: Vec<f64>,
    rows: Vec<Row>,
    /// Edited variables and their latest suggested value.
    edits: BTreeMap<Var, f64>,
    edit_strength: f64,
    stay_strength: f64,
    /// Pseudo-inverse of the KKT matrix, dropped on structural changes.
    factorization: Option<DMatrix<f64>>,
}

impl Default for LinearSystem {
    fn default() -> Self {
        Self::new(STRONG, WEAK)
    }
}

impl LinearSystem {
    pub fn new(edit_strength: f64, stay_strength: f64) -> Self {
        Self {
            values: Vec::new(),
            rows: Vec::new(),
            edits: BTreeMap::new(),
            edit_strength,
            stay_strength,
            factorization: None,
        }
    }

    /// Allocate a new variable holding `initial`.
    pub fn add_variable(&mut self, initial: f64) -> Var {
        self.values.push(initial);
        self.invalidate();
        Var(self.values.len() - 1)
    }

    pub fn variable_count(&self) -> usize {
        self.values.len()
    }

    pub fn equality_count(&self) -> usize {
        self.rows.len()
    }

    /// Current value of `var`, or `None` if it belongs to another system.
    pub fn value(&self, var: Var) -> Option<f64> {
        self.values.get(var.0).copied()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Move a variable's current value, which is also its stay target for the
    /// next solve. Returns `false`, leaving the system unchanged, for a
    /// non-finite value or a variable from another system.
    pub fn set_value(&mut self, var: Var, value: f64) -> bool {
        match self.values.get_mut(var.0) {
            Some(slot) if value.is_finite() => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    /// Register `lhs == rhs` as a hard constraint. Returns `false` and
    /// registers nothing if the expression uses a variable from another
    /// system.
    pub fn add_equality(&mut self, lhs: impl Into<LinearExpr>, rhs: impl Into<LinearExpr>) -> bool {
        let expr = lhs.into() - rhs.into();
        let mut coefficients = expr.collapsed();
        if coefficients.iter().any(|(var, _)| var.0 >= self.values.len()) {
            warn!("rejected equality over a variable from another system");
            return false;
        }
        let mut rhs = -expr.constant;

        let scale = coefficients
            .iter()
            .map(|(_, coefficient)| coefficient.abs())
            .fold(0.0_f64, f64::max);
        if scale > 0.0 && scale.is_finite() {
            for (_, coefficient) in &mut coefficients {
                *coefficient /= scale;
            }
            rhs /= scale;
        }

        self.rows.push(Row { coefficients, rhs });
        self.invalidate();
        true
    }

    /// Start steering `var` through [`suggest_value`](Self::suggest_value).
    /// Returns `false` if it was already being edited or belongs to another
    /// system.
    pub fn begin_edit(&mut self, var: Var) -> bool {
        let Some(&current) = self.values.get(var.0) else {
            return false;
        };
        if self.edits.contains_key(&var) {
            return false;
        }
        self.edits.insert(var, current);
        self.invalidate();
        true
    }

    /// Suggest a value for an edited variable and re-solve. Returns `false`
    /// if `var` is not being edited.
    pub fn suggest_value(&mut self, var: Var, value: f64) -> bool {
        match self.edits.get_mut(&var) {
            Some(suggested) => {
                *suggested = value;
                self.resolve();
                true
            }
            None => false,
        }
    }

    /// Stop steering `var`. Its current value is kept. Returns `false` if it
    /// was not being edited.
    pub fn end_edit(&mut self, var: Var) -> bool {
        if self.edits.remove(&var).is_none() {
            return false;
        }
        self.invalidate();
        true
    }

    pub fn is_editing(&self, var: Var) -> bool {
        self.edits.contains_key(&var)
    }

    /// Recompute every variable from the equalities, suggestions and stays.
    pub fn solve_linear(&mut self) {
        self.resolve();
    }

    /// Largest residual of any equality at the current values, in the
    /// row-normalized scale.
    pub fn max_violation(&self) -> f64 {
        self.max_violation_at(&self.values)
    }

    /// Largest equality residual for an assignment covering every variable.
    pub(crate) fn max_violation_at(&self, values: &[f64]) -> f64 {
        self.rows
            .iter()
            .map(|row| row.violation(values))
            .fold(0.0_f64, f64::max)
    }

    /// Numerical rank of the equality matrix.
    pub fn rank(&self) -> usize {
        let m = self.rows.len();
        let n = self.values.len();
        if m == 0 || n == 0 {
            return 0;
        }
        let mut a = DMatrix::<f64>::zeros(m, n);
        for (r, row) in self.rows.iter().enumerate() {
            for &(var, coefficient) in &row.coefficients {
                a[(r, var.0)] = coefficient;
            }
        }
        let svd = SVD::new(a, false, false);
        let sv = &svd.singular_values;
        let max_sv = sv.iter().cloned().fold(0.0_f64, f64::max);
        let threshold = max_sv * (m.max(n) as f64) * f64::EPSILON;
        sv.iter().filter(|&&s| s > threshold).count()
    }

    fn invalidate(&mut self) {
        self.factorization = None;
    }

    fn weight(&self, var: Var) -> f64 {
        if self.edits.contains_key(&var) {
            self.edit_strength
        } else {
            self.stay_strength
        }
    }

    #[instrument(skip_all, fields(variables = self.values.len(), equalities = self.rows.len()))]
    fn factorize(&self) -> Option<DMatrix<f64>> {
        let n = self.values.len();
        let dim = n + self.rows.len();

        let mut kkt = DMatrix::<f64>::zeros(dim, dim);
        for i in 0..n {
            kkt[(i, i)] = self.weight(Var(i));
        }
        for (r, row) in self.rows.iter().enumerate() {
            for &(var, coefficient) in &row.coefficients {
                kkt[(n + r, var.0)] += coefficient;
                kkt[(var.0, n + r)] += coefficient;
            }
        }

        let svd = SVD::new(kkt, true, true);
        let max_sv = svd.singular_values.iter().cloned().fold(0.0_f64, f64::max);
        match svd.pseudo_inverse(max_sv * PSEUDO_INVERSE_CUTOFF) {
            Ok(inverse) => {
                debug!(dim, "factorized linear system");
                Some(inverse)
            }
            Err(reason) => {
                warn!(reason, "failed to factorize linear system");
                None
            }
        }
    }

    fn resolve(&mut self) {
        let n = self.values.len();
        if n == 0 {
            return;
        }
        if self.factorization.is_none() {
            self.factorization = self.factorize();
        }

        let mut rhs = DVector::<f64>::zeros(n + self.rows.len());
        for i in 0..n {
            let var = Var(i);
            let target = self.edits.get(&var).copied().unwrap_or(self.values[i]);
            rhs[i] = self.weight(var) * target;
        }
        for (r, row) in self.rows.iter().enumerate() {
            rhs[n + r] = row.rhs;
        }

        let solution = match &self.factorization {
            Some(inverse) => inverse * rhs,
            None => return,
        };
        if (0..n).any(|i| !solution[i].is_finite()) {
            warn!("linear solve produced non-finite values, keeping previous values");
            return;
        }
        for i in 0..n {
            self.values[i] = solution[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_unconstrained_variables_stay() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(3.0);
        let b = system.add_variable(-7.5);
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap(), 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(system.value(b).unwrap(), -7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_equality_splits_the_difference() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(0.0);
        let b = system.add_variable(10.0);
        system.add_equality(a, b);
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap(), 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(system.value(b).unwrap(), 5.0, epsilon = 1e-9);
        assert!(system.max_violation() < 1e-9);
    }

    #[test]
    fn test_equality_with_constant_offset() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(0.0);
        let b = system.add_variable(0.0);
        system.add_equality(a, LinearExpr::from(b) + LinearExpr::constant(3.0));
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap() - system.value(b).unwrap(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_weighted_expression() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(1.0);
        let b = system.add_variable(1.0);
        // 2a - 4b == 0
        system.add_equality(a * 2.0 - LinearExpr::from(b) * 4.0, 0.0);
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap(), 2.0 * system.value(b).unwrap(), epsilon = 1e-9);
    }

    #[test]
    fn test_edit_drives_dependent_variable() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(0.0);
        let b = system.add_variable(0.0);
        system.add_equality(a, b);

        assert!(system.begin_edit(a));
        assert!(system.suggest_value(a, 8.0));
        assert_abs_diff_eq!(system.value(a).unwrap(), 8.0, epsilon = 1e-4);
        assert_abs_diff_eq!(system.value(a).unwrap(), system.value(b).unwrap(), epsilon = 1e-9);

        assert!(system.suggest_value(a, -2.0));
        assert_abs_diff_eq!(system.value(b).unwrap(), -2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_suggest_reuses_factorization() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(0.0);
        let b = system.add_variable(1.0);
        system.add_equality(a - b, 0.0);
        system.begin_edit(b);
        system.suggest_value(b, 4.0);
        assert!(system.factorization.is_some());

        system.suggest_value(b, 6.0);
        assert!(system.factorization.is_some());

        system.add_variable(0.0);
        assert!(system.factorization.is_none());
    }

    #[test]
    fn test_edit_protocol_bookkeeping() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(1.0);

        assert!(!system.suggest_value(a, 2.0));
        assert!(system.begin_edit(a));
        assert!(!system.begin_edit(a));
        assert!(system.is_editing(a));
        assert!(system.suggest_value(a, 2.0));
        assert!(system.end_edit(a));
        assert!(!system.end_edit(a));

        // The suggestion survives the end of the edit.
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap(), 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_contradictory_equalities_stay_finite() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(1.0);
        system.add_equality(a, 0.0);
        system.add_equality(a, 5.0);
        system.solve_linear();
        assert!(system.value(a).unwrap().is_finite());
        assert!(system.max_violation() > 1.0);
    }

    #[test]
    fn test_redundant_equalities_are_harmless() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(0.0);
        let b = system.add_variable(4.0);
        system.add_equality(a, b);
        system.add_equality(b, a);
        system.add_equality(a * 3.0, b * 3.0);
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(system.value(b).unwrap(), 2.0, epsilon = 1e-9);
        assert_eq!(system.rank(), 1);
    }

    #[test]
    fn test_trivial_equality_is_ignored() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(2.0);
        system.add_equality(a * 0.0, 0.0);
        system.solve_linear();
        assert_abs_diff_eq!(system.value(a).unwrap(), 2.0, epsilon = 1e-9);
        assert_eq!(system.rank(), 0);
    }

    #[test]
    fn test_expression_terms_are_merged() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(2.0);
        let b = system.add_variable(5.0);
        let expr = (b - a) * 3.0 + LinearExpr::from(a) + LinearExpr::constant(1.0);
        assert_eq!(expr.collapsed(), vec![(a, -2.0), (b, 3.0)]);
        assert_eq!((-expr).constant, -1.0);
    }

    #[test]
    fn test_foreign_variables_are_rejected() {
        let mut small = LinearSystem::default();
        let own = small.add_variable(1.0);
        let mut large = LinearSystem::default();
        large.add_variable(0.0);
        let foreign = large.add_variable(0.0);

        assert_eq!(small.value(foreign), None);
        assert!(!small.set_value(foreign, 3.0));
        assert!(!small.begin_edit(foreign));
        assert!(!small.is_editing(foreign));
        assert!(!small.add_equality(own, foreign));
        assert_eq!(small.equality_count(), 0);

        // The system is still usable afterwards.
        assert!(small.add_equality(own, 4.0));
        small.solve_linear();
        assert_abs_diff_eq!(small.value(own).unwrap(), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_set_value_ignores_non_finite() {
        let mut system = LinearSystem::default();
        let a = system.add_variable(1.0);
        assert!(!system.set_value(a, f64::NAN));
        assert!(system.set_value(a, 2.5));
        assert_eq!(system.value(a), Some(2.5));
    }
}
