//! Geometric constraints and the equations they register.
//!
//! | Constraint    | Kind      | Equation                                              |
//! |---------------|-----------|-------------------------------------------------------|
//! | horizontal    | linear    | `p1.y == p2.y`                                        |
//! | vertical      | linear    | `p1.x == p2.x`                                        |
//! | parallel      | linear    | `Δ × Δref == 0`                                       |
//! | perpendicular | linear    | `Δ · Δref == 0`                                       |
//! | angle         | linear    | `-sin θ·Δx + cos θ·Δy == 0`, θ = ∠Δref + angle       |
//! | length        | nonlinear | `‖Δ‖ - length`                                        |
//! | tangent (c/c) | nonlinear | `‖c2 - c1‖ - (r1 + r2)`                               |
//! | tangent (l/c) | nonlinear | `abs((c - a) × (b - a)) / ‖b - a‖ - r`                |
//!
//! where `Δ = p2 - p1` is the constrained segment. Reference segments are read
//! once, when the constraint is added; their direction is baked into the
//! equation as constants.

use nalgebra::{Point2, Vector2};
use tracing::{debug, instrument, warn};

use crate::entity::{CenteredRadial, Segment, TangentTarget};
use crate::error::ConstraintError;
use crate::linear::Var;
use crate::point::{PointId, PointStore};
use crate::refine::{GradientSpec, point_at};
use crate::solver::SketchSolver;

/// z-component of the 2D cross product.
fn cross(u: Vector2<f64>, v: Vector2<f64>) -> f64 {
    u.x * v.y - u.y * v.x
}

fn reference_direction(points: &impl PointStore, reference: Segment) -> Result<Vector2<f64>, ConstraintError> {
    let start = points
        .position(reference.start)
        .ok_or(ConstraintError::MissingPoint(reference.start))?;
    let end = points
        .position(reference.end)
        .ok_or(ConstraintError::MissingPoint(reference.end))?;
    Ok(end - start)
}

/// Unit vector from `a` to `b`, or zero when the points coincide.
fn unit_between(params: &[f64], a: usize, b: usize, epsilon: f64) -> Vector2<f64> {
    let d = point_at(params, b) - point_at(params, a);
    let len = d.norm();
    if len < epsilon { Vector2::zeros() } else { d / len }
}

/// Slots involved in a line/circle tangency, plus the fixed radius.
///
/// The error is the unsigned distance from the center to the segment's line,
/// minus the radius. Its gradient is normal to the segment, so a step moves
/// the line without changing the segment's length.
#[derive(Debug, Clone, Copy)]
struct LineCircle {
    center: usize,
    start: usize,
    end: usize,
    radius: f64,
    epsilon: f64,
}

impl LineCircle {
    /// Center, segment endpoints and segment length, or `None` for a
    /// zero-length segment.
    fn frame(&self, params: &[f64]) -> Option<(Point2<f64>, Point2<f64>, Point2<f64>, f64)> {
        let c = point_at(params, self.center);
        let a = point_at(params, self.start);
        let b = point_at(params, self.end);
        let len = (b - a).norm();
        (len >= self.epsilon).then_some((c, a, b, len))
    }

    /// Signed distance from the center to the line, positive on the left of
    /// `start -> end`.
    fn signed_distance(c: Point2<f64>, a: Point2<f64>, b: Point2<f64>, len: f64) -> f64 {
        cross(c - a, b - a) / len
    }

    fn error(&self, params: &[f64]) -> f64 {
        match self.frame(params) {
            Some((c, a, b, len)) => Self::signed_distance(c, a, b, len).abs() - self.radius,
            None => 0.0,
        }
    }

    /// Gradient of the error for the center, start and end points. A center
    /// lying on the line is pushed to the left side.
    fn gradients(&self, params: &[f64]) -> [Vector2<f64>; 3] {
        let Some((c, a, b, len)) = self.frame(params) else {
            return [Vector2::zeros(); 3];
        };
        let d = b - a;
        let n = cross(c - a, d);
        let sign = if n < 0.0 { -1.0 } else { 1.0 };
        let along = d * (n / (len * len * len));

        let center = Vector2::new(d.y, -d.x) / len;
        let start = Vector2::new(c.y - b.y, b.x - c.x) / len + along;
        let end = Vector2::new(a.y - c.y, c.x - a.x) / len - along;
        [center * sign, start * sign, end * sign]
    }
}

impl SketchSolver {
    /// Constrain `p1` and `p2` to the same y coordinate.
    #[instrument(skip(self), level = "debug")]
    pub fn add_horizontal_constraint(&mut self, p1: PointId, p2: PointId) -> Result<(), ConstraintError> {
        let (_, y1) = self.vars(p1)?;
        let (_, y2) = self.vars(p2)?;
        self.linear.add_equality(y1, y2);
        debug!("added horizontal constraint");
        Ok(())
    }

    /// Constrain `p1` and `p2` to the same x coordinate.
    #[instrument(skip(self), level = "debug")]
    pub fn add_vertical_constraint(&mut self, p1: PointId, p2: PointId) -> Result<(), ConstraintError> {
        let (x1, _) = self.vars(p1)?;
        let (x2, _) = self.vars(p2)?;
        self.linear.add_equality(x1, x2);
        debug!("added vertical constraint");
        Ok(())
    }

    /// Keep `target` parallel to the current direction of `reference`.
    ///
    /// A zero-length reference produces the trivial equation `0 == 0`; callers
    /// wanting to reject that case must check the reference themselves.
    #[instrument(skip(self, points), level = "debug")]
    pub fn add_parallel_constraint(
        &mut self,
        points: &impl PointStore,
        target: Segment,
        reference: Segment,
    ) -> Result<(), ConstraintError> {
        let ((x1, y1), (x2, y2)) = self.segment_vars(target)?;
        let d = reference_direction(points, reference)?;
        self.warn_if_degenerate(d);
        self.linear.add_equality((y2 - y1) * d.x - (x2 - x1) * d.y, 0.0);
        debug!("added parallel constraint");
        Ok(())
    }

    /// Keep `target` perpendicular to the current direction of `reference`.
    ///
    /// Same degenerate-reference behavior as
    /// [`add_parallel_constraint`](Self::add_parallel_constraint).
    #[instrument(skip(self, points), level = "debug")]
    pub fn add_perpendicular_constraint(
        &mut self,
        points: &impl PointStore,
        target: Segment,
        reference: Segment,
    ) -> Result<(), ConstraintError> {
        let ((x1, y1), (x2, y2)) = self.segment_vars(target)?;
        let d = reference_direction(points, reference)?;
        self.warn_if_degenerate(d);
        self.linear.add_equality((y2 - y1) * d.y + (x2 - x1) * d.x, 0.0);
        debug!("added perpendicular constraint");
        Ok(())
    }

    /// Keep `target` at `degrees` counter-clockwise from the current direction
    /// of `reference`. The relation is between lines, so the opposite
    /// direction also satisfies it.
    #[instrument(skip(self, points), level = "debug")]
    pub fn add_angle_constraint(
        &mut self,
        points: &impl PointStore,
        target: Segment,
        reference: Segment,
        degrees: f64,
    ) -> Result<(), ConstraintError> {
        if !degrees.is_finite() {
            return Err(ConstraintError::InvalidValue {
                what: "angle",
                value: degrees,
            });
        }
        let ((x1, y1), (x2, y2)) = self.segment_vars(target)?;
        let d = reference_direction(points, reference)?;
        let epsilon = self.config.degeneracy_epsilon;
        if d.x.abs() < epsilon && d.y.abs() < epsilon {
            warn!("rejected angle constraint against a zero-length reference");
            return Err(ConstraintError::DegenerateReference);
        }

        let (sin, cos) = (d.y.atan2(d.x) + degrees.to_radians()).sin_cos();
        self.linear.add_equality((x2 - x1) * -sin + (y2 - y1) * cos, 0.0);
        debug!("added angle constraint");
        Ok(())
    }

    /// Keep `p1` and `p2` exactly `length` apart.
    #[instrument(skip(self), level = "debug")]
    pub fn add_length_constraint(&mut self, p1: PointId, p2: PointId, length: f64) -> Result<(), ConstraintError> {
        if !length.is_finite() || length < 0.0 {
            return Err(ConstraintError::InvalidValue {
                what: "length",
                value: length,
            });
        }
        let a = self.slot(p1)?;
        let b = self.slot(p2)?;
        self.push_length(a, b, length);
        debug!("added length constraint");
        Ok(())
    }

    /// Make two curves, or a curve and a segment, tangent.
    ///
    /// Two circles or arcs are kept externally tangent (centers `r1 + r2`
    /// apart). A circle or arc and a segment keep the segment's line at
    /// distance `r` from the center; a zero-length segment always counts as
    /// satisfied. Radii are read when the constraint is added.
    #[instrument(skip_all, level = "debug")]
    pub fn add_tangent_constraint<'a>(
        &mut self,
        a: impl Into<TangentTarget<'a>>,
        b: impl Into<TangentTarget<'a>>,
    ) -> Result<(), ConstraintError> {
        match (a.into(), b.into()) {
            (TangentTarget::Curve(first), TangentTarget::Curve(second)) => {
                let distance = first.radius() + second.radius();
                if !distance.is_finite() {
                    return Err(ConstraintError::InvalidValue {
                        what: "radius",
                        value: distance,
                    });
                }
                let c1 = self.slot(first.center())?;
                let c2 = self.slot(second.center())?;
                self.push_length(c1, c2, distance);
                debug!(distance, "added circle/circle tangent constraint");
                Ok(())
            }
            (TangentTarget::Curve(curve), TangentTarget::Segment(segment))
            | (TangentTarget::Segment(segment), TangentTarget::Curve(curve)) => {
                let radius = curve.radius();
                if !radius.is_finite() {
                    return Err(ConstraintError::InvalidValue {
                        what: "radius",
                        value: radius,
                    });
                }
                let term = LineCircle {
                    center: self.slot(curve.center())?,
                    start: self.slot(segment.start)?,
                    end: self.slot(segment.end)?,
                    radius,
                    epsilon: self.config.degeneracy_epsilon,
                };
                self.refinement.add_constraint(
                    move |p| term.error(p),
                    vec![
                        GradientSpec::new(term.center, move |p| term.gradients(p)[0]),
                        GradientSpec::new(term.start, move |p| term.gradients(p)[1]),
                        GradientSpec::new(term.end, move |p| term.gradients(p)[2]),
                    ],
                );
                debug!(radius, "added line/circle tangent constraint");
                Ok(())
            }
            (TangentTarget::Segment(_), TangentTarget::Segment(_)) => Err(ConstraintError::UnsupportedTangent),
        }
    }

    fn push_length(&mut self, a: usize, b: usize, target: f64) {
        let epsilon = self.config.degeneracy_epsilon;
        self.refinement.add_constraint(
            move |p| (point_at(p, b) - point_at(p, a)).norm() - target,
            vec![
                GradientSpec::new(a, move |p| -unit_between(p, a, b, epsilon)),
                GradientSpec::new(b, move |p| unit_between(p, a, b, epsilon)),
            ],
        );
    }

    fn segment_vars(&self, segment: Segment) -> Result<((Var, Var), (Var, Var)), ConstraintError> {
        Ok((self.vars(segment.start)?, self.vars(segment.end)?))
    }

    fn warn_if_degenerate(&self, direction: Vector2<f64>) {
        let epsilon = self.config.degeneracy_epsilon;
        if direction.x.abs() < epsilon && direction.y.abs() < epsilon {
            warn!("reference segment has near-zero length, constraint is trivially satisfied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn numeric_gradient(f: impl Fn(&[f64]) -> f64, params: &[f64], slot: usize) -> Vector2<f64> {
        let h = 1e-6;
        let mut probe = params.to_vec();
        let mut partial = |i: usize| {
            let orig = probe[i];
            probe[i] = orig + h;
            let plus = f(&probe);
            probe[i] = orig - h;
            let minus = f(&probe);
            probe[i] = orig;
            (plus - minus) / (2.0 * h)
        };
        Vector2::new(partial(2 * slot), partial(2 * slot + 1))
    }

    #[test]
    fn test_line_circle_gradients_match_finite_differences() {
        let term = LineCircle {
            center: 0,
            start: 1,
            end: 2,
            radius: 5.0,
            epsilon: 1e-9,
        };
        let params = [10.0, 5.0, 0.5, 12.0, 19.0, 11.0];
        let error = |p: &[f64]| term.error(p);

        let analytic = term.gradients(&params);
        for (slot, grad) in analytic.iter().enumerate() {
            let numeric = numeric_gradient(error, &params, slot);
            assert_abs_diff_eq!(grad.x, numeric.x, epsilon = 1e-3 * grad.x.abs().max(1.0));
            assert_abs_diff_eq!(grad.y, numeric.y, epsilon = 1e-3 * grad.y.abs().max(1.0));
        }
    }

    #[test]
    fn test_line_circle_error_zero_when_tangent() {
        let term = LineCircle {
            center: 0,
            start: 1,
            end: 2,
            radius: 5.0,
            epsilon: 1e-9,
        };
        assert_abs_diff_eq!(term.error(&[10.0, 5.0, 0.0, 10.0, 20.0, 10.0]), 0.0);
        assert_abs_diff_eq!(term.error(&[10.0, 5.0, 0.0, 0.0, 20.0, 0.0]), 0.0);
        assert!(term.error(&[10.0, 5.0, 0.0, 12.0, 20.0, 12.0]) > 0.0);
        assert!(term.error(&[10.0, 5.0, 0.0, 8.0, 20.0, 8.0]) < 0.0);
    }

    #[test]
    fn test_line_circle_gradient_is_normal_to_segment() {
        let term = LineCircle {
            center: 0,
            start: 1,
            end: 2,
            radius: 5.0,
            epsilon: 1e-9,
        };
        for params in [[10.0, 5.0, 0.0, 30.0, 20.0, 30.0], [10.0, 5.0, 0.0, 5.0, 20.0, 5.0]] {
            let [center, start, end] = term.gradients(&params);
            assert_abs_diff_eq!(start.x, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(end.x, 0.0, epsilon = 1e-12);
            // Center and line move apart along the normal.
            assert!(center.y * start.y < 0.0);
        }
    }

    #[test]
    fn test_line_circle_zero_length_segment_is_satisfied() {
        let term = LineCircle {
            center: 0,
            start: 1,
            end: 2,
            radius: 5.0,
            epsilon: 1e-9,
        };
        assert_eq!(term.error(&[10.0, 5.0, 3.0, 3.0, 3.0, 3.0]), 0.0);
        assert_eq!(term.gradients(&[10.0, 5.0, 3.0, 3.0, 3.0, 3.0]), [Vector2::zeros(); 3]);
    }

    #[test]
    fn test_unit_between_coincident_points_is_zero() {
        let params = [2.0, 2.0, 2.0, 2.0];
        assert_eq!(unit_between(&params, 0, 1, 1e-9), Vector2::zeros());
        let params = [0.0, 0.0, 3.0, 4.0];
        assert_abs_diff_eq!(unit_between(&params, 0, 1, 1e-9), Vector2::new(0.6, 0.8));
    }
}
