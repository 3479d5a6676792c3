use serde::{Deserialize, Serialize};

use crate::point::PointId;

/// A line segment between two points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start: PointId,
    pub end: PointId,
}

impl Segment {
    pub fn new(start: PointId, end: PointId) -> Self {
        Self { start, end }
    }
}

/// Anything with a center point and a radius: circles and arcs alike.
pub trait CenteredRadial {
    fn center(&self) -> PointId;
    fn radius(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub center: PointId,
    pub radius: f64,
}

/// A circular arc. Angles are in radians, counter-clockwise from +X.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircularArc {
    pub center: PointId,
    pub radius: f64,
    pub start_angle: f64,
    pub end_angle: f64,
}

impl CenteredRadial for Circle {
    fn center(&self) -> PointId {
        self.center
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}

impl CenteredRadial for CircularArc {
    fn center(&self) -> PointId {
        self.center
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}

/// One side of a tangency relation.
#[derive(Clone, Copy)]
pub enum TangentTarget<'a> {
    Curve(&'a dyn CenteredRadial),
    Segment(Segment),
}

impl<'a> From<&'a Circle> for TangentTarget<'a> {
    fn from(circle: &'a Circle) -> Self {
        TangentTarget::Curve(circle)
    }
}

impl<'a> From<&'a CircularArc> for TangentTarget<'a> {
    fn from(arc: &'a CircularArc) -> Self {
        TangentTarget::Curve(arc)
    }
}

impl From<Segment> for TangentTarget<'_> {
    fn from(segment: Segment) -> Self {
        TangentTarget::Segment(segment)
    }
}
