use std::collections::HashMap;

use nalgebra::Point2;

use crate::linear::{LinearSystem, Var};
use crate::point::PointId;

/// The pair of linear variables standing in for one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binding {
    pub point: PointId,
    pub x: Var,
    pub y: Var,
}

/// Non-owning lookup from point identity to solver variables.
///
/// Bindings are kept in registration order; a binding's position in that order
/// is its slot in the refinement parameter vector.
#[derive(Debug, Clone, Default)]
pub struct PointRegistry {
    bindings: Vec<Binding>,
    slots: HashMap<PointId, usize>,
}

impl PointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `point` to a fresh variable pair initialized to `at`. Returns the
    /// point's slot; registering an already known point returns its existing
    /// slot and allocates nothing.
    pub fn register(&mut self, point: PointId, at: Point2<f64>, linear: &mut LinearSystem) -> usize {
        if let Some(&slot) = self.slots.get(&point) {
            return slot;
        }
        let slot = self.bindings.len();
        let x = linear.add_variable(at.x);
        let y = linear.add_variable(at.y);
        self.bindings.push(Binding { point, x, y });
        self.slots.insert(point, slot);
        slot
    }

    pub fn slot(&self, point: PointId) -> Option<usize> {
        self.slots.get(&point).copied()
    }

    pub fn binding(&self, point: PointId) -> Option<&Binding> {
        self.slot(point).map(|slot| &self.bindings[slot])
    }

    pub fn contains(&self, point: PointId) -> bool {
        self.slots.contains_key(&point)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
        self.slots.clear();
    }
}
