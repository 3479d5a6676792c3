use nalgebra::Point2;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Stable identity of a sketch point owned by the scene.
    pub struct PointId;
}

/// Storage for the points a solver session refers to.
///
/// The solver never owns points. It keeps `PointId`s and reads or writes
/// coordinates through this trait, so the scene decides where points live and
/// how long they exist. Callers that drop points must `clear()` the solver
/// before solving again.
pub trait PointStore {
    /// Current coordinates of `id`, or `None` if the point no longer exists.
    fn position(&self, id: PointId) -> Option<Point2<f64>>;

    /// Overwrite the coordinates of `id`. Returns `false` if the point is gone.
    fn set_position(&mut self, id: PointId, at: Point2<f64>) -> bool;
}

impl PointStore for SlotMap<PointId, Point2<f64>> {
    fn position(&self, id: PointId) -> Option<Point2<f64>> {
        self.get(id).copied()
    }

    fn set_position(&mut self, id: PointId, at: Point2<f64>) -> bool {
        match self.get_mut(id) {
            Some(point) => {
                *point = at;
                true
            }
            None => false,
        }
    }
}
