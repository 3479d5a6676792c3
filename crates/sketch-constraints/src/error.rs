use crate::point::PointId;

/// Reasons a constraint or edit request was rejected.
///
/// A rejected request never leaves partial state behind: nothing is
/// registered and no variable is touched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConstraintError {
    #[error("point {0:?} has not been registered with the solver")]
    UnregisteredPoint(PointId),

    #[error("point {0:?} no longer exists in the point store")]
    MissingPoint(PointId),

    #[error("reference segment has near-zero length")]
    DegenerateReference,

    #[error("tangency is only defined for circle/circle and circle/segment pairs")]
    UnsupportedTangent,

    #[error("point {0:?} is not being edited")]
    NotEditing(PointId),

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: f64 },
}
