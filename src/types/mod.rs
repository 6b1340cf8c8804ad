pub mod linalg;

pub use linalg::*;

use std::fmt;
use std::str::FromStr;

use nalgebra::{Quaternion, Rotation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::error::MaxwellError;

/// Coordinate frames a transform can map between.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordFrame {
    /// MEG device frame
    Meg,
    /// Head frame defined by the fiducials
    Head,
    Unknown,
}

impl FromStr for CoordFrame {
    type Err = MaxwellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meg" => Ok(CoordFrame::Meg),
            "head" => Ok(CoordFrame::Head),
            other => Err(MaxwellError::UnknownFrame(format!(
                "coord_frame must be either \"head\" or \"meg\", not \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for CoordFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordFrame::Meg => "MEG device",
            CoordFrame::Head => "head",
            CoordFrame::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Rigid 4x4 transform tagged with its source and destination frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub from: CoordFrame,
    pub to: CoordFrame,
    pub matrix: Mat4,
}

impl Transform {
    pub fn new(from: CoordFrame, to: CoordFrame, matrix: Mat4) -> Self {
        Self { from, to, matrix }
    }

    pub fn identity(from: CoordFrame, to: CoordFrame) -> Self {
        Self::new(from, to, Mat4::identity())
    }

    pub fn from_rotation_translation(
        from: CoordFrame,
        to: CoordFrame,
        rotation: &Mat3,
        translation: &Vec3,
    ) -> Self {
        let mut matrix = Mat4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
        Self::new(from, to, matrix)
    }

    pub fn rotation(&self) -> Mat3 {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vec3 {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Apply to a position (rotation + translation).
    pub fn apply_point(&self, point: &Vec3) -> Vec3 {
        self.rotation() * point + self.translation()
    }

    /// Apply to a direction (rotation only).
    pub fn apply_vector(&self, vector: &Vec3) -> Vec3 {
        self.rotation() * vector
    }

    pub fn is_finite(&self) -> bool {
        self.matrix.iter().all(|v| v.is_finite())
    }
}

/// Rotation matrix from the vector part of a unit quaternion, (q1, q2, q3).
///
/// The scalar part is recovered as `sqrt(1 - |q|^2)`, so it is never negative.
pub fn quat_to_rot(quat: &Vec3) -> Mat3 {
    let w = (1.0 - quat.norm_squared()).max(0.0).sqrt();
    let q = UnitQuaternion::from_quaternion(Quaternion::new(w, quat[0], quat[1], quat[2]));
    q.to_rotation_matrix().into_inner()
}

/// Inverse of [`quat_to_rot`]: vector part of the quaternion with non-negative scalar part.
pub fn rot_to_quat(rotation: &Mat3) -> Vec3 {
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation));
    let sign = if q.w < 0.0 { -1.0 } else { 1.0 };
    Vec3::new(q.i, q.j, q.k) * sign
}
