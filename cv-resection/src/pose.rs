use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Point3, Rotation3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// The pose of the world relative to the camera.
///
/// This maps world points into the camera frame, where the optical center is the origin
/// and the positive `z` axis points forwards.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into, Serialize, Deserialize)]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl WorldToCamera {
    pub fn identity() -> Self {
        Self(IsometryMatrix3::identity())
    }

    pub fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        Self(IsometryMatrix3::from_parts(translation.into(), rotation))
    }

    /// Retrieve the se(3) representation of the pose, translation first.
    pub fn se3(&self) -> Vector6<f64> {
        let t = self.0.translation.vector;
        let r = self.0.rotation.scaled_axis();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    pub fn from_se3(se3: Vector6<f64>) -> Self {
        Self::from_parts(
            se3.xyz(),
            Rotation3::new(Vector3::new(se3[3], se3[4], se3[5])),
        )
    }

    pub fn transform(&self, world: &Point3<f64>) -> Point3<f64> {
        self.0 * world
    }

    /// The optical center in world coordinates.
    pub fn camera_center(&self) -> Point3<f64> {
        self.0.inverse() * Point3::origin()
    }
}

impl Default for WorldToCamera {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn se3_round_trips() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.3, -1.2, 4.0),
            Rotation3::from_euler_angles(0.1, -0.4, 0.25),
        );
        let back = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(back.0, pose.0, epsilon = 1e-12);
    }

    #[test]
    fn camera_center_maps_to_origin() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(1.0, 2.0, 3.0),
            Rotation3::from_euler_angles(0.5, 0.2, -0.1),
        );
        let center = pose.camera_center();
        assert_relative_eq!(pose.transform(&center), Point3::origin(), epsilon = 1e-12);
    }
}
