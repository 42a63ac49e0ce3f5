use crate::WorldToCamera;
use nalgebra::{Matrix3, Point2, Point3, UnitVector3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Depth below which a camera point is treated as behind the camera.
pub const MIN_DEPTH: f64 = 1e-9;

const UNDISTORT_ITERATIONS: usize = 100;

/// A pinhole camera with square pixels, no skew and three radial distortion terms.
///
/// A normalized image point `p` is distorted by `p * (1 + k1 r^2 + k2 r^4 + k3 r^6)` with
/// `r = |p|` before being scaled by `focal` and offset by `principal_point`.
///
/// A non-positive `focal` means the focal length is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeRadial {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    pub focal: f64,
    pub principal_point: Point2<f64>,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
}

impl PinholeRadial {
    /// Creates an undistorted camera.
    pub fn new(width: u32, height: u32, focal: f64, principal_point: Point2<f64>) -> Self {
        Self {
            width,
            height,
            focal,
            principal_point,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
        }
    }

    /// Creates a camera of the given size whose focal length is not known yet.
    ///
    /// The principal point is placed at the image center.
    pub fn unknown_focal(width: u32, height: u32) -> Self {
        Self::new(
            width,
            height,
            0.0,
            Point2::new(f64::from(width) * 0.5, f64::from(height) * 0.5),
        )
    }

    #[must_use]
    pub fn with_distortion(self, k1: f64, k2: f64, k3: f64) -> Self {
        Self { k1, k2, k3, ..self }
    }

    /// Whether the focal length is usable for projection.
    pub fn has_focal(&self) -> bool {
        self.focal.is_finite() && self.focal > 0.0
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.k3 != 0.0
    }

    /// Length of the image diagonal in pixels.
    pub fn diagonal(&self) -> f64 {
        Vector2::new(f64::from(self.width), f64::from(self.height)).norm()
    }

    /// The intrinsic matrix, without distortion.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal,
            0.0,
            self.principal_point.x,
            0.0,
            self.focal,
            self.principal_point.y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn distortion_factor(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    /// Applies radial distortion to a normalized image point.
    pub fn distort(&self, undistorted: Point2<f64>) -> Point2<f64> {
        undistorted * self.distortion_factor(undistorted.coords.norm_squared())
    }

    /// Removes radial distortion from a normalized image point.
    ///
    /// The undistorted radius `r` is the root of `r * factor(r^2) - |distorted|`, found with
    /// Newton-Raphson starting from `r = |distorted|`.
    pub fn undistort(&self, distorted: Point2<f64>) -> Point2<f64> {
        let radius = distorted.coords.norm();
        if !self.has_distortion() || radius == 0.0 {
            return distorted;
        }
        let mut r = radius;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = r * r;
            let value = r * self.distortion_factor(r2) - radius;
            let derivative =
                1.0 + r2 * (3.0 * self.k1 + r2 * (5.0 * self.k2 + r2 * 7.0 * self.k3));
            if !(derivative.is_finite() && derivative > 0.0) {
                break;
            }
            let delta = value / derivative;
            r -= delta;
            if delta.abs() <= f64::EPSILON * r {
                break;
            }
        }
        distorted * (r / radius)
    }

    /// Converts a pixel into an undistorted normalized image point.
    pub fn calibrate(&self, pixel: Point2<f64>) -> Point2<f64> {
        self.undistort(((pixel - self.principal_point) / self.focal).into())
    }

    /// Converts an undistorted normalized image point back into a pixel.
    pub fn uncalibrate(&self, normalized: Point2<f64>) -> Point2<f64> {
        self.principal_point + self.distort(normalized).coords * self.focal
    }

    /// The direction in camera space that light hitting `pixel` came from.
    pub fn bearing(&self, pixel: Point2<f64>) -> UnitVector3<f64> {
        let normalized = self.calibrate(pixel);
        UnitVector3::new_normalize(Vector3::new(normalized.x, normalized.y, 1.0))
    }

    /// Removes the lens distortion from a pixel while staying in pixel units.
    pub fn undistort_pixel(&self, pixel: Point2<f64>) -> Point2<f64> {
        if !self.has_distortion() {
            return pixel;
        }
        self.principal_point + self.calibrate(pixel).coords * self.focal
    }

    /// Projects a world point into the image, or `None` if it is behind the camera.
    pub fn project(&self, pose: &WorldToCamera, world: &Point3<f64>) -> Option<Point2<f64>> {
        let camera = pose.transform(world);
        if camera.z < MIN_DEPTH {
            return None;
        }
        Some(self.uncalibrate(Point2::new(camera.x / camera.z, camera.y / camera.z)))
    }

    /// The reprojection residual `projection - pixel`, or `None` if the point is behind the camera.
    pub fn residual(
        &self,
        pose: &WorldToCamera,
        world: &Point3<f64>,
        pixel: &Point2<f64>,
    ) -> Option<Vector2<f64>> {
        self.project(pose, world).map(|projected| projected - pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn camera() -> PinholeRadial {
        PinholeRadial::new(1280, 960, 1100.0, Point2::new(645.0, 470.0)).with_distortion(
            -0.12, 0.03, -0.004,
        )
    }

    #[test]
    fn calibrate_inverts_uncalibrate() {
        let camera = camera();
        for &(x, y) in &[
            (0.0, 0.0),
            (0.3, -0.2),
            (-0.45, 0.35),
            (0.5, 0.4),
            (0.55, 0.45),
        ] {
            let normalized = Point2::new(x, y);
            let pixel = camera.uncalibrate(normalized);
            assert_relative_eq!(camera.calibrate(pixel), normalized, epsilon = 1e-12);
            assert_relative_eq!(
                camera.uncalibrate(camera.calibrate(pixel)),
                pixel,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn projection_matches_bearing() {
        let camera = camera();
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, -0.3, 2.0),
            Rotation3::from_euler_angles(0.05, 0.1, -0.2),
        );
        let world = Point3::new(0.4, 0.2, 3.0);
        let pixel = camera.project(&pose, &world).unwrap();
        let expected = pose.transform(&world).coords.normalize();
        assert_relative_eq!(
            camera.bearing(pixel).into_inner(),
            expected,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            camera.residual(&pose, &world, &pixel).unwrap().norm(),
            0.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn points_behind_the_camera_do_not_project() {
        let camera = PinholeRadial::new(640, 480, 500.0, Point2::new(320.0, 240.0));
        let pose = WorldToCamera::identity();
        assert!(camera.project(&pose, &Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera.project(&pose, &Point3::new(0.0, 0.0, 1.0)).is_some());
    }

    #[test]
    fn unknown_focal_is_detected() {
        let camera = PinholeRadial::unknown_focal(640, 480);
        assert!(!camera.has_focal());
        assert_relative_eq!(camera.principal_point, Point2::new(320.0, 240.0));
        assert_relative_eq!(camera.diagonal(), 800.0);
    }
}
