use crate::{CameraHypothesis, FeatureWorldMatch, PinholeRadial, WorldToCamera};
use float_ord::FloatOrd;
use nalgebra::{
    DMatrix, Matrix3, Matrix3x4, Matrix4, Point2, Point3, RowVector4, Rotation3, Vector2, Vector3,
};
use sample_consensus::Estimator;

/// Direct linear transform of a full projection matrix from six or more matches.
///
/// The projection matrix is decomposed into a square-pixel, zero-skew, undistorted camera and a
/// pose. This makes it usable when the focal length of the query camera is not known.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Dlt6 {
    pub width: u32,
    pub height: u32,
    pub epsilon: f64,
    pub iterations: usize,
}

impl Dlt6 {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            epsilon: 1e-12,
            iterations: 1000,
        }
    }

    /// Estimates the 3x4 projection matrix mapping world points to pixels.
    pub fn projection(&self, matches: &[FeatureWorldMatch]) -> Option<Matrix3x4<f64>> {
        if matches.len() < 6 {
            return None;
        }
        let (pixel_transform, pixels) = normalize_pixels(matches.iter().map(|m| m.0))?;
        let (world_transform, worlds) = normalize_world(matches.iter().map(|m| m.1))?;

        let mut design = DMatrix::zeros(2 * matches.len(), 12);
        for (ix, (pixel, world)) in pixels.iter().zip(&worlds).enumerate() {
            let x = RowVector4::new(world.x, world.y, world.z, 1.0);
            design.fixed_slice_mut::<1, 4>(2 * ix, 0).copy_from(&x);
            design
                .fixed_slice_mut::<1, 4>(2 * ix, 8)
                .copy_from(&(-pixel.x * x));
            design.fixed_slice_mut::<1, 4>(2 * ix + 1, 4).copy_from(&x);
            design
                .fixed_slice_mut::<1, 4>(2 * ix + 1, 8)
                .copy_from(&(-pixel.y * x));
        }

        let normal = design.transpose() * design;
        let eigens = normal.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let (null, _) = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))?;
        let p: Vec<f64> = eigens.eigenvectors.column(null).iter().copied().collect();
        let normalized = Matrix3x4::from_row_slice(&p);
        let pixel_inverse = pixel_transform.try_inverse()?;
        Some(pixel_inverse * normalized * world_transform)
    }

    /// Splits a projection matrix into intrinsics and pose.
    pub fn decompose(&self, projection: &Matrix3x4<f64>) -> Option<CameraHypothesis> {
        let mut projection = *projection;
        let m: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
        // The overall sign is free; pick the one with a proper rotation in front of the camera.
        if m.determinant() < 0.0 {
            projection = -projection;
        }
        let m: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
        let (k, r) = rq(&m);
        let scale = k.m33;
        if scale.abs() < f64::EPSILON {
            return None;
        }
        let translation: Vector3<f64> = k.try_inverse()? * projection.column(3);
        let k = k / scale;
        let focal = 0.5 * (k.m11 + k.m22);
        if !(focal.is_finite() && focal > 0.0) {
            return None;
        }
        let intrinsics = PinholeRadial::new(
            self.width,
            self.height,
            focal,
            Point2::new(k.m13, k.m23),
        );
        let rotation = Rotation3::from_matrix_eps(&r, 1e-12, 100, Rotation3::identity());
        Some(CameraHypothesis {
            pose: WorldToCamera::from_parts(translation, rotation),
            intrinsics,
        })
    }
}

impl Estimator<FeatureWorldMatch> for Dlt6 {
    type Model = CameraHypothesis;
    type ModelIter = Option<CameraHypothesis>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        let matches: Vec<FeatureWorldMatch> = data.collect();
        self.projection(&matches)
            .and_then(|projection| self.decompose(&projection))
    }
}

/// RQ decomposition of a 3x3 matrix into an upper triangular matrix with a positive diagonal
/// and an orthogonal matrix.
fn rq(m: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    #[rustfmt::skip]
    let flip = Matrix3::new(
        0.0, 0.0, 1.0,
        0.0, 1.0, 0.0,
        1.0, 0.0, 0.0,
    );
    let qr = (flip * m).transpose().qr();
    let mut upper = flip * qr.r().transpose() * flip;
    let mut orthogonal = flip * qr.q().transpose();
    for i in 0..3 {
        if upper[(i, i)] < 0.0 {
            upper.column_mut(i).neg_mut();
            orthogonal.row_mut(i).neg_mut();
        }
    }
    (upper, orthogonal)
}

/// Hartley normalization of pixels: centroid at the origin, mean distance `sqrt(2)`.
pub(crate) fn normalize_pixels(
    pixels: impl Iterator<Item = Point2<f64>> + Clone,
) -> Option<(Matrix3<f64>, Vec<Point2<f64>>)> {
    let count = pixels.clone().count() as f64;
    let centroid = Point2::from(pixels.clone().fold(Vector2::zeros(), |acc, p| acc + p.coords) / count);
    let mean_distance = pixels.clone().map(|p| (p - centroid).norm()).sum::<f64>() / count;
    if !(mean_distance.is_finite() && mean_distance > 0.0) {
        return None;
    }
    let s = core::f64::consts::SQRT_2 / mean_distance;
    #[rustfmt::skip]
    let transform = Matrix3::new(
        s,   0.0, -s * centroid.x,
        0.0, s,   -s * centroid.y,
        0.0, 0.0, 1.0,
    );
    let normalized = pixels
        .map(|p| Point2::from((p - centroid) * s))
        .collect();
    Some((transform, normalized))
}

/// Hartley normalization of world points: centroid at the origin, mean distance `sqrt(3)`.
fn normalize_world(
    points: impl Iterator<Item = Point3<f64>> + Clone,
) -> Option<(Matrix4<f64>, Vec<Point3<f64>>)> {
    let count = points.clone().count() as f64;
    let centroid = Point3::from(points.clone().fold(Vector3::zeros(), |acc, p| acc + p.coords) / count);
    let mean_distance = points.clone().map(|p| (p - centroid).norm()).sum::<f64>() / count;
    if !(mean_distance.is_finite() && mean_distance > 0.0) {
        return None;
    }
    let s = 3.0f64.sqrt() / mean_distance;
    #[rustfmt::skip]
    let transform = Matrix4::new(
        s,   0.0, 0.0, -s * centroid.x,
        0.0, s,   0.0, -s * centroid.y,
        0.0, 0.0, s,   -s * centroid.z,
        0.0, 0.0, 0.0, 1.0,
    );
    let normalized = points.map(|p| Point3::from((p - centroid) * s)).collect();
    Some((transform, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rq_recombines() {
        #[rustfmt::skip]
        let m = Matrix3::new(
            3.0, -1.0, 2.0,
            0.5, 4.0, 1.0,
            1.0, 0.2, 5.0,
        );
        let (k, r) = rq(&m);
        assert_relative_eq!(k * r, m, epsilon = 1e-12);
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert!(k.m21.abs() < 1e-12 && k.m31.abs() < 1e-12 && k.m32.abs() < 1e-12);
        assert!(k.m11 > 0.0 && k.m22 > 0.0 && k.m33 > 0.0);
    }

    #[test]
    fn recovers_camera_and_pose() {
        let camera = PinholeRadial::new(1024, 768, 850.0, Point2::new(500.0, 390.0));
        let pose = WorldToCamera::from_parts(
            Vector3::new(-0.2, 0.1, 5.0),
            Rotation3::from_euler_angles(0.2, -0.1, 0.05),
        );
        let worlds = [
            Point3::new(-1.0, -1.0, 0.0),
            Point3::new(1.0, -0.8, 0.5),
            Point3::new(0.9, 1.1, -0.4),
            Point3::new(-1.2, 0.9, 0.3),
            Point3::new(0.1, 0.2, 1.0),
            Point3::new(0.4, -0.3, -1.0),
            Point3::new(-0.5, 0.6, 0.8),
        ];
        let matches: Vec<FeatureWorldMatch> = worlds
            .iter()
            .map(|w| FeatureWorldMatch(camera.project(&pose, w).unwrap(), *w))
            .collect();
        let hypothesis = Dlt6::new(1024, 768)
            .estimate(matches.iter().copied())
            .unwrap();
        assert_relative_eq!(hypothesis.intrinsics.focal, 850.0, epsilon = 1e-5);
        assert_relative_eq!(
            hypothesis.intrinsics.principal_point,
            Point2::new(500.0, 390.0),
            epsilon = 1e-5
        );
        assert_relative_eq!(hypothesis.pose.0, pose.0, epsilon = 1e-7);
    }
}
