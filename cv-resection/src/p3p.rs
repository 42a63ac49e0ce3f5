//! Perspective-three-point pose estimation.
//!
//! Implementation of
//! "Lambda Twist: An Accurate Fast Robust Perspective Three Point (P3P) Solver".
//! Persson, M. and Nordberg, K. ECCV 2018.

use crate::{CameraHypothesis, FeatureWorldMatch, PinholeRadial, WorldToCamera};
use arrayvec::ArrayVec;
use nalgebra::{Matrix3, Point3, Rotation3, UnitVector3, Vector3};
use num_traits::Float;
use sample_consensus::Estimator;

type Mat3 = Matrix3<f64>;
type Vec3 = Vector3<f64>;

/// The Lambda Twist P3P solver, working on pixels through fixed intrinsics.
///
/// Every pixel is turned into a bearing with [`PinholeRadial::bearing`] and each of the
/// up to four poses found is paired with the same intrinsics.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LambdaTwist {
    pub intrinsics: PinholeRadial,
    /// Gauss-Newton iterations spent refining the depths. Rarely improves after two.
    pub gauss_newton_iterations: usize,
    /// Iterations spent converging on a proper rotation matrix.
    pub rotation_convergence_iterations: usize,
    pub rotation_convergence_epsilon: f64,
}

impl LambdaTwist {
    pub fn new(intrinsics: PinholeRadial) -> Self {
        Self {
            intrinsics,
            gauss_newton_iterations: 5,
            rotation_convergence_iterations: 100,
            rotation_convergence_epsilon: 1e-12,
        }
    }

    #[must_use]
    pub fn gauss_newton_iterations(self, gauss_newton_iterations: usize) -> Self {
        Self {
            gauss_newton_iterations,
            ..self
        }
    }

    /// Solves `lambda_i * y_i = R * x_i + t` for the three world points `x_i` and bearings `y_i`.
    ///
    /// Returns between zero and four poses.
    pub fn solve(
        &self,
        world: [Point3<f64>; 3],
        bearings: [UnitVector3<f64>; 3],
    ) -> ArrayVec<WorldToCamera, 4> {
        let mut poses = ArrayVec::new();
        let bearings = bearings.map(UnitVector3::into_inner);

        let d12 = world[0] - world[1];
        let d13 = world[0] - world[2];
        let d23 = world[1] - world[2];
        let d12xd13 = d12.cross(&d13);

        // Squared distances between the world points.
        let a12 = d12.norm_squared();
        let a13 = d13.norm_squared();
        let a23 = d23.norm_squared();

        // Cosines between the bearings.
        let c12 = bearings[0].dot(&bearings[1]);
        let c23 = bearings[1].dot(&bearings[2]);
        let c31 = bearings[2].dot(&bearings[0]);
        let blob = c12 * c23 * c31 - 1.0;

        let s12_sqr = 1.0 - c12 * c12;
        let s23_sqr = 1.0 - c23 * c23;
        let s31_sqr = 1.0 - c31 * c31;

        let b12 = -2.0 * c12;
        let b13 = -2.0 * c31;
        let b23 = -2.0 * c23;

        // Coefficients of the cubic, equation (10) of the paper.
        let p3 = a13 * (a23 * s31_sqr - a13 * s23_sqr);
        let p2 = 2.0 * blob * a23 * a13
            + a13 * (2.0 * a12 + a13) * s23_sqr
            + a23 * (a23 - a12) * s31_sqr;
        let p1 = a23 * (a13 - a23) * s12_sqr
            - a12 * a12 * s23_sqr
            - 2.0 * a12 * (blob * a23 + a13 * s23_sqr);
        let p0 = a12 * (a12 * s23_sqr - a23 * s12_sqr);

        if p3 == 0.0 || !p3.is_finite() {
            return poses;
        }
        let g = sharpest_cubic_root(p2 / p3, p1 / p3, p0 / p3);

        // D0 from the paper, which is singular by construction.
        #[rustfmt::skip]
        let d0 = Mat3::new(
            a23 * (1.0 - g),  -(a23 * c12),               a23 * c31 * g,
            -(a23 * c12),     a23 - a12 + a13 * g,        -c23 * (a13 * g - a12),
            a23 * c31 * g,    -c23 * (a13 * g - a12),     g * (a13 - a23) - a12,
        );
        let (eigenvectors, eigenvalues) = singular_eigen_decomposition(d0);
        let ratio = 0.0_f64.max(-eigenvalues[1] / eigenvalues[0]).sqrt();

        let mut lambdas: ArrayVec<Vec3, 4> = ArrayVec::new();
        for ratio in [ratio, -ratio] {
            // Equation (15).
            let w2 = 1.0 / (ratio * eigenvectors.m12 - eigenvectors.m11);
            let w0 = w2 * (eigenvectors.m21 - ratio * eigenvectors.m22);
            let w1 = w2 * (eigenvectors.m31 - ratio * eigenvectors.m32);

            let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12);
            let b = a * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let c = a * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);

            let Some((tau1, tau2)) = real_quadratic_roots(b, c) else {
                continue;
            };
            for tau in [tau1, tau2] {
                if tau <= 0.0 {
                    continue;
                }
                // Equation (16).
                let d = a23 / (tau * (b23 + tau) + 1.0);
                if d <= 0.0 {
                    continue;
                }
                let l2 = d.sqrt();
                let l3 = tau * l2;
                let l1 = w0 * l2 + w1 * l3;
                if l1 >= 0.0 {
                    lambdas.push(Vec3::new(l1, l2, l3));
                }
            }
        }

        #[rustfmt::skip]
        let x_mat = Mat3::new(
            d12[0], d13[0], d12xd13[0],
            d12[1], d13[1], d12xd13[1],
            d12[2], d13[2], d12xd13[2],
        );
        let Some(x_inv) = x_mat.try_inverse() else {
            return poses;
        };

        for lambda in lambdas {
            let lambda = refine_depths(
                lambda,
                self.gauss_newton_iterations,
                [a12, a13, a23],
                [b12, b13, b23],
            );
            let ry1 = lambda[0] * bearings[0];
            let ry2 = lambda[1] * bearings[1];
            let ry3 = lambda[2] * bearings[2];

            let yd1 = ry1 - ry2;
            let yd2 = ry1 - ry3;
            let yd1xd2 = yd1.cross(&yd2);

            #[rustfmt::skip]
            let y_mat = Mat3::new(
                yd1[0], yd2[0], yd1xd2[0],
                yd1[1], yd2[1], yd1xd2[1],
                yd1[2], yd2[2], yd1xd2[2],
            );
            let rotation = Rotation3::from_matrix_eps(
                &(y_mat * x_inv),
                self.rotation_convergence_epsilon,
                self.rotation_convergence_iterations,
                Rotation3::identity(),
            );
            let translation = ry1 - rotation * world[0].coords;
            if translation.iter().all(|n| n.is_finite()) {
                poses.push(WorldToCamera::from_parts(translation, rotation));
            }
        }
        poses
    }
}

impl Estimator<FeatureWorldMatch> for LambdaTwist {
    type Model = CameraHypothesis;
    type ModelIter = ArrayVec<CameraHypothesis, 4>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, mut data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        let (Some(a), Some(b), Some(c)) = (data.next(), data.next(), data.next()) else {
            return ArrayVec::new();
        };
        let bearing = |m: &FeatureWorldMatch| self.intrinsics.bearing(m.0);
        self.solve([a.1, b.1, c.1], [bearing(&a), bearing(&b), bearing(&c)])
            .into_iter()
            .map(|pose| CameraHypothesis {
                pose,
                intrinsics: self.intrinsics,
            })
            .collect()
    }
}

/// Gauss-Newton refinement of the three depths against the law of cosines constraints.
fn refine_depths(lambda: Vec3, iterations: usize, a: [f64; 3], b: [f64; 3]) -> Vec3 {
    let [a12, a13, a23] = a;
    let [b12, b13, b23] = b;
    let residual = |l: &Vec3| {
        Vec3::new(
            l.x * l.x + l.y * l.y + b12 * l.x * l.y - a12,
            l.x * l.x + l.z * l.z + b13 * l.x * l.z - a13,
            l.y * l.y + l.z * l.z + b23 * l.y * l.z - a23,
        )
    };
    let l1_norm = |v: &Vec3| v.x.abs() + v.y.abs() + v.z.abs();

    let mut lambda = lambda;
    let mut res = residual(&lambda);
    for _ in 0..iterations {
        if l1_norm(&res) < 1e-10 {
            break;
        }
        let (l1, l2, l3) = (lambda.x, lambda.y, lambda.z);
        let dr1dl1 = 2.0 * l1 + b12 * l2;
        let dr1dl2 = 2.0 * l2 + b12 * l1;
        let dr2dl1 = 2.0 * l1 + b13 * l3;
        let dr2dl3 = 2.0 * l3 + b13 * l1;
        let dr3dl2 = 2.0 * l2 + b23 * l3;
        let dr3dl3 = 2.0 * l3 + b23 * l2;
        let det = 1.0 / (-dr1dl1 * dr2dl3 * dr3dl2 - dr1dl2 * dr2dl1 * dr3dl3);

        // Adjugate of the Jacobian.
        #[rustfmt::skip]
        let adjugate = Mat3::new(
            -dr2dl3 * dr3dl2, -dr1dl2 * dr3dl3,  dr1dl2 * dr2dl3,
            -dr2dl1 * dr3dl3,  dr1dl1 * dr3dl3, -dr1dl1 * dr2dl3,
             dr2dl1 * dr3dl2, -dr1dl1 * dr3dl2, -dr1dl2 * dr2dl1,
        );
        let next = lambda - det * (adjugate * res);
        let next_res = residual(&next);
        if l1_norm(&next_res) > l1_norm(&res) {
            break;
        }
        lambda = next;
        res = next_res;
    }
    lambda
}

/// Real roots of `r^2 + b r + c = 0`, computed without cancellation.
fn real_quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let y = Float::sqrt(discriminant);
    if b < 0.0 {
        Some((0.5 * (-b + y), 0.5 * (-b - y)))
    } else {
        Some((2.0 * c / (-b + y), 2.0 * c / (-b - y)))
    }
}

/// A root of `r^3 + b r^2 + c r + d = 0` where the derivative is as large as possible.
///
/// The Newton-Raphson starting point is the leftmost or rightmost root of a second order
/// approximation around the stationary points of the cubic, if it has any.
#[allow(clippy::many_single_char_names)]
fn sharpest_cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let cubic = |r: f64| ((r + b) * r + c) * r + d;
    let derivative = |r: f64| (3.0 * r + 2.0 * b) * r + c;

    let mut r0 = if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k = cubic(t1);
        if k > 0.0 {
            t1 - (-k / (3.0 * t1 + b)).sqrt()
        } else {
            let t2 = (-b + v) / 3.0;
            t2 + (-cubic(t2) / (3.0 * t2 + b)).sqrt()
        }
    } else {
        let r = -b / 3.0;
        if derivative(r).abs() < 1e-4 {
            r + 1.0
        } else {
            r
        }
    };

    // At least 7 and at most 50 iterations.
    for iteration in 0..50 {
        let fx = cubic(r0);
        if iteration >= 7 && fx.abs() <= 1e-13 {
            break;
        }
        r0 -= fx / derivative(r0);
    }
    r0
}

/// Eigen decomposition of a symmetric matrix with a zero eigenvalue.
///
/// The eigenvectors are the columns of the returned matrix. The first two eigenvalues are sorted
/// by decreasing magnitude and the third (zero) one belongs to the third column.
fn singular_eigen_decomposition(x: Mat3) -> (Mat3, Vec3) {
    #[rustfmt::skip]
    let v3 = Vec3::new(
        x[1] * x[5] - x[2] * x[4],
        x[2] * x[3] - x[5] * x[0],
        x[4] * x[0] - x[1] * x[3],
    )
    .normalize();

    let x12_sqr = x.m12 * x.m12;
    let b = -x.m11 - x.m22 - x.m33;
    let c = -x12_sqr - x.m13 * x.m13 - x.m23 * x.m23 + x.m11 * (x.m22 + x.m33) + x.m22 * x.m33;
    let (mut e1, mut e2) = real_quadratic_roots(b, c).unwrap_or((0.5 * b, 0.5 * b));
    if e1.abs() < e2.abs() {
        core::mem::swap(&mut e1, &mut e2);
    }

    let mx0011 = -x.m11 * x.m22;
    let prec_0 = x.m12 * x.m23 - x.m13 * x.m22;
    let prec_1 = x.m12 * x.m13 - x.m11 * x.m23;
    let eigenvector = |e: f64| {
        let tmp = 1.0 / (e * (x.m11 + x.m22) + mx0011 - e * e + x12_sqr);
        let a1 = -(e * x.m13 + prec_0) * tmp;
        let a2 = -(e * x.m23 + prec_1) * tmp;
        let rnorm = 1.0 / (a1 * a1 + a2 * a2 + 1.0).sqrt();
        Vec3::new(a1 * rnorm, a2 * rnorm, rnorm)
    };

    (
        Mat3::from_columns(&[eigenvector(e1), eigenvector(e2), v3]),
        Vec3::new(e1, e2, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    #[test]
    fn cubic_root_is_a_root() {
        // (r - 1)(r - 2)(r + 3) = r^3 - 7r + 6
        let r = sharpest_cubic_root(0.0, -7.0, 6.0);
        assert_relative_eq!(((r + 0.0) * r - 7.0) * r + 6.0, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn quadratic_roots() {
        let (r1, r2) = real_quadratic_roots(-3.0, 2.0).unwrap();
        assert_relative_eq!(r1.max(r2), 2.0);
        assert_relative_eq!(r1.min(r2), 1.0);
        assert!(real_quadratic_roots(0.0, 1.0).is_none());
    }

    #[test]
    fn recovers_known_pose() {
        let intrinsics = PinholeRadial::new(800, 600, 700.0, Point2::new(400.0, 300.0));
        let rotation = Rotation3::from_euler_angles(0.1, 0.2, 0.3);
        let translation = Vector3::new(0.1, 0.2, 0.3);
        let pose = WorldToCamera::from_parts(translation, rotation);
        let camera_points = [
            Point3::new(-0.228_125, -0.061_458_334, 1.0),
            Point3::new(0.418_75, -0.581_25, 2.0),
            Point3::new(1.128_125, 0.878_125, 3.0),
        ];
        let samples: Vec<FeatureWorldMatch> = camera_points
            .iter()
            .map(|p| {
                let pixel = intrinsics.uncalibrate(Point2::new(p.x / p.z, p.y / p.z));
                FeatureWorldMatch(pixel, pose.0.inverse() * p)
            })
            .collect();

        let hypotheses = LambdaTwist::new(intrinsics).estimate(samples.iter().copied());
        assert!(hypotheses.iter().any(|h| {
            (h.pose.0.rotation.matrix() - rotation.matrix()).norm() < 1e-6
                && (h.pose.0.translation.vector - translation).norm() < 1e-6
        }));
    }

    #[test]
    fn too_few_samples_yield_nothing() {
        let intrinsics = PinholeRadial::new(800, 600, 700.0, Point2::new(400.0, 300.0));
        let samples = [FeatureWorldMatch(Point2::origin(), Point3::new(0.0, 0.0, 1.0)); 2];
        assert!(LambdaTwist::new(intrinsics)
            .estimate(samples.iter().copied())
            .is_empty());
    }
}
