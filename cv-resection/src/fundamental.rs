use crate::dlt::normalize_pixels;
use float_ord::FloatOrd;
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};
use sample_consensus::{Estimator, Model};

/// A pair of matching pixels, `(a, b)`, in two different images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch(pub Point2<f64>, pub Point2<f64>);

/// A fundamental matrix `F` such that `b^T F a = 0` for a [`FeatureMatch`] `(a, b)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl FundamentalMatrix {
    /// Distance in pixels from `b` to the epipolar line of `a` and from `a` to the epipolar line of `b`,
    /// whichever is larger.
    pub fn epipolar_distance(&self, a: Point2<f64>, b: Point2<f64>) -> f64 {
        let a = a.to_homogeneous();
        let b = b.to_homogeneous();
        let line_b: Vector3<f64> = self.0 * a;
        let line_a: Vector3<f64> = self.0.transpose() * b;
        let algebraic = b.dot(&line_b).abs();
        let to_b = algebraic / line_b.xy().norm();
        let to_a = algebraic / line_a.xy().norm();
        let distance = to_a.max(to_b);
        if distance.is_nan() {
            f64::INFINITY
        } else {
            distance
        }
    }
}

impl Model<FeatureMatch> for FundamentalMatrix {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        self.epipolar_distance(data.0, data.1)
    }
}

/// The normalized
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// by Richard Hartley and Andrew Zisserman, on pixel coordinates.
#[derive(Copy, Clone, Debug)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    /// Estimates a rank two fundamental matrix from eight or more matches.
    pub fn from_matches<I>(&self, data: I) -> Option<FundamentalMatrix>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        let count = data.clone().count();
        if count < 8 {
            return None;
        }
        let (ta, a) = normalize_pixels(data.clone().map(|m| m.0))?;
        let (tb, b) = normalize_pixels(data.map(|m| m.1))?;

        let mut epipolar_constraint = DMatrix::zeros(count, 9);
        for (ix, (a, b)) in a.iter().zip(&b).enumerate() {
            let a = a.to_homogeneous();
            let b = b.to_homogeneous();
            for j in 0..3 {
                for k in 0..3 {
                    epipolar_constraint[(ix, 3 * j + k)] = b[j] * a[k];
                }
            }
        }
        let normal = epipolar_constraint.transpose() * epipolar_constraint;
        let eigens = normal.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let (null, _) = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))?;
        let f: Vec<f64> = eigens.eigenvectors.column(null).iter().copied().collect();
        let normalized = enforce_rank_two(Matrix3::from_row_slice(&f))?;

        let fundamental = tb.transpose() * normalized * ta;
        let norm = fundamental.norm();
        if !(norm.is_finite() && norm > 0.0) {
            return None;
        }
        Some(FundamentalMatrix(fundamental / norm))
    }
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch> for EightPoint {
    type Model = FundamentalMatrix;
    type ModelIter = Option<FundamentalMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.from_matches(data)
    }
}

fn enforce_rank_two(f: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = f.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut singular_values = svd.singular_values;
    let (smallest, _) = singular_values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| FloatOrd(n))?;
    singular_values[smallest] = 0.0;
    Some(u * Matrix3::from_diagonal(&singular_values) * v_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PinholeRadial, WorldToCamera};
    use nalgebra::{Point3, Rotation3};

    #[test]
    fn epipolar_constraint_holds_for_true_matches() {
        let camera = PinholeRadial::new(640, 480, 520.0, Point2::new(320.0, 240.0));
        let a_pose = WorldToCamera::identity();
        let b_pose = WorldToCamera::from_parts(
            Vector3::new(-0.5, 0.05, 0.1),
            Rotation3::from_euler_angles(0.02, 0.15, -0.03),
        );
        let worlds: Vec<Point3<f64>> = (0..20)
            .map(|i| {
                let i = i as f64;
                Point3::new(
                    (i * 0.37).sin() * 1.5,
                    (i * 0.71).cos() * 1.2,
                    4.0 + (i * 0.53).sin(),
                )
            })
            .collect();
        let matches: Vec<FeatureMatch> = worlds
            .iter()
            .map(|w| {
                FeatureMatch(
                    camera.project(&a_pose, w).unwrap(),
                    camera.project(&b_pose, w).unwrap(),
                )
            })
            .collect();
        let fundamental = EightPoint::new()
            .from_matches(matches.iter().copied())
            .unwrap();
        for m in &matches {
            assert!(fundamental.residual(m) < 1e-6, "{}", fundamental.residual(m));
        }
        assert_eq!(fundamental.0.rank(1e-9), 2);

        // A pixel far from its epipolar line is rejected.
        let wrong = FeatureMatch(matches[0].0, matches[5].1);
        assert!(fundamental.residual(&wrong) > 1.0);
    }

    #[test]
    fn needs_eight_matches() {
        let matches = vec![FeatureMatch(Point2::origin(), Point2::origin()); 7];
        assert!(EightPoint::new().from_matches(matches.into_iter()).is_none());
    }
}
