use crate::{PinholeRadial, WorldToCamera, MIN_DEPTH};
use levenberg_marquardt::{
    differentiate_numerically, LeastSquaresProblem, LevenbergMarquardt, TerminationReason,
};
use log::*;
use nalgebra::{
    dimension::{Dynamic, U1},
    storage::Owned,
    DMatrix, DVector, Point2, Point3, Rotation3, Vector3,
};

/// One pixel observation of a fixed world point from one of the refined poses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Index of the pose that observes the point.
    pub view: usize,
    pub world: Point3<f64>,
    pub pixel: Point2<f64>,
}

/// Which parameter groups participate in a [`ReprojectionProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefineParameters {
    pub rotation: bool,
    pub translation: bool,
    pub focal: bool,
    pub principal_point: bool,
    pub distortion: bool,
}

impl RefineParameters {
    /// Rotation and translation of every pose.
    pub fn pose() -> Self {
        Self {
            rotation: true,
            translation: true,
            ..Self::default()
        }
    }

    /// Poses and every intrinsic parameter.
    pub fn all() -> Self {
        Self {
            rotation: true,
            translation: true,
            focal: true,
            principal_point: true,
            distortion: true,
        }
    }

    pub fn refines_intrinsics(&self) -> bool {
        self.focal || self.principal_point || self.distortion
    }

    fn per_pose(&self) -> usize {
        3 * (self.rotation as usize + self.translation as usize)
    }

    fn intrinsic(&self) -> usize {
        self.focal as usize + 2 * self.principal_point as usize + 3 * self.distortion as usize
    }
}

/// Reprojection error of fixed world points over many poses sharing one camera.
///
/// The parameters are, for every pose, its translation then its rotation as a scaled axis
/// (whichever of the two are selected), followed by the selected intrinsics in the order
/// focal, principal point, `k1 k2 k3`. The residuals are the `x` and `y` pixel errors of
/// every observation.
#[derive(Clone, Debug)]
pub struct ReprojectionProblem<'a> {
    pub poses: Vec<WorldToCamera>,
    pub intrinsics: PinholeRadial,
    observations: &'a [Observation],
    refine: RefineParameters,
}

impl<'a> ReprojectionProblem<'a> {
    /// Creates a problem. Every observation must reference one of `poses`.
    pub fn new(
        poses: Vec<WorldToCamera>,
        intrinsics: PinholeRadial,
        observations: &'a [Observation],
        refine: RefineParameters,
    ) -> Self {
        Self {
            poses,
            intrinsics,
            observations,
            refine,
        }
    }

    pub fn num_params(&self) -> usize {
        self.poses.len() * self.refine.per_pose() + self.refine.intrinsic()
    }

    /// Root mean square of the pixel reprojection errors, or `None` if a point is behind its camera.
    pub fn rmse(&self) -> Option<f64> {
        if self.observations.is_empty() {
            return Some(0.0);
        }
        let mut sum = 0.0;
        for observation in self.observations {
            let pose = self.poses.get(observation.view)?;
            sum += self
                .intrinsics
                .residual(pose, &observation.world, &observation.pixel)?
                .norm_squared();
        }
        Some((sum / self.observations.len() as f64).sqrt())
    }

    /// Minimizes the reprojection error, returning the problem at its optimum and whether the solver
    /// reported convergence.
    pub fn minimize(self, patience: usize) -> (Self, bool) {
        let observations = self.observations.len();
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(patience)
            .minimize(self);
        let converged = matches!(
            report.termination,
            TerminationReason::Converged { .. }
                | TerminationReason::ResidualsZero
                | TerminationReason::Orthogonal
        );
        debug!(
            "refined {} observations over {} parameters in {} evaluations: {:?} (objective {})",
            observations,
            problem.num_params(),
            report.number_of_evaluations,
            report.termination,
            report.objective_function
        );
        (problem, converged)
    }
}

impl<'a> LeastSquaresProblem<f64, Dynamic, Dynamic> for ReprojectionProblem<'a> {
    type ResidualStorage = Owned<f64, Dynamic, U1>;
    type JacobianStorage = Owned<f64, Dynamic, Dynamic>;
    type ParameterStorage = Owned<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        let mut cursor = 0;
        let mut take = |n: usize| {
            let slice = params.rows(cursor, n).into_owned();
            cursor += n;
            slice
        };
        for pose in &mut self.poses {
            if self.refine.translation {
                pose.0.translation.vector = Vector3::from_iterator(take(3).iter().copied());
            }
            if self.refine.rotation {
                pose.0.rotation = Rotation3::new(Vector3::from_iterator(take(3).iter().copied()));
            }
        }
        if self.refine.focal {
            self.intrinsics.focal = take(1)[0];
        }
        if self.refine.principal_point {
            let v = take(2);
            self.intrinsics.principal_point = Point2::new(v[0], v[1]);
        }
        if self.refine.distortion {
            let v = take(3);
            self.intrinsics.k1 = v[0];
            self.intrinsics.k2 = v[1];
            self.intrinsics.k3 = v[2];
        }
    }

    fn params(&self) -> DVector<f64> {
        let mut params = Vec::with_capacity(self.num_params());
        for pose in &self.poses {
            if self.refine.translation {
                params.extend(pose.0.translation.vector.iter().copied());
            }
            if self.refine.rotation {
                params.extend(pose.0.rotation.scaled_axis().iter().copied());
            }
        }
        if self.refine.focal {
            params.push(self.intrinsics.focal);
        }
        if self.refine.principal_point {
            params.push(self.intrinsics.principal_point.x);
            params.push(self.intrinsics.principal_point.y);
        }
        if self.refine.distortion {
            params.extend([self.intrinsics.k1, self.intrinsics.k2, self.intrinsics.k3]);
        }
        DVector::from_vec(params)
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(2 * self.observations.len());
        for (ix, observation) in self.observations.iter().enumerate() {
            let pose = self.poses.get(observation.view)?;
            // Points pushed behind the camera are clamped onto a tiny depth, which makes
            // their residual huge instead of undefined.
            let mut camera = pose.transform(&observation.world);
            camera.z = camera.z.max(MIN_DEPTH);
            let projected = self
                .intrinsics
                .uncalibrate(Point2::new(camera.x / camera.z, camera.y / camera.z));
            residuals[2 * ix] = projected.x - observation.pixel.x;
            residuals[2 * ix + 1] = projected.y - observation.pixel.y;
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut clone = self.clone();
        differentiate_numerically(&mut clone)
    }
}
