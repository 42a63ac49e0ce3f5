use cv_resection::{
    Observation, PinholeRadial, RefineParameters, ReprojectionProblem, WorldToCamera,
};
use log::*;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign},
};
use thiserror::Error;

/// Parameter groups a [`BundleAdjuster`] may change.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefineFlags(u8);

impl RefineFlags {
    pub const NONE: Self = Self(0);
    pub const ROTATION: Self = Self(1);
    pub const TRANSLATION: Self = Self(2);
    pub const STRUCTURE: Self = Self(4);
    pub const INTRINSICS_FOCAL: Self = Self(8);
    pub const INTRINSICS_OPTICAL_CENTER_ALWAYS: Self = Self(16);
    pub const INTRINSICS_OPTICAL_CENTER_IF_ENOUGH_DATA: Self = Self(32);
    pub const INTRINSICS_DISTORTION: Self = Self(64);
    pub const INTRINSICS_ALL: Self = Self(
        Self::INTRINSICS_FOCAL.0
            | Self::INTRINSICS_OPTICAL_CENTER_IF_ENOUGH_DATA.0
            | Self::INTRINSICS_DISTORTION.0,
    );
    pub const ALL: Self = Self(
        Self::ROTATION.0
            | Self::TRANSLATION.0
            | Self::STRUCTURE.0
            | Self::INTRINSICS_FOCAL.0
            | Self::INTRINSICS_OPTICAL_CENTER_ALWAYS.0
            | Self::INTRINSICS_OPTICAL_CENTER_IF_ENOUGH_DATA.0
            | Self::INTRINSICS_DISTORTION.0,
    );

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// `None` if a bit does not name a parameter group.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Whether every group of `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RefineFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RefineFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RefineFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for RefineFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(RefineFlags, &str); 7] = [
            (RefineFlags::ROTATION, "ROTATION"),
            (RefineFlags::TRANSLATION, "TRANSLATION"),
            (RefineFlags::STRUCTURE, "STRUCTURE"),
            (RefineFlags::INTRINSICS_FOCAL, "INTRINSICS_FOCAL"),
            (
                RefineFlags::INTRINSICS_OPTICAL_CENTER_ALWAYS,
                "INTRINSICS_OPTICAL_CENTER_ALWAYS",
            ),
            (
                RefineFlags::INTRINSICS_OPTICAL_CENTER_IF_ENOUGH_DATA,
                "INTRINSICS_OPTICAL_CENTER_IF_ENOUGH_DATA",
            ),
            (RefineFlags::INTRINSICS_DISTORTION, "INTRINSICS_DISTORTION"),
        ];
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A landmark observed by one of the poses of a [`SceneData`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneObservation {
    /// Index into [`SceneData::poses`].
    pub view: usize,
    /// Index into [`SceneData::landmarks`].
    pub landmark: usize,
    pub pixel: Point2<f64>,
}

/// Views sharing one camera, the landmarks they observe and the observations themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneData {
    pub intrinsics: PinholeRadial,
    pub poses: Vec<WorldToCamera>,
    pub landmarks: Vec<Point3<f64>>,
    pub observations: Vec<SceneObservation>,
}

impl SceneData {
    /// The pixel error of every observation, `None` for those behind their camera or
    /// referencing a missing pose or landmark.
    pub fn residuals(&self) -> impl Iterator<Item = (usize, Option<nalgebra::Vector2<f64>>)> + '_ {
        self.observations.iter().map(move |observation| {
            let residual = match (
                self.poses.get(observation.view),
                self.landmarks.get(observation.landmark),
            ) {
                (Some(pose), Some(landmark)) => {
                    self.intrinsics
                        .residual(pose, landmark, &observation.pixel)
                }
                _ => None,
            };
            (observation.view, residual)
        })
    }
}

/// What an adjustment achieved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustReport {
    pub refined: RefineFlags,
    pub parameters: usize,
    pub observations: usize,
    /// Root mean square reprojection error in pixels before and after.
    pub initial_rmse: f64,
    pub final_rmse: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdjustError {
    #[error("refining the structure is not supported")]
    StructureUnsupported,
    #[error("no parameter group was selected for refinement")]
    NothingToRefine,
    #[error("the problem has no observations")]
    NoObservations,
    #[error("observation {index} references a missing pose or landmark")]
    InvalidObservation { index: usize },
    #[error("observation {index} lies behind its camera")]
    BehindCamera { index: usize },
    #[error("the solver stopped without converging (rmse {initial_rmse} to {final_rmse})")]
    DidNotConverge { initial_rmse: f64, final_rmse: f64 },
}

/// A bundle adjustment backend.
///
/// On success the selected parameter groups of `scene` hold the refined values. On failure
/// `scene` is unchanged.
pub trait BundleAdjuster {
    fn adjust(&self, scene: &mut SceneData, refine: RefineFlags)
        -> Result<AdjustReport, AdjustError>;
}

/// Minimizes the reprojection error with Levenberg-Marquardt, keeping landmarks fixed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardtAdjuster {
    pub patience: usize,
    /// The fewest poses for which the optical center is refined when it is only refined with
    /// enough data.
    pub min_views_for_optical_center: usize,
}

impl Default for LevenbergMarquardtAdjuster {
    fn default() -> Self {
        Self {
            patience: 1000,
            min_views_for_optical_center: 3,
        }
    }
}

impl LevenbergMarquardtAdjuster {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            ..Self::default()
        }
    }

    /// The parameter groups actually refined for `views` poses.
    pub fn effective(&self, refine: RefineFlags, views: usize) -> RefineParameters {
        RefineParameters {
            rotation: refine.contains(RefineFlags::ROTATION),
            translation: refine.contains(RefineFlags::TRANSLATION),
            focal: refine.contains(RefineFlags::INTRINSICS_FOCAL),
            principal_point: refine.contains(RefineFlags::INTRINSICS_OPTICAL_CENTER_ALWAYS)
                || (refine.contains(RefineFlags::INTRINSICS_OPTICAL_CENTER_IF_ENOUGH_DATA)
                    && views >= self.min_views_for_optical_center),
            distortion: refine.contains(RefineFlags::INTRINSICS_DISTORTION),
        }
    }
}

impl BundleAdjuster for LevenbergMarquardtAdjuster {
    fn adjust(
        &self,
        scene: &mut SceneData,
        refine: RefineFlags,
    ) -> Result<AdjustReport, AdjustError> {
        if refine.contains(RefineFlags::STRUCTURE) {
            return Err(AdjustError::StructureUnsupported);
        }
        let parameters = self.effective(refine, scene.poses.len());
        if parameters == RefineParameters::default() {
            return Err(AdjustError::NothingToRefine);
        }
        if scene.observations.is_empty() {
            return Err(AdjustError::NoObservations);
        }
        let mut observations = Vec::with_capacity(scene.observations.len());
        for (index, observation) in scene.observations.iter().enumerate() {
            let world = scene
                .landmarks
                .get(observation.landmark)
                .filter(|_| observation.view < scene.poses.len())
                .ok_or(AdjustError::InvalidObservation { index })?;
            observations.push(Observation {
                view: observation.view,
                world: *world,
                pixel: observation.pixel,
            });
        }

        let problem = ReprojectionProblem::new(
            scene.poses.clone(),
            scene.intrinsics,
            &observations,
            parameters,
        );
        let initial_rmse = match problem.rmse() {
            Some(rmse) => rmse,
            None => {
                let index = scene
                    .residuals()
                    .position(|(_, residual)| residual.is_none())
                    .unwrap_or(0);
                return Err(AdjustError::BehindCamera { index });
            }
        };
        let num_parameters = problem.num_params();
        let (problem, converged) = problem.minimize(self.patience);
        let final_rmse = problem.rmse().unwrap_or(f64::INFINITY);
        if !converged || !final_rmse.is_finite() || !problem.intrinsics.has_focal() {
            warn!(
                "bundle adjustment of {} views did not converge (rmse {} to {})",
                scene.poses.len(),
                initial_rmse,
                final_rmse
            );
            return Err(AdjustError::DidNotConverge {
                initial_rmse,
                final_rmse,
            });
        }
        info!(
            "bundle adjustment of {} views over {:?}: rmse {:.4} to {:.4} px",
            scene.poses.len(),
            refine,
            initial_rmse,
            final_rmse
        );
        scene.poses = problem.poses;
        scene.intrinsics = problem.intrinsics;
        Ok(AdjustReport {
            refined: refine,
            parameters: num_parameters,
            observations: observations.len(),
            initial_rmse,
            final_rmse,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector3};

    fn scene(views: usize) -> SceneData {
        let intrinsics = PinholeRadial::new(800, 600, 700.0, Point2::new(400.0, 300.0));
        let poses: Vec<WorldToCamera> = (0..views)
            .map(|i| {
                let i = i as f64;
                WorldToCamera::from_parts(
                    Vector3::new(0.3 * i - 0.3, 0.1 * i, 5.0),
                    Rotation3::from_euler_angles(0.02 * i, -0.05 * i, 0.01),
                )
            })
            .collect();
        let landmarks: Vec<Point3<f64>> = (0..40)
            .map(|i| {
                let i = i as f64;
                Point3::new((i * 0.7).sin() * 1.5, (i * 1.3).cos(), (i * 0.4).sin())
            })
            .collect();
        let mut observations = vec![];
        for (view, pose) in poses.iter().enumerate() {
            for (landmark, world) in landmarks.iter().enumerate() {
                observations.push(SceneObservation {
                    view,
                    landmark,
                    pixel: intrinsics.project(pose, world).unwrap(),
                });
            }
        }
        SceneData {
            intrinsics,
            poses,
            landmarks,
            observations,
        }
    }

    #[test]
    fn flag_algebra() {
        let flags = RefineFlags::ROTATION | RefineFlags::TRANSLATION;
        assert_eq!(flags.bits(), 3);
        assert!(flags.contains(RefineFlags::ROTATION));
        assert!(!flags.contains(RefineFlags::INTRINSICS_FOCAL));
        assert_eq!(RefineFlags::INTRINSICS_ALL.bits(), 8 | 32 | 64);
        assert_eq!(RefineFlags::ALL.bits(), 127);
        assert_eq!(RefineFlags::from_bits(128), None);
        assert_eq!(flags & RefineFlags::TRANSLATION, RefineFlags::TRANSLATION);
        assert_eq!(format!("{:?}", flags), "ROTATION | TRANSLATION");
        assert_eq!(format!("{:?}", RefineFlags::NONE), "NONE");
    }

    #[test]
    fn optical_center_needs_enough_views() {
        let adjuster = LevenbergMarquardtAdjuster::default();
        let flags = RefineFlags::ROTATION | RefineFlags::INTRINSICS_ALL;
        assert!(!adjuster.effective(flags, 2).principal_point);
        assert!(adjuster.effective(flags, 3).principal_point);
        assert!(
            adjuster
                .effective(RefineFlags::INTRINSICS_OPTICAL_CENTER_ALWAYS, 1)
                .principal_point
        );
    }

    #[test]
    fn recovers_perturbed_poses_and_focal() {
        let truth = scene(3);
        let mut perturbed = truth.clone();
        perturbed.intrinsics.focal = 690.0;
        for (i, pose) in perturbed.poses.iter_mut().enumerate() {
            pose.0.translation.vector += Vector3::new(0.02, -0.01 * i as f64, 0.05);
        }
        let report = LevenbergMarquardtAdjuster::default()
            .adjust(
                &mut perturbed,
                RefineFlags::ROTATION | RefineFlags::TRANSLATION | RefineFlags::INTRINSICS_FOCAL,
            )
            .unwrap();
        assert!(report.initial_rmse > 1.0);
        assert!(report.final_rmse < 1e-6);
        assert_eq!(report.parameters, 3 * 6 + 1);
        assert_relative_eq!(perturbed.intrinsics.focal, 700.0, epsilon = 1e-4);
        for (refined, truth) in perturbed.poses.iter().zip(&truth.poses) {
            assert_relative_eq!(refined.0, truth.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn rejected_problems_leave_the_scene_alone() {
        let original = scene(2);
        let adjuster = LevenbergMarquardtAdjuster::default();

        let mut scene_data = original.clone();
        assert_eq!(
            adjuster.adjust(&mut scene_data, RefineFlags::ALL),
            Err(AdjustError::StructureUnsupported)
        );
        assert_eq!(
            adjuster.adjust(&mut scene_data, RefineFlags::NONE),
            Err(AdjustError::NothingToRefine)
        );
        assert_eq!(scene_data, original);

        scene_data.observations[5].landmark = 1000;
        let dangling = scene_data.clone();
        assert_eq!(
            adjuster.adjust(&mut scene_data, RefineFlags::ROTATION),
            Err(AdjustError::InvalidObservation { index: 5 })
        );
        assert_eq!(scene_data, dangling);
        scene_data.observations[5].landmark = original.observations[5].landmark;

        scene_data.landmarks[0].z = -20.0;
        let behind = scene_data.clone();
        assert!(matches!(
            adjuster.adjust(&mut scene_data, RefineFlags::ROTATION),
            Err(AdjustError::BehindCamera { .. })
        ));
        assert_eq!(scene_data, behind);
        scene_data.landmarks[0] = original.landmarks[0];
        assert_eq!(scene_data, original);
    }
}
