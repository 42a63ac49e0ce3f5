use crate::{
    BundleAdjuster, Correspondence, LandmarkId, LocalizeError, RefineFlags, SceneData,
    SceneObservation,
};
use cv_resection::{PinholeRadial, WorldToCamera};
use log::*;
use std::collections::{btree_map::Entry, BTreeMap};

/// Jointly refines the poses of a sequence of localized frames that share one camera.
///
/// `correspondence_sets[i]` are the inlier correspondences of frame `i`. Landmarks observed by
/// several frames tie their poses together. Landmark positions stay fixed. With
/// `refine_intrinsics` the focal length, distortion and, given enough frames, the optical
/// center are refined too.
///
/// The refined values are returned; `intrinsics` and `poses` are never modified.
pub fn refine_sequence<A>(
    adjuster: &A,
    intrinsics: &PinholeRadial,
    poses: &[WorldToCamera],
    correspondence_sets: &[Vec<Correspondence>],
    refine_intrinsics: bool,
) -> Result<(PinholeRadial, Vec<WorldToCamera>), LocalizeError>
where
    A: BundleAdjuster + ?Sized,
{
    if poses.len() != correspondence_sets.len() {
        return Err(LocalizeError::SequenceLengthMismatch {
            poses: poses.len(),
            correspondence_sets: correspondence_sets.len(),
        });
    }
    let mut scene = sequence_scene(intrinsics, poses, correspondence_sets);
    let mut refine = RefineFlags::ROTATION | RefineFlags::TRANSLATION;
    if refine_intrinsics {
        refine |= RefineFlags::INTRINSICS_ALL;
    }
    info!(
        "refining {} frames with {} observations of {} landmarks",
        scene.poses.len(),
        scene.observations.len(),
        scene.landmarks.len()
    );
    let report = adjuster.adjust(&mut scene, refine)?;
    debug!("sequence refinement: {:?}", report);
    Ok((scene.intrinsics, scene.poses))
}

/// The bundle adjustment problem of a sequence, one landmark per distinct [`LandmarkId`].
pub fn sequence_scene(
    intrinsics: &PinholeRadial,
    poses: &[WorldToCamera],
    correspondence_sets: &[Vec<Correspondence>],
) -> SceneData {
    let mut landmark_index: BTreeMap<LandmarkId, usize> = BTreeMap::new();
    let mut landmarks = vec![];
    let mut observations = vec![];
    for (view, correspondences) in correspondence_sets.iter().enumerate() {
        for correspondence in correspondences {
            let landmark = match landmark_index.entry(correspondence.landmark) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    landmarks.push(correspondence.point);
                    *entry.insert(landmarks.len() - 1)
                }
            };
            observations.push(SceneObservation {
                view,
                landmark,
                pixel: correspondence.pixel,
            });
        }
    }
    SceneData {
        intrinsics: *intrinsics,
        poses: poses.to_vec(),
        landmarks,
        observations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdjustError, AdjustReport, LevenbergMarquardtAdjuster};
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Point3, Rotation3, Vector3};

    fn frames() -> (PinholeRadial, Vec<WorldToCamera>, Vec<Vec<Correspondence>>) {
        let intrinsics = PinholeRadial::new(640, 480, 600.0, Point2::new(320.0, 240.0));
        let poses: Vec<WorldToCamera> = (0..4)
            .map(|i| {
                let i = f64::from(i);
                WorldToCamera::from_parts(
                    Vector3::new(-0.2 * i, 0.05 * i, 4.0 + 0.1 * i),
                    Rotation3::from_euler_angles(0.0, 0.04 * i, 0.0),
                )
            })
            .collect();
        let sets = poses
            .iter()
            .map(|pose| {
                (0..30u32)
                    .map(|l| {
                        let f = f64::from(l);
                        let point = Point3::new((f * 0.9).sin(), (f * 0.5).cos() * 0.8, (f * 0.3).cos());
                        Correspondence {
                            feature: l as usize,
                            landmark: LandmarkId(l),
                            pixel: intrinsics.project(pose, &point).unwrap(),
                            point,
                        }
                    })
                    .collect()
            })
            .collect();
        (intrinsics, poses, sets)
    }

    #[test]
    fn shared_landmarks_are_merged() {
        let (intrinsics, poses, sets) = frames();
        let scene = sequence_scene(&intrinsics, &poses, &sets);
        assert_eq!(scene.landmarks.len(), 30);
        assert_eq!(scene.observations.len(), 120);
        assert_eq!(scene.observations[31].view, 1);
        assert_eq!(scene.observations[31].landmark, 1);
    }

    #[test]
    fn perturbed_sequence_converges() {
        let (intrinsics, poses, sets) = frames();
        let perturbed: Vec<WorldToCamera> = poses
            .iter()
            .map(|pose| {
                WorldToCamera::from_parts(
                    pose.0.translation.vector + Vector3::new(0.03, -0.02, 0.08),
                    Rotation3::from_euler_angles(0.01, -0.01, 0.005) * pose.0.rotation,
                )
            })
            .collect();
        let rough = PinholeRadial {
            focal: 615.0,
            ..intrinsics
        };
        let before = perturbed.clone();
        let (refined_intrinsics, refined) = refine_sequence(
            &LevenbergMarquardtAdjuster::default(),
            &rough,
            &perturbed,
            &sets,
            true,
        )
        .unwrap();
        assert_eq!(perturbed, before);
        assert_relative_eq!(refined_intrinsics.focal, 600.0, epsilon = 1e-3);
        for (refined, truth) in refined.iter().zip(&poses) {
            assert_relative_eq!(refined.0, truth.0, epsilon = 1e-5);
        }
    }

    struct NeverConverges;

    impl BundleAdjuster for NeverConverges {
        fn adjust(
            &self,
            scene: &mut SceneData,
            _: RefineFlags,
        ) -> Result<AdjustReport, AdjustError> {
            // Scribbles over the scene before failing.
            scene.poses.clear();
            scene.intrinsics.focal = -1.0;
            Err(AdjustError::DidNotConverge {
                initial_rmse: 1.0,
                final_rmse: 1.0,
            })
        }
    }

    #[test]
    fn failure_keeps_the_callers_values() {
        let (intrinsics, poses, sets) = frames();
        let result = refine_sequence(&NeverConverges, &intrinsics, &poses, &sets, false);
        assert!(matches!(result, Err(LocalizeError::RefinementDidNotConverge)));
        assert_eq!(poses.len(), 4);
        assert_eq!(intrinsics.focal, 600.0);
    }

    #[test]
    fn lengths_must_agree() {
        let (intrinsics, poses, sets) = frames();
        assert!(matches!(
            refine_sequence(
                &LevenbergMarquardtAdjuster::default(),
                &intrinsics,
                &poses[..2],
                &sets,
                false
            ),
            Err(LocalizeError::SequenceLengthMismatch {
                poses: 2,
                correspondence_sets: 4
            })
        ));
    }
}
