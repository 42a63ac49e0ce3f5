//! Camera resection: recovering the pose of a camera, and optionally its intrinsics, from
//! pixels matched to known 3D points.
//!
//! [`resect`] runs a minimal solver inside a seeded [`Ransac`] loop and polishes the winning
//! hypothesis with Levenberg-Marquardt. With known intrinsics the minimal solver is the
//! [`LambdaTwist`] P3P solver. When the intrinsics must be estimated and no usable focal length
//! is known, a six point [`Dlt6`] is used instead.
//!
//! The crate also carries the [`EightPoint`] fundamental matrix estimator used to geometrically
//! verify image to image matches.

mod camera;
mod dlt;
mod fundamental;
mod p3p;
mod pose;
mod ransac;
mod refine;
mod settings;

pub use camera::*;
pub use dlt::Dlt6;
pub use fundamental::*;
pub use p3p::*;
pub use pose::*;
pub use ransac::*;
pub use refine::*;
pub use settings::*;

pub use sample_consensus;

use log::*;
use nalgebra::{Point2, Point3};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sample_consensus::{Consensus, Estimator, Model};
use thiserror::Error;

/// A pixel in the image being resected matched to a point in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureWorldMatch(pub Point2<f64>, pub Point3<f64>);

/// A candidate camera: a pose together with the intrinsics it was estimated with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraHypothesis {
    pub pose: WorldToCamera,
    pub intrinsics: PinholeRadial,
}

impl Model<FeatureWorldMatch> for CameraHypothesis {
    /// The reprojection error in pixels, or infinity if the point is behind the camera.
    fn residual(&self, data: &FeatureWorldMatch) -> f64 {
        let &FeatureWorldMatch(pixel, world) = data;
        self.intrinsics
            .residual(&self.pose, &world, &pixel)
            .map_or(f64::INFINITY, |r| r.norm())
    }
}

/// A successful resection.
#[derive(Debug, Clone, PartialEq)]
pub struct Resection {
    pub pose: WorldToCamera,
    pub intrinsics: PinholeRadial,
    /// Indices of the inlier matches, in input order.
    pub inliers: Vec<usize>,
    /// Root mean square reprojection error of the inliers in pixels.
    pub residual_rmse: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResectionError {
    #[error("resection needs at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences { required: usize, actual: usize },
    #[error("no camera hypothesis explained enough of the {correspondences} correspondences")]
    ResectionFailed { correspondences: usize },
    #[error("the focal length {focal} is unusable and intrinsics are not estimated")]
    InvalidIntrinsics { focal: f64 },
}

/// Robustly estimates the camera that observed `matches`.
///
/// Without `estimate_intrinsics`, the intrinsics are held at `intrinsics_hint`, which must have a
/// usable focal length. With it, the hint (or a [`Dlt6`] estimate, if the hint has no usable focal
/// length) only seeds the refinement of focal length, principal point and distortion.
///
/// On success every inlier reprojects within `error_max` pixels.
pub fn resect(
    matches: &[FeatureWorldMatch],
    intrinsics_hint: &PinholeRadial,
    estimate_intrinsics: bool,
    error_max: f64,
    settings: &ResectionSettings,
) -> Result<Resection, ResectionError> {
    if !estimate_intrinsics && !intrinsics_hint.has_focal() {
        return Err(ResectionError::InvalidIntrinsics {
            focal: intrinsics_hint.focal,
        });
    }
    let mut ransac = Ransac::new(error_max, Xoshiro256PlusPlus::seed_from_u64(settings.seed))
        .max_iterations(settings.max_iterations)
        .confidence(settings.confidence);

    let consensus = if intrinsics_hint.has_focal() {
        robust_hypothesis(&mut ransac, &LambdaTwist::new(*intrinsics_hint), matches)?
    } else {
        info!("no usable focal length, estimating the projection matrix directly");
        robust_hypothesis(
            &mut ransac,
            &Dlt6::new(intrinsics_hint.width, intrinsics_hint.height),
            matches,
        )?
    };
    let (hypothesis, inliers) = consensus;
    info!(
        "consensus found {} inliers out of {} correspondences",
        inliers.len(),
        matches.len()
    );

    let refine = RefineParameters {
        focal: estimate_intrinsics,
        principal_point: estimate_intrinsics,
        distortion: estimate_intrinsics,
        ..RefineParameters::pose()
    };
    let (hypothesis, inliers) =
        refine_hypothesis(&ransac, hypothesis, inliers, matches, refine, settings);

    let required = if intrinsics_hint.has_focal() {
        <LambdaTwist as Estimator<FeatureWorldMatch>>::MIN_SAMPLES
    } else {
        <Dlt6 as Estimator<FeatureWorldMatch>>::MIN_SAMPLES
    };
    if inliers.len() < required {
        return Err(ResectionError::ResectionFailed {
            correspondences: matches.len(),
        });
    }
    let residual_rmse = (inliers
        .iter()
        .map(|&ix| hypothesis.residual(&matches[ix]).powi(2))
        .sum::<f64>()
        / inliers.len() as f64)
        .sqrt();
    Ok(Resection {
        pose: hypothesis.pose,
        intrinsics: hypothesis.intrinsics,
        inliers,
        residual_rmse,
    })
}

fn robust_hypothesis<E>(
    ransac: &mut Ransac<Xoshiro256PlusPlus>,
    estimator: &E,
    matches: &[FeatureWorldMatch],
) -> Result<(CameraHypothesis, Vec<usize>), ResectionError>
where
    E: Estimator<FeatureWorldMatch, Model = CameraHypothesis>,
{
    if matches.len() < E::MIN_SAMPLES {
        return Err(ResectionError::InsufficientCorrespondences {
            required: E::MIN_SAMPLES,
            actual: matches.len(),
        });
    }
    ransac
        .model_inliers(estimator, matches.iter().copied())
        .ok_or(ResectionError::ResectionFailed {
            correspondences: matches.len(),
        })
}

/// Polishes a hypothesis on its inliers. The refined hypothesis is only kept if it loses no inlier.
fn refine_hypothesis(
    ransac: &Ransac<Xoshiro256PlusPlus>,
    hypothesis: CameraHypothesis,
    inliers: Vec<usize>,
    matches: &[FeatureWorldMatch],
    refine: RefineParameters,
    settings: &ResectionSettings,
) -> (CameraHypothesis, Vec<usize>) {
    let observations: Vec<Observation> = inliers
        .iter()
        .map(|&ix| Observation {
            view: 0,
            world: matches[ix].1,
            pixel: matches[ix].0,
        })
        .collect();
    let problem = ReprojectionProblem::new(
        vec![hypothesis.pose],
        hypothesis.intrinsics,
        &observations,
        refine,
    );
    let (problem, _) = problem.minimize(settings.refine_patience);
    let refined = CameraHypothesis {
        pose: problem.poses[0],
        intrinsics: problem.intrinsics,
    };
    if !refined.intrinsics.has_focal() {
        warn!("refinement produced an unusable focal length, keeping the consensus hypothesis");
        return (hypothesis, inliers);
    }
    let (refined_inliers, _) = ransac.inliers(&refined, matches);
    let keeps_all = inliers.iter().all(|ix| refined_inliers.binary_search(ix).is_ok());
    if keeps_all {
        debug!(
            "refinement kept all {} inliers and now has {}",
            inliers.len(),
            refined_inliers.len()
        );
        (refined, refined_inliers)
    } else {
        debug!("refinement lost inliers, keeping the consensus hypothesis");
        (hypothesis, inliers)
    }
}
