use crate::{ViewFeatures, ViewRegions};
use cv_resection::{
    sample_consensus::{Consensus, Estimator},
    EightPoint, FeatureMatch, FundamentalMatrix, PinholeRadial, Ransac,
};
use log::*;
use nalgebra::Point2;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Epipolar tolerance of guided matching as a fraction of the larger image diagonal.
pub const GUIDED_TOLERANCE: f64 = 0.004;

/// Seed of the fundamental matrix consensus so that matching is reproducible.
const GUIDED_SEED: u64 = 0x6775_6964;

/// A query feature matched to a region of a candidate view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndMatch {
    /// Index into the query features.
    pub query: usize,
    /// Index into the candidate view regions.
    pub region: usize,
}

/// Matches query features against the reconstructed regions of one candidate view.
///
/// A query feature matches its nearest region if that region is closer than `ratio` times the
/// distance to the second nearest one. With `guided` set, a fundamental matrix is estimated from
/// those matches and every query feature is matched again among only the regions that lie close
/// to its epipolar line.
///
/// The matches are sorted by query index and no query feature is matched twice.
#[allow(clippy::too_many_arguments)]
pub fn match_regions(
    query: &ViewFeatures,
    query_intrinsics: Option<&PinholeRadial>,
    regions: &ViewRegions,
    candidate_intrinsics: Option<&PinholeRadial>,
    ratio: f32,
    guided: bool,
    query_size: (u32, u32),
    candidate_size: (u32, u32),
) -> Vec<IndMatch> {
    let ratio_squared = ratio * ratio;
    let putative: Vec<IndMatch> = query
        .descriptors
        .iter()
        .enumerate()
        .filter_map(|(ix, descriptor)| {
            match regions.nearest_two(descriptor).as_slice() {
                &[(best, d1), (_, d2)] if d1 < ratio_squared * d2 => Some(IndMatch {
                    query: ix,
                    region: best,
                }),
                _ => None,
            }
        })
        .collect();
    trace!(
        "ratio test kept {} of {} query features against view {}",
        putative.len(),
        query.len(),
        regions.view()
    );

    let min_samples = <EightPoint as Estimator<FeatureMatch>>::MIN_SAMPLES;
    if !guided || putative.len() < min_samples {
        return putative;
    }

    let query_pixels: Vec<Point2<f64>> = (0..query.len())
        .map(|ix| {
            let pixel = query.keypoint(ix).unwrap_or_else(Point2::origin);
            undistorted(query_intrinsics, pixel)
        })
        .collect();
    let region_pixels: Vec<Point2<f64>> = regions
        .regions()
        .iter()
        .map(|region| undistorted(candidate_intrinsics, region.keypoint))
        .collect();

    let diagonal = |(width, height): (u32, u32)| f64::from(width).hypot(f64::from(height));
    let tolerance = GUIDED_TOLERANCE * diagonal(query_size).max(diagonal(candidate_size));
    let pairs: Vec<FeatureMatch> = putative
        .iter()
        .map(|m| FeatureMatch(query_pixels[m.query], region_pixels[m.region]))
        .collect();
    let mut ransac = Ransac::new(tolerance, Xoshiro256PlusPlus::seed_from_u64(GUIDED_SEED));
    let fundamental = match ransac.model(&EightPoint::new(), pairs.iter().copied()) {
        Some(fundamental) => fundamental,
        None => {
            debug!(
                "no fundamental matrix for view {}, keeping {} putative matches",
                regions.view(),
                putative.len()
            );
            return putative;
        }
    };

    let guided = guided_matches(
        query,
        &query_pixels,
        regions,
        &region_pixels,
        &fundamental,
        tolerance,
        ratio_squared,
    );
    debug!(
        "guided matching against view {} found {} matches (from {} putative)",
        regions.view(),
        guided.len(),
        putative.len()
    );
    guided
}

fn undistorted(intrinsics: Option<&PinholeRadial>, pixel: Point2<f64>) -> Point2<f64> {
    match intrinsics {
        Some(intrinsics) if intrinsics.has_focal() && intrinsics.has_distortion() => {
            intrinsics.undistort_pixel(pixel)
        }
        _ => pixel,
    }
}

/// Ratio test among the regions within `tolerance` of each query epipolar line. A lone region
/// within tolerance is accepted.
fn guided_matches(
    query: &ViewFeatures,
    query_pixels: &[Point2<f64>],
    regions: &ViewRegions,
    region_pixels: &[Point2<f64>],
    fundamental: &FundamentalMatrix,
    tolerance: f64,
    ratio_squared: f32,
) -> Vec<IndMatch> {
    let mut matches = vec![];
    for (ix, (descriptor, &pixel)) in query.descriptors.iter().zip(query_pixels).enumerate() {
        let mut best = (usize::MAX, f32::INFINITY);
        let mut second = f32::INFINITY;
        for (region_ix, (region, &region_pixel)) in
            regions.regions().iter().zip(region_pixels).enumerate()
        {
            if fundamental.epipolar_distance(pixel, region_pixel) > tolerance {
                continue;
            }
            let distance = descriptor.distance_squared(&region.descriptor);
            if distance < best.1 {
                second = best.1;
                best = (region_ix, distance);
            } else if distance < second {
                second = distance;
            }
        }
        if best.0 != usize::MAX && (second.is_infinite() || best.1 < ratio_squared * second) {
            matches.push(IndMatch {
                query: ix,
                region: best.0,
            });
        }
    }
    matches
}
