use crate::{LandmarkId, LocalizationAlgorithm, LocalizeError, Parameters, ViewId};
use cv_resection::Resection;
use itertools::Itertools;
use log::*;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A view returned by image retrieval and its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub view: ViewId,
    pub score: f32,
}

/// A query feature matched to a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// Index of the query feature.
    pub feature: usize,
    pub landmark: LandmarkId,
    /// Position of the query feature in the query image.
    pub pixel: Point2<f64>,
    /// Position of the landmark in the world.
    pub point: Point3<f64>,
}

/// The steps of localizing one query that the strategies are assembled from.
pub trait CandidatePipeline {
    /// Candidate views for the query, best first, at most `max_results` of them.
    fn retrieve(&self, max_results: usize) -> Result<Vec<Candidate>, LocalizeError>;

    /// Correspondences between the query and the landmarks seen by `view`, in query order.
    fn correspondences(&self, view: ViewId) -> Result<Vec<Correspondence>, LocalizeError>;

    /// The landmarks seen by `view`.
    fn landmarks_of(&self, view: ViewId) -> Result<BTreeSet<LandmarkId>, LocalizeError>;

    /// Resects the query camera from `pool`. Inlier indices reference `pool`.
    fn resect(&self, pool: &[Correspondence]) -> Result<Resection, LocalizeError>;
}

/// The winning resection of a strategy with the correspondences it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub resection: Resection,
    pub pool: Vec<Correspondence>,
    /// The views whose correspondences make up the pool, best ranked first.
    pub candidates: Vec<ViewId>,
}

/// Retrieves candidates for the query and resects it with the strategy `params` selects.
pub fn run_strategy<P>(pipeline: &P, params: &Parameters) -> Result<StrategyOutcome, LocalizeError>
where
    P: CandidatePipeline + ?Sized,
{
    let retrieved = pipeline.retrieve(params.max_results)?;
    if retrieved.is_empty() {
        return Err(LocalizeError::NoCandidates);
    }
    let candidates: Vec<ViewId> = retrieved
        .iter()
        .take(params.num_results.max(1))
        .map(|candidate| candidate.view)
        .collect();
    info!(
        "retrieved {} views, using {:?} with {} candidates",
        retrieved.len(),
        params.algorithm,
        candidates.len()
    );

    let groups = match params.algorithm {
        LocalizationAlgorithm::FirstBest => vec![vec![candidates[0]]],
        LocalizationAlgorithm::BestResult => candidates.iter().map(|&view| vec![view]).collect(),
        LocalizationAlgorithm::AllResults => vec![candidates],
        LocalizationAlgorithm::Cluster => {
            let qualifying: Vec<Vec<ViewId>> = clusters(pipeline, &candidates)?
                .into_iter()
                .filter(|cluster| {
                    let keep = cluster.len() >= params.num_common_views;
                    if !keep {
                        debug!(
                            "skipping cluster {:?}, it has fewer than {} views",
                            cluster, params.num_common_views
                        );
                    }
                    keep
                })
                .collect();
            if qualifying.is_empty() {
                return Err(LocalizeError::NoQualifyingCluster {
                    required: params.num_common_views,
                });
            }
            qualifying
        }
    };
    best_resection(pipeline, groups)
}

/// Pools the correspondences of `views` in order, keeping the first correspondence of each
/// landmark.
pub fn pool_correspondences<P>(
    pipeline: &P,
    views: &[ViewId],
) -> Result<Vec<Correspondence>, LocalizeError>
where
    P: CandidatePipeline + ?Sized,
{
    let mut pool = vec![];
    for &view in views {
        pool.extend(pipeline.correspondences(view)?);
    }
    Ok(pool
        .into_iter()
        .unique_by(|correspondence| correspondence.landmark)
        .collect())
}

/// Groups `candidates` into the connected components of the "sees a common landmark" relation.
///
/// Clusters are ordered by their best ranked view and list their views by rank.
pub fn clusters<P>(pipeline: &P, candidates: &[ViewId]) -> Result<Vec<Vec<ViewId>>, LocalizeError>
where
    P: CandidatePipeline + ?Sized,
{
    let landmarks = candidates
        .iter()
        .map(|&view| pipeline.landmarks_of(view))
        .collect::<Result<Vec<_>, _>>()?;
    let mut assigned = vec![false; candidates.len()];
    let mut clusters = vec![];
    for start in 0..candidates.len() {
        if assigned[start] {
            continue;
        }
        assigned[start] = true;
        let mut members = vec![start];
        let mut frontier = vec![start];
        while let Some(current) = frontier.pop() {
            for other in 0..candidates.len() {
                if !assigned[other] && !landmarks[current].is_disjoint(&landmarks[other]) {
                    assigned[other] = true;
                    members.push(other);
                    frontier.push(other);
                }
            }
        }
        members.sort_unstable();
        clusters.push(members.into_iter().map(|ix| candidates[ix]).collect());
    }
    Ok(clusters)
}

/// Resects every group and keeps the result with the most inliers, the earlier group on ties.
///
/// Failures of single groups, in matching or resection, are absorbed. If every group fails the
/// error of the first one is returned.
fn best_resection<P>(
    pipeline: &P,
    groups: Vec<Vec<ViewId>>,
) -> Result<StrategyOutcome, LocalizeError>
where
    P: CandidatePipeline + ?Sized,
{
    let mut best: Option<StrategyOutcome> = None;
    let mut first_error = None;
    for views in groups {
        let pool = match pool_correspondences(pipeline, &views) {
            Ok(pool) => pool,
            Err(e) => {
                warn!("matching against views {:?} failed: {}", views, e);
                first_error.get_or_insert(e);
                continue;
            }
        };
        info!(
            "found {} correspondences against views {:?}",
            pool.len(),
            views
        );
        match pipeline.resect(&pool) {
            Ok(resection) => {
                info!(
                    "resected {} inliers against views {:?}",
                    resection.inliers.len(),
                    views
                );
                let better = best.as_ref().map_or(true, |best| {
                    resection.inliers.len() > best.resection.inliers.len()
                });
                if better {
                    best = Some(StrategyOutcome {
                        resection,
                        pool,
                        candidates: views,
                    });
                }
            }
            Err(e) => {
                warn!("resection against views {:?} failed: {}", views, e);
                first_error.get_or_insert(e);
            }
        }
    }
    match (best, first_error) {
        (Some(best), _) => Ok(best),
        (None, Some(e)) => Err(e),
        (None, None) => Err(LocalizeError::NoCandidates),
    }
}
