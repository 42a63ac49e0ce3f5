use crate::{Scene, SceneData, ViewId};
use average::{Max, Mean, Min};
use float_ord::FloatOrd;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of the absolute `x` and `y` reprojection residuals of one view, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualStats {
    /// Number of residual components, two per observation.
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl ResidualStats {
    /// `None` for no values.
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mean: Mean = values.iter().copied().collect();
        let min: Min = values.iter().copied().collect();
        let max: Max = values.iter().copied().collect();
        values.sort_unstable_by_key(|&v| FloatOrd(v));
        let count = values.len();
        let median = if count % 2 == 1 {
            values[count / 2]
        } else {
            0.5 * (values[count / 2 - 1] + values[count / 2])
        };
        Some(Self {
            count,
            min: min.min(),
            max: max.max(),
            mean: mean.mean(),
            median,
        })
    }
}

/// Residual statistics of every posed view of a reconstruction that observes a landmark in
/// front of it.
pub fn residual_statistics(scene: &Scene) -> BTreeMap<ViewId, ResidualStats> {
    let mut residuals: BTreeMap<ViewId, Vec<f64>> = BTreeMap::new();
    for landmark in scene.landmarks() {
        for observation in &landmark.observations {
            let (pose, intrinsics) = match (
                scene.view(observation.view).ok().and_then(|view| view.pose),
                scene.intrinsics_of(observation.view).ok(),
            ) {
                (Some(pose), Some(intrinsics)) => (pose, intrinsics),
                _ => continue,
            };
            if let Some(r) = intrinsics.residual(&pose, &landmark.position, &observation.pixel) {
                residuals
                    .entry(observation.view)
                    .or_default()
                    .extend([r.x.abs(), r.y.abs()]);
            }
        }
    }
    residuals
        .into_iter()
        .filter_map(|(view, values)| Some((view, ResidualStats::from_values(values)?)))
        .collect()
}

/// Residual statistics of every pose of a bundle adjustment problem, keyed by pose index.
pub fn scene_data_statistics(scene: &SceneData) -> BTreeMap<usize, ResidualStats> {
    let mut residuals: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for (view, residual) in scene.residuals() {
        if let Some(r) = residual {
            residuals
                .entry(view)
                .or_default()
                .extend([r.x.abs(), r.y.abs()]);
        }
    }
    residuals
        .into_iter()
        .filter_map(|(view, values)| Some((view, ResidualStats::from_values(values)?)))
        .collect()
}
