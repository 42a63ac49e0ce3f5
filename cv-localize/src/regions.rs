use crate::{InitializationError, LandmarkId, LocalizeError, Scene, ViewFeatures, ViewId};
use cv_voctree::{Descriptor, DESCRIPTOR_LEN};
use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use log::*;
use nalgebra::Point2;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap},
    fmt,
    num::NonZeroUsize,
};

type DescriptorTree = ImmutableKdTree<f32, u32, DESCRIPTOR_LEN, 32>;

/// A feature of a reconstructed view that is the observation of a landmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructedRegion {
    /// Index of the feature in the features of its view.
    pub feature: usize,
    pub keypoint: Point2<f64>,
    pub descriptor: Descriptor,
    pub landmark: LandmarkId,
}

/// The reconstructed regions of one view with a nearest neighbor index over their descriptors.
pub struct ViewRegions {
    view: ViewId,
    regions: Vec<ReconstructedRegion>,
    tree: Option<DescriptorTree>,
}

impl ViewRegions {
    /// Indexes `regions`. A view with fewer than two regions cannot pass a ratio test, so no
    /// tree is built for it.
    pub fn new(view: ViewId, regions: Vec<ReconstructedRegion>) -> Self {
        let tree = if regions.len() >= 2 {
            let points: Vec<[f32; DESCRIPTOR_LEN]> =
                regions.iter().map(|region| region.descriptor.0).collect();
            Some(DescriptorTree::new_from_slice(&points))
        } else {
            None
        };
        Self {
            view,
            regions,
            tree,
        }
    }

    pub fn view(&self) -> ViewId {
        self.view
    }

    /// Regions sorted by feature index.
    pub fn regions(&self) -> &[ReconstructedRegion] {
        &self.regions
    }

    pub fn get(&self, ix: usize) -> Option<&ReconstructedRegion> {
        self.regions.get(ix)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> + '_ {
        self.regions.iter().map(|region| &region.descriptor)
    }

    /// The landmarks this view observes.
    pub fn landmarks(&self) -> BTreeSet<LandmarkId> {
        self.regions.iter().map(|region| region.landmark).collect()
    }

    /// The two regions closest to `descriptor` as `(region index, squared distance)`, closest
    /// first. Empty if the view has fewer than two regions.
    pub fn nearest_two(&self, descriptor: &Descriptor) -> Vec<(usize, f32)> {
        let tree = match &self.tree {
            Some(tree) => tree,
            None => return vec![],
        };
        let two = NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN);
        let mut nearest: Vec<(usize, f32)> = tree
            .nearest_n::<SquaredEuclidean>(&descriptor.0, two)
            .into_iter()
            .map(|neighbour| (neighbour.item as usize, neighbour.distance))
            .collect();
        nearest.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        nearest
    }
}

impl fmt::Debug for ViewRegions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewRegions")
            .field("view", &self.view)
            .field("regions", &self.regions.len())
            .finish()
    }
}

/// Per view reconstructed regions of a whole scene. Read only once built.
#[derive(Debug)]
pub struct RegionStore {
    views: BTreeMap<ViewId, ViewRegions>,
}

impl RegionStore {
    /// Keeps the features of every view that are observations of a landmark.
    ///
    /// When two landmarks claim the same feature, the one with the lower identifier keeps it.
    pub fn build(
        scene: &Scene,
        features: &HashMap<ViewId, ViewFeatures>,
    ) -> Result<Self, InitializationError> {
        for (&view, view_features) in features {
            if view_features.keypoints.len() != view_features.descriptors.len() {
                return Err(InitializationError::MalformedFeatures {
                    view,
                    keypoints: view_features.keypoints.len(),
                    descriptors: view_features.descriptors.len(),
                });
            }
        }

        let mut claimed: BTreeMap<ViewId, BTreeMap<usize, LandmarkId>> = BTreeMap::new();
        let mut shared = 0usize;
        for landmark in scene.landmarks() {
            for observation in &landmark.observations {
                let view_features = features
                    .get(&observation.view)
                    .ok_or(InitializationError::MissingFeatures(observation.view))?;
                if observation.feature >= view_features.len() {
                    error!(
                        "landmark {} observes feature {} of view {} past its end",
                        landmark.id, observation.feature, observation.view
                    );
                    return Err(InitializationError::FeatureOutOfRange {
                        landmark: landmark.id,
                        view: observation.view,
                        feature: observation.feature,
                        available: view_features.len(),
                    });
                }
                match claimed
                    .entry(observation.view)
                    .or_default()
                    .entry(observation.feature)
                {
                    Entry::Vacant(entry) => {
                        entry.insert(landmark.id);
                    }
                    Entry::Occupied(_) => shared += 1,
                }
            }
        }
        if shared != 0 {
            warn!("{} features are observations of more than one landmark", shared);
        }

        let mut views = BTreeMap::new();
        for (view, by_feature) in claimed {
            let view_features = features
                .get(&view)
                .ok_or(InitializationError::MissingFeatures(view))?;
            let regions = by_feature
                .into_iter()
                .map(|(feature, landmark)| ReconstructedRegion {
                    feature,
                    keypoint: Point2::new(
                        view_features.keypoints[feature][0],
                        view_features.keypoints[feature][1],
                    ),
                    descriptor: view_features.descriptors[feature],
                    landmark,
                })
                .collect();
            views.insert(view, ViewRegions::new(view, regions));
        }
        info!(
            "indexed {} reconstructed regions over {} views",
            views.values().map(ViewRegions::len).sum::<usize>(),
            views.len()
        );
        Ok(Self { views })
    }

    pub fn regions_of(&self, view: ViewId) -> Result<&ViewRegions, LocalizeError> {
        self.views.get(&view).ok_or(LocalizeError::UnknownView(view))
    }

    /// Views with at least one region, in ascending identifier order.
    pub fn views(&self) -> impl Iterator<Item = &ViewRegions> + '_ {
        self.views.values()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}
