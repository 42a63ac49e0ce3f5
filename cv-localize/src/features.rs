use crate::{InitializationError, Scene, ViewId};
use cv_voctree::Descriptor;
use log::*;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

/// Keypoints of one image with their descriptors, index for index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewFeatures {
    pub keypoints: Vec<[f64; 2]>,
    pub descriptors: Vec<Descriptor>,
}

impl ViewFeatures {
    pub fn new(keypoints: Vec<[f64; 2]>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            keypoints,
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn keypoint(&self, ix: usize) -> Option<Point2<f64>> {
        self.keypoints.get(ix).map(|&[x, y]| Point2::new(x, y))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, InitializationError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| InitializationError::Io {
            path: path.to_owned(),
            source,
        })?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| {
            InitializationError::Bincode {
                path: path.to_owned(),
                source,
            }
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), InitializationError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| InitializationError::Io {
            path: path.to_owned(),
            source,
        })?;
        bincode::serialize_into(BufWriter::new(file), self).map_err(|source| {
            InitializationError::Bincode {
                path: path.to_owned(),
                source,
            }
        })
    }
}

/// Where the features of `view` live inside `dir`.
pub fn features_path(dir: impl AsRef<Path>, view: ViewId) -> PathBuf {
    dir.as_ref().join(format!("{}.desc", view))
}

/// Loads the features of every view that observes a landmark.
pub fn load_scene_features(
    dir: impl AsRef<Path>,
    scene: &Scene,
) -> Result<HashMap<ViewId, ViewFeatures>, InitializationError> {
    let dir = dir.as_ref();
    let views = scene.observing_views();
    let mut features = HashMap::with_capacity(views.len());
    for view in views {
        let path = features_path(dir, view);
        if !path.is_file() {
            error!("features of view {} are missing at {:?}", view, path);
            return Err(InitializationError::MissingFeatures(view));
        }
        let loaded = ViewFeatures::load(&path)?;
        debug!("loaded {} features of view {}", loaded.len(), view);
        features.insert(view, loaded);
    }
    info!("loaded features of {} views from {:?}", features.len(), dir);
    Ok(features)
}
