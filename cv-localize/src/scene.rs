use crate::{InitializationError, LocalizeError};
use cv_resection::{PinholeRadial, WorldToCamera};
use derive_more::{Display, From, Into};
use log::*;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// Identifies a view (a reconstructed image) of the scene.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ViewId(pub u32);

/// Identifies a landmark (a reconstructed 3D point) of the scene.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct LandmarkId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    /// Image the view was reconstructed from, informational only.
    #[serde(default)]
    pub path: Option<String>,
    /// Index into the scene intrinsics.
    pub intrinsic: u32,
    /// `None` for views the reconstruction could not register.
    #[serde(default)]
    pub pose: Option<WorldToCamera>,
}

/// A landmark seen at `pixel`, which is keypoint `feature` of `view`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkObservation {
    pub view: ViewId,
    pub feature: usize,
    pub pixel: Point2<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: LandmarkId,
    pub position: Point3<f64>,
    pub observations: Vec<LandmarkObservation>,
}

/// The on-disk form of a reconstruction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneFile {
    pub intrinsics: Vec<PinholeRadial>,
    pub views: Vec<View>,
    pub landmarks: Vec<Landmark>,
}

/// A validated reconstruction. Views and landmarks are looked up by identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    intrinsics: Vec<PinholeRadial>,
    views: BTreeMap<ViewId, View>,
    landmarks: BTreeMap<LandmarkId, Landmark>,
}

impl Scene {
    /// Validates a scene file: identifiers are unique, every view has intrinsics and every
    /// observation is made from a declared view.
    pub fn new(file: SceneFile) -> Result<Self, InitializationError> {
        let SceneFile {
            intrinsics,
            views: view_list,
            landmarks: landmark_list,
        } = file;

        let mut views = BTreeMap::new();
        for view in view_list {
            if view.intrinsic as usize >= intrinsics.len() {
                error!("view {} has no intrinsics", view.id);
                return Err(InitializationError::UnknownIntrinsic {
                    view: view.id,
                    intrinsic: view.intrinsic,
                });
            }
            match views.entry(view.id) {
                Entry::Vacant(entry) => {
                    entry.insert(view);
                }
                Entry::Occupied(entry) => {
                    return Err(InitializationError::DuplicateView(*entry.key()))
                }
            }
        }

        let mut landmarks = BTreeMap::new();
        for landmark in landmark_list {
            if let Some(observation) = landmark
                .observations
                .iter()
                .find(|observation| !views.contains_key(&observation.view))
            {
                error!(
                    "landmark {} is observed from missing view {}",
                    landmark.id, observation.view
                );
                return Err(InitializationError::DanglingObservation {
                    landmark: landmark.id,
                    view: observation.view,
                });
            }
            match landmarks.entry(landmark.id) {
                Entry::Vacant(entry) => {
                    entry.insert(landmark);
                }
                Entry::Occupied(entry) => {
                    return Err(InitializationError::DuplicateLandmark(*entry.key()))
                }
            }
        }

        Ok(Self {
            intrinsics,
            views,
            landmarks,
        })
    }

    /// Reads a JSON scene file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InitializationError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| InitializationError::Io {
            path: path.to_owned(),
            source,
        })?;
        let file: SceneFile = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            InitializationError::Json {
                path: path.to_owned(),
                source,
            }
        })?;
        let scene = Self::new(file)?;
        info!(
            "loaded scene with {} views and {} landmarks from {:?}",
            scene.views.len(),
            scene.landmarks.len(),
            path
        );
        Ok(scene)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), InitializationError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| InitializationError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::to_writer(BufWriter::new(file), &self.to_file()).map_err(|source| {
            InitializationError::Json {
                path: path.to_owned(),
                source,
            }
        })
    }

    pub fn to_file(&self) -> SceneFile {
        SceneFile {
            intrinsics: self.intrinsics.clone(),
            views: self.views.values().cloned().collect(),
            landmarks: self.landmarks.values().cloned().collect(),
        }
    }

    pub fn view(&self, id: ViewId) -> Result<&View, LocalizeError> {
        self.views.get(&id).ok_or(LocalizeError::UnknownView(id))
    }

    pub fn landmark(&self, id: LandmarkId) -> Result<&Landmark, LocalizeError> {
        self.landmarks
            .get(&id)
            .ok_or(LocalizeError::UnknownLandmark(id))
    }

    /// The intrinsics `view` was taken with.
    pub fn intrinsics_of(&self, view: ViewId) -> Result<&PinholeRadial, LocalizeError> {
        let view = self.view(view)?;
        self.intrinsics
            .get(view.intrinsic as usize)
            .ok_or(LocalizeError::UnknownView(view.id))
    }

    pub fn intrinsics(&self) -> &[PinholeRadial] {
        &self.intrinsics
    }

    /// Views in ascending identifier order.
    pub fn views(&self) -> impl Iterator<Item = &View> + '_ {
        self.views.values()
    }

    /// Landmarks in ascending identifier order.
    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> + '_ {
        self.landmarks.values()
    }

    /// Views that observe at least one landmark.
    pub fn observing_views(&self) -> BTreeSet<ViewId> {
        self.landmarks
            .values()
            .flat_map(|landmark| landmark.observations.iter().map(|o| o.view))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> SceneFile {
        SceneFile {
            intrinsics: vec![PinholeRadial::new(640, 480, 500.0, Point2::new(320.0, 240.0))],
            views: vec![
                View {
                    id: ViewId(3),
                    path: None,
                    intrinsic: 0,
                    pose: Some(WorldToCamera::identity()),
                },
                View {
                    id: ViewId(1),
                    path: Some("a.jpg".into()),
                    intrinsic: 0,
                    pose: None,
                },
            ],
            landmarks: vec![Landmark {
                id: LandmarkId(7),
                position: Point3::new(0.0, 0.0, 4.0),
                observations: vec![LandmarkObservation {
                    view: ViewId(3),
                    feature: 0,
                    pixel: Point2::new(320.0, 240.0),
                }],
            }],
        }
    }

    #[test]
    fn lookups_by_identifier() {
        let scene = Scene::new(file()).unwrap();
        assert_eq!(
            scene.views().map(|v| v.id).collect::<Vec<_>>(),
            vec![ViewId(1), ViewId(3)]
        );
        assert_eq!(scene.intrinsics_of(ViewId(3)).unwrap().focal, 500.0);
        assert!(matches!(
            scene.view(ViewId(2)),
            Err(LocalizeError::UnknownView(ViewId(2)))
        ));
        assert!(matches!(
            scene.landmark(LandmarkId(8)),
            Err(LocalizeError::UnknownLandmark(LandmarkId(8)))
        ));
        assert_eq!(scene.observing_views().into_iter().collect::<Vec<_>>(), vec![ViewId(3)]);
    }

    #[test]
    fn rejects_dangling_references() {
        let mut dangling = file();
        dangling.landmarks[0].observations[0].view = ViewId(9);
        assert!(matches!(
            Scene::new(dangling),
            Err(InitializationError::DanglingObservation { .. })
        ));

        let mut no_intrinsics = file();
        no_intrinsics.views[0].intrinsic = 4;
        assert!(matches!(
            Scene::new(no_intrinsics),
            Err(InitializationError::UnknownIntrinsic { intrinsic: 4, .. })
        ));

        let mut duplicate = file();
        duplicate.views[1].id = ViewId(3);
        assert!(matches!(
            Scene::new(duplicate),
            Err(InitializationError::DuplicateView(ViewId(3)))
        ));
    }

    #[test]
    fn json_round_trip_keeps_the_scene() {
        let scene = Scene::new(file()).unwrap();
        let json = serde_json::to_string(&scene.to_file()).unwrap();
        let back = Scene::new(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(back, scene);
    }
}
