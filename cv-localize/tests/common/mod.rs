//! A synthetic reconstruction: four views of one landmark cloud, each landmark with its own
//! random descriptor, and a query taken from a fifth pose.

#![allow(dead_code)]

use cv_localize::{
    Landmark, LandmarkId, LandmarkObservation, Localizer, PinholeRadial, Scene, SceneFile, View,
    ViewFeatures, ViewId, WorldToCamera,
};
use cv_voctree::{Descriptor, VocabularyTree};
use nalgebra::{Point3, Rotation3, Vector3};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::HashMap;

pub const LANDMARKS: usize = 150;
pub const DISTRACTORS: usize = 5;

pub struct Fixture {
    pub camera: PinholeRadial,
    pub scene: Scene,
    pub features: HashMap<ViewId, ViewFeatures>,
    pub vocabulary: VocabularyTree,
    pub weights: Vec<f32>,
    pub query: ViewFeatures,
    pub query_pose: WorldToCamera,
    /// Landmark of every query feature, `None` for distractors.
    pub query_landmarks: Vec<Option<LandmarkId>>,
}

impl Fixture {
    pub fn localizer(&self) -> Localizer {
        Localizer::new(
            self.scene.clone(),
            &self.features,
            self.vocabulary.clone(),
            Some(self.weights.clone()),
        )
        .unwrap()
    }
}

pub fn random_descriptor(rng: &mut impl Rng) -> Descriptor {
    let mut d = Descriptor::zeros();
    for v in d.0.iter_mut() {
        *v = rng.gen_range(0.0..1.0);
    }
    d
}

fn noisy(rng: &mut impl Rng, descriptor: &Descriptor) -> Descriptor {
    let mut d = *descriptor;
    for v in d.0.iter_mut() {
        *v += rng.gen_range(-0.02..0.02);
    }
    d
}

pub fn camera() -> PinholeRadial {
    PinholeRadial::new(640, 480, 500.0, nalgebra::Point2::new(322.0, 238.0))
}

pub fn fixture(seed: u64) -> Fixture {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let camera = camera();

    let positions: Vec<Point3<f64>> = (0..LANDMARKS)
        .map(|_| {
            Point3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            )
        })
        .collect();
    let descriptors: Vec<Descriptor> = (0..LANDMARKS)
        .map(|_| random_descriptor(&mut rng))
        .collect();

    let poses = [
        (10, Vector3::new(-0.4, 0.0, 6.0), (0.0, 0.05, 0.0)),
        (11, Vector3::new(0.4, 0.0, 6.0), (0.0, -0.05, 0.0)),
        (12, Vector3::new(0.0, 0.3, 6.2), (0.04, 0.0, 0.02)),
        (13, Vector3::new(0.0, -0.3, 5.8), (-0.04, 0.0, -0.02)),
    ];
    let mut views = vec![];
    let mut features = HashMap::new();
    let mut observations: Vec<Vec<LandmarkObservation>> = vec![vec![]; LANDMARKS];
    for &(id, translation, (roll, pitch, yaw)) in &poses {
        let pose =
            WorldToCamera::from_parts(translation, Rotation3::from_euler_angles(roll, pitch, yaw));
        let mut keypoints = vec![];
        let mut view_descriptors = vec![];
        for _ in 0..DISTRACTORS {
            keypoints.push([rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)]);
            view_descriptors.push(random_descriptor(&mut rng));
        }
        for (landmark, position) in positions.iter().enumerate() {
            let pixel = camera.project(&pose, position).unwrap();
            observations[landmark].push(LandmarkObservation {
                view: ViewId(id),
                feature: keypoints.len(),
                pixel,
            });
            keypoints.push([pixel.x, pixel.y]);
            view_descriptors.push(noisy(&mut rng, &descriptors[landmark]));
        }
        views.push(View {
            id: ViewId(id),
            path: Some(format!("view_{}.png", id)),
            intrinsic: 0,
            pose: Some(pose),
        });
        features.insert(ViewId(id), ViewFeatures::new(keypoints, view_descriptors));
    }
    let landmarks = observations
        .into_iter()
        .zip(&positions)
        .enumerate()
        .map(|(id, (observations, &position))| Landmark {
            id: LandmarkId(id as u32),
            position,
            observations,
        })
        .collect();
    let scene = Scene::new(SceneFile {
        intrinsics: vec![camera],
        views,
        landmarks,
    })
    .unwrap();

    let centers = (0..4 + 16).map(|_| random_descriptor(&mut rng)).collect();
    let vocabulary = VocabularyTree::new(4, 2, centers).unwrap();
    let weights = vec![1.0; vocabulary.num_words()];

    let query_pose = WorldToCamera::from_parts(
        Vector3::new(0.1, -0.05, 5.5),
        Rotation3::from_euler_angles(0.03, -0.02, 0.01),
    );
    let mut keypoints = vec![];
    let mut query_descriptors = vec![];
    let mut query_landmarks = vec![];
    for (landmark, position) in positions.iter().enumerate().rev() {
        let pixel = camera.project(&query_pose, position).unwrap();
        keypoints.push([pixel.x, pixel.y]);
        query_descriptors.push(noisy(&mut rng, &descriptors[landmark]));
        query_landmarks.push(Some(LandmarkId(landmark as u32)));
    }
    for _ in 0..20 {
        keypoints.push([rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)]);
        query_descriptors.push(random_descriptor(&mut rng));
        query_landmarks.push(None);
    }

    Fixture {
        camera,
        scene,
        features,
        vocabulary,
        weights,
        query: ViewFeatures::new(keypoints, query_descriptors),
        query_pose,
        query_landmarks,
    }
}
