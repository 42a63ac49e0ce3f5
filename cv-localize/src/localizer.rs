use crate::{
    load_scene_features, match_regions, run_strategy, Candidate, CandidatePipeline,
    Correspondence, DescriberPreset, InitializationError, LandmarkId, LocalizeError, Parameters,
    RegionStore, Scene, ViewFeatures, ViewId,
};
use cv_resection::{resect, FeatureWorldMatch, PinholeRadial, Resection, WorldToCamera};
use cv_voctree::{load_weights, Database, VocabularyTree, Word};
use image::GrayImage;
use log::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
};

/// Extracts the features of a query image. Extraction itself lives outside this crate.
pub trait ImageDescriber {
    type Error: std::error::Error + Send + Sync + 'static;

    fn describe(
        &self,
        image: &GrayImage,
        preset: DescriberPreset,
    ) -> Result<ViewFeatures, Self::Error>;
}

/// Files a [`Localizer`] is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizerPaths {
    /// JSON reconstruction.
    pub scene: PathBuf,
    /// Directory holding one `<view id>.desc` features file per view.
    pub descriptors: PathBuf,
    pub vocabulary: PathBuf,
    /// Per word weights. Without them the weights are computed from the reconstruction.
    pub weights: Option<PathBuf>,
}

/// The camera of a localized query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationResult {
    pub pose: WorldToCamera,
    pub intrinsics: PinholeRadial,
    /// Every correspondence the pose was resected from.
    pub matches: Vec<Correspondence>,
    /// Indices into `matches` of the correspondences consistent with the pose.
    pub inliers: Vec<usize>,
    /// Query feature and landmark of every inlier.
    pub associations: Vec<(usize, LandmarkId)>,
    /// The views the matches were found in.
    pub candidates: Vec<ViewId>,
    /// Root mean square reprojection error of the inliers in pixels.
    pub residual_rmse: f64,
}

impl LocalizationResult {
    /// The inlier correspondences, in the order of `inliers`.
    pub fn inlier_correspondences(&self) -> impl Iterator<Item = &Correspondence> + '_ {
        self.inliers.iter().filter_map(move |&ix| self.matches.get(ix))
    }
}

/// A reconstruction prepared for localization: its region store and retrieval database.
///
/// It is never modified after construction, so any number of queries may be localized
/// against it concurrently.
#[derive(Debug)]
pub struct Localizer {
    scene: Scene,
    regions: RegionStore,
    vocabulary: VocabularyTree,
    database: Database,
    /// The view of every database document, indexed by document id.
    documents: Vec<ViewId>,
}

impl Localizer {
    /// Indexes the reconstructed regions of every view of `scene`.
    ///
    /// Without `weights`, every word is weighted by its inverse document frequency over the
    /// views of the scene.
    pub fn new(
        scene: Scene,
        features: &HashMap<ViewId, ViewFeatures>,
        vocabulary: VocabularyTree,
        weights: Option<Vec<f32>>,
    ) -> Result<Self, InitializationError> {
        let regions = RegionStore::build(&scene, features)?;
        let mut database = Database::new(vocabulary.num_words());
        let mut documents = Vec::with_capacity(regions.len());
        for view in regions.views() {
            let descriptors: Vec<_> = view.descriptors().copied().collect();
            database.insert(&vocabulary.quantize_all(&descriptors))?;
            documents.push(view.view());
        }
        match weights {
            Some(weights) => database.set_weights(weights)?,
            None => {
                info!("no vocabulary weights given, computing them from the reconstruction");
                database.compute_tfidf_weights();
            }
        }
        info!("indexed {} views for retrieval", documents.len());
        Ok(Self {
            scene,
            regions,
            vocabulary,
            database,
            documents,
        })
    }

    pub fn load(paths: &LocalizerPaths) -> Result<Self, InitializationError> {
        let scene = Scene::load(&paths.scene)?;
        let features = load_scene_features(&paths.descriptors, &scene)?;
        let vocabulary = VocabularyTree::load(&paths.vocabulary)?;
        let weights = paths.weights.as_ref().map(load_weights).transpose()?;
        Self::new(scene, &features, vocabulary, weights)
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn regions(&self) -> &RegionStore {
        &self.regions
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn vocabulary(&self) -> &VocabularyTree {
        &self.vocabulary
    }

    /// Localizes the camera that observed the `query` features.
    ///
    /// With `use_input_intrinsics`, `intrinsics` describe the query camera and stay fixed unless
    /// [`Parameters::refine_intrinsics`] is set. Otherwise only its image size is used and the
    /// intrinsics are estimated.
    pub fn localize(
        &self,
        query: &ViewFeatures,
        intrinsics: &PinholeRadial,
        use_input_intrinsics: bool,
        params: &Parameters,
    ) -> Result<LocalizationResult, LocalizeError> {
        if query.keypoints.len() != query.descriptors.len() {
            return Err(LocalizeError::MalformedQuery {
                keypoints: query.keypoints.len(),
                descriptors: query.descriptors.len(),
            });
        }
        let pipeline = QueryPipeline {
            localizer: self,
            query,
            words: self.vocabulary.quantize_all(&query.descriptors),
            query_intrinsics: Some(intrinsics).filter(|_| use_input_intrinsics),
            intrinsics_hint: if use_input_intrinsics {
                *intrinsics
            } else {
                PinholeRadial::unknown_focal(intrinsics.width, intrinsics.height)
            },
            estimate_intrinsics: !use_input_intrinsics || params.refine_intrinsics,
            query_size: (intrinsics.width, intrinsics.height),
            params,
        };
        let outcome = run_strategy(&pipeline, params)?;
        let Resection {
            pose,
            intrinsics,
            inliers,
            residual_rmse,
        } = outcome.resection;
        let associations = inliers
            .iter()
            .map(|&ix| {
                let correspondence = &outcome.pool[ix];
                (correspondence.feature, correspondence.landmark)
            })
            .collect();
        info!(
            "localized with {} inliers of {} correspondences, residual {:.3} px",
            inliers.len(),
            outcome.pool.len(),
            residual_rmse
        );
        Ok(LocalizationResult {
            pose,
            intrinsics,
            matches: outcome.pool,
            inliers,
            associations,
            candidates: outcome.candidates,
            residual_rmse,
        })
    }

    /// Describes `image` with `describer` and localizes the result.
    pub fn localize_image<D>(
        &self,
        describer: &D,
        image: &GrayImage,
        intrinsics: &PinholeRadial,
        use_input_intrinsics: bool,
        params: &Parameters,
    ) -> Result<LocalizationResult, LocalizeError>
    where
        D: ImageDescriber + ?Sized,
    {
        if image.dimensions() != (intrinsics.width, intrinsics.height) {
            warn!(
                "image is {:?} but the intrinsics are for {}x{}",
                image.dimensions(),
                intrinsics.width,
                intrinsics.height
            );
        }
        let query = describer
            .describe(image, params.describer_preset)
            .map_err(|e| LocalizeError::Describe(Box::new(e)))?;
        info!("described the query with {} features", query.len());
        self.localize(&query, intrinsics, use_input_intrinsics, params)
    }
}

/// The state of one [`Localizer::localize`] call.
struct QueryPipeline<'a> {
    localizer: &'a Localizer,
    query: &'a ViewFeatures,
    words: Vec<Word>,
    query_intrinsics: Option<&'a PinholeRadial>,
    intrinsics_hint: PinholeRadial,
    estimate_intrinsics: bool,
    query_size: (u32, u32),
    params: &'a Parameters,
}

impl CandidatePipeline for QueryPipeline<'_> {
    fn retrieve(&self, max_results: usize) -> Result<Vec<Candidate>, LocalizeError> {
        let matches = self.localizer.database.query(&self.words, max_results)?;
        matches
            .into_iter()
            .map(|m| {
                let view = self
                    .localizer
                    .documents
                    .get(m.id as usize)
                    .copied()
                    .ok_or(LocalizeError::NoCandidates)?;
                debug!("retrieved view {} with score {:.4}", view, m.score);
                Ok(Candidate {
                    view,
                    score: m.score,
                })
            })
            .collect()
    }

    fn correspondences(&self, view: ViewId) -> Result<Vec<Correspondence>, LocalizeError> {
        let regions = self.localizer.regions.regions_of(view)?;
        let candidate_intrinsics = self.localizer.scene.intrinsics_of(view)?;
        let matches = match_regions(
            self.query,
            self.query_intrinsics,
            regions,
            Some(candidate_intrinsics),
            self.params.distance_ratio,
            self.params.use_guided_matching,
            self.query_size,
            (candidate_intrinsics.width, candidate_intrinsics.height),
        );
        let mut correspondences = Vec::with_capacity(matches.len());
        for m in matches {
            let region = regions
                .get(m.region)
                .ok_or(LocalizeError::UnknownView(view))?;
            let landmark = self.localizer.scene.landmark(region.landmark)?;
            if let Some(pixel) = self.query.keypoint(m.query) {
                correspondences.push(Correspondence {
                    feature: m.query,
                    landmark: landmark.id,
                    pixel,
                    point: landmark.position,
                });
            }
        }
        Ok(correspondences)
    }

    fn landmarks_of(&self, view: ViewId) -> Result<BTreeSet<LandmarkId>, LocalizeError> {
        Ok(self.localizer.regions.regions_of(view)?.landmarks())
    }

    fn resect(&self, pool: &[Correspondence]) -> Result<Resection, LocalizeError> {
        let matches: Vec<FeatureWorldMatch> = pool
            .iter()
            .map(|c| FeatureWorldMatch(c.pixel, c.point))
            .collect();
        Ok(resect(
            &matches,
            &self.intrinsics_hint,
            self.estimate_intrinsics,
            self.params.error_max,
            &self.params.resection,
        )?)
    }
}
