use crate::{AdjustError, LandmarkId, ViewId};
use cv_resection::ResectionError;
use cv_voctree::VocabularyError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading and validating a reconstruction before any query is answered.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {path:?}")]
    Bincode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
    #[error("view {0} is declared twice")]
    DuplicateView(ViewId),
    #[error("landmark {0} is declared twice")]
    DuplicateLandmark(LandmarkId),
    #[error("view {view} references intrinsic {intrinsic} which does not exist")]
    UnknownIntrinsic { view: ViewId, intrinsic: u32 },
    #[error("landmark {landmark} is observed by view {view} which does not exist")]
    DanglingObservation { landmark: LandmarkId, view: ViewId },
    #[error("no features were provided for view {0}")]
    MissingFeatures(ViewId),
    #[error("features of view {view} have {keypoints} keypoints but {descriptors} descriptors")]
    MalformedFeatures {
        view: ViewId,
        keypoints: usize,
        descriptors: usize,
    },
    #[error("landmark {landmark} refers to feature {feature} of view {view}, which only has {available}")]
    FeatureOutOfRange {
        landmark: LandmarkId,
        view: ViewId,
        feature: usize,
        available: usize,
    },
}

/// Everything that can go wrong while localizing a query or refining a sequence.
#[derive(Debug, Error)]
pub enum LocalizeError {
    #[error("initialization failed")]
    Initialization(#[from] InitializationError),
    #[error("the query has {keypoints} keypoints but {descriptors} descriptors")]
    MalformedQuery { keypoints: usize, descriptors: usize },
    #[error("image retrieval produced no candidate views")]
    NoCandidates,
    #[error("resection needs at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences { required: usize, actual: usize },
    #[error("no camera could be resected from {correspondences} correspondences")]
    ResectionFailed { correspondences: usize },
    #[error("the focal length {focal} is unusable and intrinsics are not estimated")]
    InvalidIntrinsics { focal: f64 },
    #[error("bundle adjustment did not converge")]
    RefinementDidNotConverge,
    #[error("no cluster of candidate views reached {required} members")]
    NoQualifyingCluster { required: usize },
    #[error("view {0} is not part of the reconstruction")]
    UnknownView(ViewId),
    #[error("landmark {0} is not part of the reconstruction")]
    UnknownLandmark(LandmarkId),
    #[error("{poses} poses were given with {correspondence_sets} correspondence sets")]
    SequenceLengthMismatch {
        poses: usize,
        correspondence_sets: usize,
    },
    #[error("bundle adjustment rejected the problem")]
    Adjust(#[source] AdjustError),
    #[error("feature extraction failed")]
    Describe(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<ResectionError> for LocalizeError {
    fn from(e: ResectionError) -> Self {
        match e {
            ResectionError::InsufficientCorrespondences { required, actual } => {
                Self::InsufficientCorrespondences { required, actual }
            }
            ResectionError::ResectionFailed { correspondences } => {
                Self::ResectionFailed { correspondences }
            }
            ResectionError::InvalidIntrinsics { focal } => Self::InvalidIntrinsics { focal },
        }
    }
}

impl From<AdjustError> for LocalizeError {
    fn from(e: AdjustError) -> Self {
        match e {
            AdjustError::DidNotConverge { .. } => Self::RefinementDidNotConverge,
            other => Self::Adjust(other),
        }
    }
}

impl From<VocabularyError> for LocalizeError {
    fn from(e: VocabularyError) -> Self {
        Self::Initialization(InitializationError::Vocabulary(e))
    }
}
