//! # Localization against a structure-from-motion reconstruction
//!
//! A [`Localizer`] is built once from a reconstruction (a [`Scene`] of posed views and
//! landmarks), the features of its views and a vocabulary tree. It finds the pose of a query
//! image from its features in four steps:
//!
//! 1. image retrieval proposes the reconstructed views most similar to the query,
//! 2. query features are matched against the features of those views that observe a landmark
//!    (their reconstructed regions), giving pixel to landmark correspondences,
//! 3. the camera is resected from those correspondences inside a consensus loop,
//! 4. a [`LocalizationAlgorithm`] decides which candidate views contribute and which resection
//!    wins.
//!
//! Poses of a sequence of localized frames can afterwards be refined together with
//! [`refine_sequence`] over any [`BundleAdjuster`].

mod adjust;
mod error;
mod features;
mod localizer;
mod matcher;
mod regions;
mod residuals;
mod scene;
mod sequence;
mod settings;
mod strategy;

pub use adjust::*;
pub use error::*;
pub use features::*;
pub use localizer::*;
pub use matcher::*;
pub use regions::*;
pub use residuals::*;
pub use scene::*;
pub use sequence::*;
pub use settings::*;
pub use strategy::*;

pub use cv_resection::{PinholeRadial, WorldToCamera};
pub use cv_voctree::{Descriptor, VocabularyTree};
