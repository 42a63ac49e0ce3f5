//! # Vocabulary tree image retrieval
//!
//! This crate maps local image descriptors to discrete visual words with a pretrained
//! hierarchical k-means quantizer (a [`VocabularyTree`]) and indexes images as weighted
//! bags of visual words in a [`Database`] so that the images most similar to a query can
//! be retrieved.
//!
//! Training the vocabulary is not part of this crate. A tree and its per-word weights
//! are loaded from disk (see [`VocabularyTree::load`] and [`load_weights`]) or built
//! directly from their centers.
//!
//! ```
//! use cv_voctree::{Database, Descriptor, VocabularyTree};
//!
//! let mut centers = vec![Descriptor::zeros(); 2];
//! centers[1].0[0] = 1.0;
//! let vocabulary = VocabularyTree::new(2, 1, centers).unwrap();
//!
//! let mut near_one = Descriptor::zeros();
//! near_one.0[0] = 0.9;
//! assert_eq!(vocabulary.quantize(&near_one), 1);
//!
//! let mut database = Database::new(vocabulary.num_words());
//! let a = database.insert(&[0, 0, 1]).unwrap();
//! let b = database.insert(&[1, 1]).unwrap();
//! let matches = database.query(&vocabulary.quantize_all(&[near_one]), 2).unwrap();
//! assert_eq!(matches[0].id, b);
//! assert_eq!(matches[1].id, a);
//! ```

mod database;
mod descriptor;
mod vocabulary;

pub use database::*;
pub use descriptor::*;
pub use vocabulary::*;

use thiserror::Error;

/// Identifier of a visual word (a leaf of the vocabulary tree).
pub type Word = u32;

/// Identifier of a document (an indexed image) in a [`Database`].
pub type DocId = u32;

/// Errors produced while building or loading retrieval structures.
#[derive(Debug, Error)]
pub enum VocabularyError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file contents could not be decoded.
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: bincode::Error,
    },

    /// The value could not be encoded to the file.
    #[error("failed to write {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: bincode::Error,
    },

    /// The tree parameters do not describe a usable tree.
    #[error("vocabulary tree needs a branching factor and depth of at least 1, got {branching} and {levels}")]
    InvalidShape { branching: usize, levels: usize },

    /// The number of centers does not match the branching factor and depth.
    #[error("vocabulary tree with branching {branching} and {levels} levels needs {expected} centers, got {actual}")]
    CenterCount {
        branching: usize,
        levels: usize,
        expected: usize,
        actual: usize,
    },

    /// The weights do not contain one entry per visual word.
    #[error("expected {expected} word weights, got {actual}")]
    WeightCount { expected: usize, actual: usize },

    /// A document refers to a word the database was not sized for.
    #[error("word {word} is out of range for a database of {num_words} words")]
    WordOutOfRange { word: Word, num_words: usize },
}
