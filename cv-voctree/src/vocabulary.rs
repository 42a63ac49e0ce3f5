use crate::{Descriptor, VocabularyError, Word};
use log::*;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, io::BufWriter, path::Path};

/// A hierarchical k-means quantizer.
///
/// The tree has `levels` levels below the root and every inner node has `branching` children.
/// The centers are stored level by level, so level `l` (starting at `0`) owns `branching^(l + 1)`
/// consecutive centers and the children of node `n` on level `l` are nodes
/// `n * branching..(n + 1) * branching` on level `l + 1`.
///
/// The leaves are the visual words, numbered `0..branching^levels`.
#[derive(Clone, Debug, Serialize)]
pub struct VocabularyTree {
    branching: usize,
    levels: usize,
    centers: Vec<Descriptor>,
    #[serde(skip)]
    level_offsets: Vec<usize>,
}

#[derive(Deserialize)]
struct VocabularyFile {
    branching: usize,
    levels: usize,
    centers: Vec<Descriptor>,
}

impl VocabularyTree {
    /// Creates a tree from its centers, which must be ordered level by level.
    pub fn new(
        branching: usize,
        levels: usize,
        centers: Vec<Descriptor>,
    ) -> Result<Self, VocabularyError> {
        if branching == 0 || levels == 0 {
            return Err(VocabularyError::InvalidShape { branching, levels });
        }
        let mut level_offsets = Vec::with_capacity(levels);
        let mut offset = 0usize;
        let mut level_size = 1usize;
        for _ in 0..levels {
            level_offsets.push(offset);
            level_size = level_size
                .checked_mul(branching)
                .ok_or(VocabularyError::InvalidShape { branching, levels })?;
            offset = offset
                .checked_add(level_size)
                .ok_or(VocabularyError::InvalidShape { branching, levels })?;
        }
        // Words are addressed with a `u32`.
        if level_size > Word::MAX as usize {
            return Err(VocabularyError::InvalidShape { branching, levels });
        }
        if centers.len() != offset {
            return Err(VocabularyError::CenterCount {
                branching,
                levels,
                expected: offset,
                actual: centers.len(),
            });
        }
        Ok(Self {
            branching,
            levels,
            centers,
            level_offsets,
        })
    }

    /// Loads a tree serialized with [`VocabularyTree::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| VocabularyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let VocabularyFile {
            branching,
            levels,
            centers,
        } = bincode::deserialize_from(BufReader::new(file)).map_err(|source| {
            VocabularyError::Decode {
                path: path.display().to_string(),
                source,
            }
        })?;
        let tree = Self::new(branching, levels, centers)?;
        info!(
            "loaded vocabulary tree with branching {} and {} levels ({} words)",
            tree.branching,
            tree.levels,
            tree.num_words()
        );
        Ok(tree)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VocabularyError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| VocabularyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        bincode::serialize_into(BufWriter::new(file), self).map_err(|source| {
            VocabularyError::Encode {
                path: path.display().to_string(),
                source,
            }
        })
    }

    pub fn branching(&self) -> usize {
        self.branching
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// The number of visual words (leaves).
    pub fn num_words(&self) -> usize {
        self.centers.len() - self.level_offsets[self.levels - 1]
    }

    /// Maps a descriptor to its visual word by descending to the nearest child at every level.
    pub fn quantize(&self, descriptor: &Descriptor) -> Word {
        let mut node = 0;
        for &offset in &self.level_offsets {
            let first = node * self.branching;
            node = (first..first + self.branching)
                .map(|child| {
                    (
                        child,
                        self.centers[offset + child].distance_squared(descriptor),
                    )
                })
                // Ties go to the lowest child.
                .fold((first, f32::INFINITY), |best, candidate| {
                    if candidate.1 < best.1 {
                        candidate
                    } else {
                        best
                    }
                })
                .0;
        }
        node as Word
    }

    /// Quantizes every descriptor, producing a document suitable for the [`crate::Database`].
    pub fn quantize_all(&self, descriptors: &[Descriptor]) -> Vec<Word> {
        descriptors.iter().map(|d| self.quantize(d)).collect()
    }
}
