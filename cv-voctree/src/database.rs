use crate::{DocId, VocabularyError, Word};
use float_ord::FloatOrd;
use log::*;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// A sparse, L1-normalized, weighted bag of visual words.
pub type Signature = BTreeMap<Word, f32>;

/// A retrieved document and its similarity to the query.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Match {
    pub id: DocId,
    /// `1 - 0.5 * |q - d|_1`, which lies in `[0, 1]` for normalized signatures.
    pub score: f32,
}

/// An inverted index of documents, each of which is a bag of visual words.
///
/// Documents are only ever appended. Their [`DocId`]s are assigned densely in insertion order.
#[derive(Clone, Debug)]
pub struct Database {
    num_words: usize,
    weights: Vec<f32>,
    histograms: Vec<BTreeMap<Word, u32>>,
    signatures: Vec<Signature>,
    inverted: HashMap<Word, Vec<(DocId, f32)>>,
}

impl Database {
    /// Creates an empty database for a vocabulary of `num_words` words, with every word weighted `1.0`.
    pub fn new(num_words: usize) -> Self {
        Self {
            num_words,
            weights: vec![1.0; num_words],
            histograms: vec![],
            signatures: vec![],
            inverted: HashMap::new(),
        }
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn signature(&self, id: DocId) -> Option<&Signature> {
        self.signatures.get(id as usize)
    }

    /// Appends a document and returns its id.
    pub fn insert(&mut self, document: &[Word]) -> Result<DocId, VocabularyError> {
        let histogram = self.histogram(document)?;
        let id = self.histograms.len() as DocId;
        let signature = self.weighted(&histogram);
        for (&word, &value) in &signature {
            self.inverted.entry(word).or_default().push((id, value));
        }
        self.histograms.push(histogram);
        self.signatures.push(signature);
        Ok(id)
    }

    /// Replaces the per-word weights and reweights every document already inserted.
    pub fn set_weights(&mut self, weights: Vec<f32>) -> Result<(), VocabularyError> {
        if weights.len() != self.num_words {
            return Err(VocabularyError::WeightCount {
                expected: self.num_words,
                actual: weights.len(),
            });
        }
        self.weights = weights;
        self.reindex();
        Ok(())
    }

    /// Sets every word weight to its inverse document frequency `ln(N / n_w)` over the inserted documents.
    ///
    /// Words that occur in no document get a weight of `0`.
    pub fn compute_tfidf_weights(&mut self) {
        let mut occurrences = vec![0u32; self.num_words];
        for histogram in &self.histograms {
            for &word in histogram.keys() {
                occurrences[word as usize] += 1;
            }
        }
        let total = self.histograms.len() as f32;
        self.weights = occurrences
            .into_iter()
            .map(|n| if n == 0 { 0.0 } else { (total / n as f32).ln() })
            .collect();
        debug!(
            "computed tf-idf weights over {} documents",
            self.histograms.len()
        );
        self.reindex();
    }

    /// Builds the weighted signature of a document without inserting it.
    pub fn signature_of(&self, document: &[Word]) -> Result<Signature, VocabularyError> {
        Ok(self.weighted(&self.histogram(document)?))
    }

    /// Returns up to `max_results` documents sharing at least one word with `document`.
    ///
    /// Results are ordered by descending score. Equal scores are ordered by ascending [`DocId`].
    pub fn query(
        &self,
        document: &[Word],
        max_results: usize,
    ) -> Result<Vec<Match>, VocabularyError> {
        let query = self.signature_of(document)?;
        let mut scores: BTreeMap<DocId, f32> = BTreeMap::new();
        // For L1-normalized non-negative vectors, `1 - 0.5 * |q - d|_1 = sum(min(q_w, d_w))`.
        for (word, &q) in &query {
            if let Some(postings) = self.inverted.get(word) {
                for &(id, d) in postings {
                    *scores.entry(id).or_insert(0.0) += q.min(d);
                }
            }
        }
        let mut matches: Vec<Match> = scores
            .into_iter()
            .map(|(id, score)| Match { id, score })
            .collect();
        matches.sort_by_key(|m| (Reverse(FloatOrd(m.score)), m.id));
        matches.truncate(max_results);
        Ok(matches)
    }

    fn histogram(&self, document: &[Word]) -> Result<BTreeMap<Word, u32>, VocabularyError> {
        let mut histogram = BTreeMap::new();
        for &word in document {
            if word as usize >= self.num_words {
                return Err(VocabularyError::WordOutOfRange {
                    word,
                    num_words: self.num_words,
                });
            }
            *histogram.entry(word).or_insert(0) += 1;
        }
        Ok(histogram)
    }

    fn weighted(&self, histogram: &BTreeMap<Word, u32>) -> Signature {
        let mut signature: Signature = histogram
            .iter()
            .map(|(&word, &count)| (word, count as f32 * self.weights[word as usize]))
            .filter(|&(_, value)| value > 0.0)
            .collect();
        let norm: f32 = signature.values().sum();
        if norm > 0.0 {
            for value in signature.values_mut() {
                *value /= norm;
            }
        }
        signature
    }

    fn reindex(&mut self) {
        self.signatures = self
            .histograms
            .iter()
            .map(|histogram| self.weighted(histogram))
            .collect();
        self.inverted.clear();
        for (id, signature) in self.signatures.iter().enumerate() {
            for (&word, &value) in signature {
                self.inverted
                    .entry(word)
                    .or_default()
                    .push((id as DocId, value));
            }
        }
    }
}

/// Loads per-word weights (a bincode `Vec<f32>`).
pub fn load_weights(path: impl AsRef<Path>) -> Result<Vec<f32>, VocabularyError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| VocabularyError::Io {
        path: path.display().to_string(),
        source,
    })?;
    bincode::deserialize_from(BufReader::new(file)).map_err(|source| VocabularyError::Decode {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_weights(path: impl AsRef<Path>, weights: &[f32]) -> Result<(), VocabularyError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| VocabularyError::Io {
        path: path.display().to_string(),
        source,
    })?;
    bincode::serialize_into(BufWriter::new(file), weights).map_err(|source| {
        VocabularyError::Encode {
            path: path.display().to_string(),
            source,
        }
    })
}
