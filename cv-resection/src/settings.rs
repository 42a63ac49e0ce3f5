use serde::{Deserialize, Serialize};

/// The settings for robust resection.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResectionSettings {
    /// The most minimal samples the consensus loop may draw.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// The probability of having drawn at least one all-inlier sample at which sampling stops early.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Seed of the sampler, so that resection is reproducible.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Patience of the Levenberg-Marquardt refinement that follows the consensus search.
    #[serde(default = "default_refine_patience")]
    pub refine_patience: usize,
}

impl Default for ResectionSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            confidence: default_confidence(),
            seed: default_seed(),
            refine_patience: default_refine_patience(),
        }
    }
}

fn default_max_iterations() -> usize {
    4096
}

fn default_confidence() -> f64 {
    0.999
}

fn default_seed() -> u64 {
    0
}

fn default_refine_patience() -> usize {
    100
}
