use cv_resection::ResectionSettings;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// How the candidate views returned by image retrieval are turned into a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizationAlgorithm {
    /// Resect against the best ranked candidate only.
    FirstBest,
    /// Resect against every candidate separately and keep the pose with the most inliers.
    BestResult,
    /// Resect once against the correspondences of every candidate.
    AllResults,
    /// Resect against groups of candidates that see common landmarks.
    Cluster,
}

impl Default for LocalizationAlgorithm {
    fn default() -> Self {
        Self::FirstBest
    }
}

impl LocalizationAlgorithm {
    pub const ALL: [Self; 4] = [
        Self::FirstBest,
        Self::BestResult,
        Self::AllResults,
        Self::Cluster,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::FirstBest => "first_best",
            Self::BestResult => "best_result",
            Self::AllResults => "all_results",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for LocalizationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown localization algorithm {0:?}")]
pub struct UnknownAlgorithm(pub String);

impl TryFrom<i32> for LocalizationAlgorithm {
    type Error = UnknownAlgorithm;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        usize::try_from(code)
            .ok()
            .and_then(|ix| Self::ALL.get(ix).copied())
            .ok_or_else(|| UnknownAlgorithm(code.to_string()))
    }
}

/// Accepts the names shown by [`Display`](fmt::Display) and the codes `0` to `3`.
impl FromStr for LocalizationAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<i32>() {
            return Self::try_from(code).map_err(|_| UnknownAlgorithm(s.to_owned()));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownAlgorithm(s.to_owned()))
    }
}

/// Density of the features an [`ImageDescriber`](crate::ImageDescriber) extracts from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriberPreset {
    Low,
    Medium,
    Normal,
    High,
    Ultra,
}

impl Default for DescriberPreset {
    fn default() -> Self {
        Self::Ultra
    }
}

/// The per call parameters of [`Localizer::localize`](crate::Localizer::localize).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Refine the intrinsics together with the pose even when they were given.
    #[serde(default = "default_refine_intrinsics")]
    pub refine_intrinsics: bool,
    /// Match a second time constrained by the epipolar geometry of the first matches.
    #[serde(default = "default_use_guided_matching")]
    pub use_guided_matching: bool,
    #[serde(default)]
    pub algorithm: LocalizationAlgorithm,
    /// How many of the retrieved views are used as candidates.
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    /// How many views the database is asked for.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// The fewest views a cluster needs to be resected.
    #[serde(default = "default_num_common_views")]
    pub num_common_views: usize,
    /// Ratio of the nearest to the second nearest descriptor distance a match must stay below.
    #[serde(default = "default_distance_ratio")]
    pub distance_ratio: f32,
    /// Largest reprojection error of an inlier in pixels.
    #[serde(default = "default_error_max")]
    pub error_max: f64,
    #[serde(default)]
    pub describer_preset: DescriberPreset,
    #[serde(default)]
    pub resection: ResectionSettings,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            refine_intrinsics: default_refine_intrinsics(),
            use_guided_matching: default_use_guided_matching(),
            algorithm: LocalizationAlgorithm::default(),
            num_results: default_num_results(),
            max_results: default_max_results(),
            num_common_views: default_num_common_views(),
            distance_ratio: default_distance_ratio(),
            error_max: default_error_max(),
            describer_preset: DescriberPreset::default(),
            resection: ResectionSettings::default(),
        }
    }
}

fn default_refine_intrinsics() -> bool {
    false
}

fn default_use_guided_matching() -> bool {
    false
}

fn default_num_results() -> usize {
    4
}

fn default_max_results() -> usize {
    10
}

fn default_num_common_views() -> usize {
    3
}

fn default_distance_ratio() -> f32 {
    0.6
}

fn default_error_max() -> f64 {
    4.0
}

/// Settings of [`refine_sequence`](crate::refine_sequence) when it uses the
/// [`LevenbergMarquardtAdjuster`](crate::LevenbergMarquardtAdjuster).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceRefinerSettings {
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// The fewest views for which the optical center is refined when it is only refined if
    /// enough data is available.
    #[serde(default = "default_min_views_for_optical_center")]
    pub min_views_for_optical_center: usize,
}

impl Default for SequenceRefinerSettings {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            min_views_for_optical_center: default_min_views_for_optical_center(),
        }
    }
}

fn default_patience() -> usize {
    1000
}

fn default_min_views_for_optical_center() -> usize {
    3
}

/// Everything the command line front end reads from its settings file.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalizerSettings {
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub sequence: SequenceRefinerSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names_and_codes() {
        for (code, algorithm) in LocalizationAlgorithm::ALL.iter().enumerate() {
            assert_eq!(algorithm.to_string().parse(), Ok(*algorithm));
            assert_eq!(code.to_string().parse(), Ok(*algorithm));
            assert_eq!(LocalizationAlgorithm::try_from(code as i32), Ok(*algorithm));
        }
        assert_eq!("Cluster".parse(), Ok(LocalizationAlgorithm::Cluster));
        assert!("4".parse::<LocalizationAlgorithm>().is_err());
        assert!("-1".parse::<LocalizationAlgorithm>().is_err());
        assert!("closest".parse::<LocalizationAlgorithm>().is_err());
    }

    #[test]
    fn partial_settings_take_defaults() {
        let settings: LocalizerSettings = serde_json::from_str(
            r#"{ "parameters": { "algorithm": "cluster", "num_common_views": 2 } }"#,
        )
        .unwrap();
        let expected = Parameters {
            algorithm: LocalizationAlgorithm::Cluster,
            num_common_views: 2,
            ..Parameters::default()
        };
        assert_eq!(settings.parameters, expected);
        assert_eq!(settings.sequence, SequenceRefinerSettings::default());
        assert_eq!(expected.num_results, 4);
        assert_eq!(expected.max_results, 10);
        assert_eq!(expected.distance_ratio, 0.6);
        assert_eq!(expected.describer_preset, DescriberPreset::Ultra);
    }
}
