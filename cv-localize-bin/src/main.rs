use cv_localize::{
    refine_sequence, residual_statistics, scene_data_statistics, sequence_scene, Correspondence,
    LevenbergMarquardtAdjuster, LocalizationResult, Localizer, LocalizerPaths, LocalizerSettings,
    PinholeRadial, ViewFeatures, ViewId, WorldToCamera,
};
use log::*;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::{
    error::Error,
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "cv-localize",
    about = "Localizes query images against a structure-from-motion reconstruction"
)]
struct Opt {
    /// The reconstruction, as JSON.
    #[structopt(long)]
    scene: PathBuf,
    /// Directory holding the features of every reconstructed view as `<view id>.desc`.
    #[structopt(long)]
    descriptors: PathBuf,
    /// The vocabulary tree used for image retrieval.
    #[structopt(long)]
    vocabulary: PathBuf,
    /// Per word weights of the vocabulary.
    ///
    /// If omitted, the weights are computed from the reconstruction.
    #[structopt(long)]
    weights: Option<PathBuf>,
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_localize::LocalizerSettings`. Defaults are used if it
    /// doesn't exist.
    #[structopt(short, long, default_value = "localize-settings.json")]
    settings: PathBuf,
    /// Refine the poses of all localized queries together, as frames of one camera.
    #[structopt(long)]
    refine_sequence: bool,
    /// Where the localized poses are written, as JSON.
    #[structopt(short, long, default_value = "localized.json")]
    output: PathBuf,
    /// JSON list of queries, each naming its features file and intrinsics.
    #[structopt(parse(from_os_str))]
    queries: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct Query {
    name: String,
    /// Features in the same format as the reconstructed views.
    features: PathBuf,
    intrinsics: PinholeRadial,
    /// Trust `intrinsics` instead of estimating them.
    #[serde(default = "default_use_input_intrinsics")]
    use_input_intrinsics: bool,
}

fn default_use_input_intrinsics() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
struct QueryOutput {
    name: String,
    localized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    correspondences: usize,
    inliers: usize,
    candidates: Vec<ViewId>,
    pose: Option<WorldToCamera>,
    camera_center: Option<Point3<f64>>,
    intrinsics: Option<PinholeRadial>,
    residual_rmse: Option<f64>,
}

impl QueryOutput {
    fn localized(name: String, result: &LocalizationResult) -> Self {
        Self {
            name,
            localized: true,
            error: None,
            correspondences: result.matches.len(),
            inliers: result.inliers.len(),
            candidates: result.candidates.clone(),
            pose: Some(result.pose),
            camera_center: Some(result.pose.camera_center()),
            intrinsics: Some(result.intrinsics),
            residual_rmse: Some(result.residual_rmse),
        }
    }

    fn failed(name: String, error: &dyn Error) -> Self {
        Self {
            name,
            localized: false,
            error: Some(error.to_string()),
            correspondences: 0,
            inliers: 0,
            candidates: vec![],
            pose: None,
            camera_center: None,
            intrinsics: None,
            residual_rmse: None,
        }
    }
}

fn load_settings(path: &Path) -> Result<LocalizerSettings, Box<dyn Error>> {
    if !path.exists() {
        info!("used default settings");
        return Ok(LocalizerSettings::default());
    }
    let settings = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    info!("loaded settings from {:?}", path);
    Ok(settings)
}

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = load_settings(&opt.settings)?;
    let localizer = Localizer::load(&LocalizerPaths {
        scene: opt.scene.clone(),
        descriptors: opt.descriptors.clone(),
        vocabulary: opt.vocabulary.clone(),
        weights: opt.weights.clone(),
    })?;
    for (view, stats) in residual_statistics(localizer.scene()) {
        debug!(
            "view {} reprojects with median {:.3} px, max {:.3} px",
            view, stats.median, stats.max
        );
    }

    let queries: Vec<Query> = serde_json::from_reader(BufReader::new(File::open(&opt.queries)?))?;
    info!("localizing {} queries", queries.len());

    let mut outputs = Vec::with_capacity(queries.len());
    // Index of the output and inlier correspondences of every localized query.
    let mut localized: Vec<(usize, Vec<Correspondence>)> = vec![];
    for query in queries {
        let result = ViewFeatures::load(&query.features)
            .map_err(cv_localize::LocalizeError::from)
            .and_then(|features| {
                localizer.localize(
                    &features,
                    &query.intrinsics,
                    query.use_input_intrinsics,
                    &settings.parameters,
                )
            });
        match result {
            Ok(result) => {
                println!(
                    "{}: localized with {} inliers of {} correspondences",
                    query.name,
                    result.inliers.len(),
                    result.matches.len()
                );
                localized.push((
                    outputs.len(),
                    result.inlier_correspondences().copied().collect(),
                ));
                outputs.push(QueryOutput::localized(query.name, &result));
            }
            Err(e) => {
                println!("{}: failed: {}", query.name, e);
                outputs.push(QueryOutput::failed(query.name, &e));
            }
        }
    }
    info!("localized {} of {} queries", localized.len(), outputs.len());

    if opt.refine_sequence {
        refine_localized(&mut outputs, &localized, &settings);
    }

    serde_json::to_writer_pretty(BufWriter::new(File::create(&opt.output)?), &outputs)?;
    info!("wrote results to {:?}", opt.output);
    Ok(())
}

/// Refines the localized queries as frames of one camera, the camera of the first of them.
fn refine_localized(
    outputs: &mut [QueryOutput],
    localized: &[(usize, Vec<Correspondence>)],
    settings: &LocalizerSettings,
) {
    if localized.len() < 2 {
        warn!("sequence refinement needs at least two localized queries");
        return;
    }
    let poses: Vec<WorldToCamera> = localized
        .iter()
        .filter_map(|&(ix, _)| outputs[ix].pose)
        .collect();
    let intrinsics = match outputs[localized[0].0].intrinsics {
        Some(intrinsics) => intrinsics,
        None => return,
    };
    let correspondence_sets: Vec<Vec<Correspondence>> =
        localized.iter().map(|(_, set)| set.clone()).collect();
    let adjuster = LevenbergMarquardtAdjuster {
        patience: settings.sequence.patience,
        min_views_for_optical_center: settings.sequence.min_views_for_optical_center,
    };
    match refine_sequence(
        &adjuster,
        &intrinsics,
        &poses,
        &correspondence_sets,
        settings.parameters.refine_intrinsics,
    ) {
        Ok((intrinsics, poses)) => {
            let refined = sequence_scene(&intrinsics, &poses, &correspondence_sets);
            for (frame, stats) in scene_data_statistics(&refined) {
                info!(
                    "{} (frame {}): {} residuals, mean {:.3} px, median {:.3} px, max {:.3} px",
                    outputs[localized[frame].0].name,
                    frame,
                    stats.count,
                    stats.mean,
                    stats.median,
                    stats.max
                );
            }
            for (&(ix, _), pose) in localized.iter().zip(poses) {
                outputs[ix].pose = Some(pose);
                outputs[ix].camera_center = Some(pose.camera_center());
                outputs[ix].intrinsics = Some(intrinsics);
            }
        }
        Err(e) => warn!("sequence refinement failed, keeping the individual poses: {}", e),
    }
}
