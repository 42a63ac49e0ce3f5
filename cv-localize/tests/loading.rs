mod common;

use approx::assert_relative_eq;
use common::fixture;
use cv_localize::{
    features_path, residual_statistics, InitializationError, Localizer, LocalizerPaths,
    Parameters, ViewId,
};
use cv_voctree::{save_weights, VocabularyError};
use std::{fs, path::Path};
use tempfile::TempDir;

/// Writes the fixture the way the command line front end expects to find it.
fn write(dir: &Path, fixture: &common::Fixture) -> LocalizerPaths {
    let descriptors = dir.join("descriptors");
    fs::create_dir(&descriptors).unwrap();
    for (&view, features) in &fixture.features {
        features.save(features_path(&descriptors, view)).unwrap();
    }
    let paths = LocalizerPaths {
        scene: dir.join("scene.json"),
        descriptors,
        vocabulary: dir.join("vocabulary.bin"),
        weights: Some(dir.join("weights.bin")),
    };
    fixture.scene.save(&paths.scene).unwrap();
    fixture.vocabulary.save(&paths.vocabulary).unwrap();
    save_weights(paths.weights.as_ref().unwrap(), &fixture.weights).unwrap();
    paths
}

#[test]
fn a_saved_reconstruction_localizes() {
    let fixture = fixture(20);
    let dir = TempDir::new().unwrap();
    let paths = write(dir.path(), &fixture);
    let localizer = Localizer::load(&paths).unwrap();
    assert_eq!(localizer.regions().len(), 4);
    assert_eq!(localizer.database().len(), 4);
    let result = localizer
        .localize(&fixture.query, &fixture.camera, true, &Parameters::default())
        .unwrap();
    assert_relative_eq!(result.pose.0, fixture.query_pose.0, epsilon = 1e-6);

    // The scene is noise free, so every view reprojects exactly.
    let stats = residual_statistics(localizer.scene());
    assert_eq!(stats.len(), 4);
    for stats in stats.values() {
        assert_eq!(stats.count, 2 * common::LANDMARKS);
        assert!(stats.max < 1e-6);
    }
}

#[test]
fn missing_features_fail_initialization() {
    let fixture = fixture(21);
    let dir = TempDir::new().unwrap();
    let paths = write(dir.path(), &fixture);
    fs::remove_file(features_path(&paths.descriptors, ViewId(11))).unwrap();
    assert!(matches!(
        Localizer::load(&paths),
        Err(InitializationError::MissingFeatures(ViewId(11)))
    ));
}

#[test]
fn corrupt_files_fail_initialization() {
    let fixture = fixture(22);
    let dir = TempDir::new().unwrap();
    let paths = write(dir.path(), &fixture);

    fs::write(&paths.scene, "{ \"views\": [").unwrap();
    assert!(matches!(
        Localizer::load(&paths),
        Err(InitializationError::Json { .. })
    ));
    fixture.scene.save(&paths.scene).unwrap();

    fs::write(features_path(&paths.descriptors, ViewId(10)), [1u8, 2, 3]).unwrap();
    assert!(matches!(
        Localizer::load(&paths),
        Err(InitializationError::Bincode { .. })
    ));
    fixture.features[&ViewId(10)]
        .save(features_path(&paths.descriptors, ViewId(10)))
        .unwrap();

    fs::write(&paths.vocabulary, [0u8; 4]).unwrap();
    assert!(matches!(
        Localizer::load(&paths),
        Err(InitializationError::Vocabulary(VocabularyError::Decode { .. }))
    ));
}

#[test]
fn weights_must_fit_the_vocabulary() {
    let fixture = fixture(23);
    let dir = TempDir::new().unwrap();
    let paths = write(dir.path(), &fixture);
    save_weights(paths.weights.as_ref().unwrap(), &[1.0; 3]).unwrap();
    assert!(matches!(
        Localizer::load(&paths),
        Err(InitializationError::Vocabulary(VocabularyError::WeightCount {
            expected: 16,
            actual: 3
        }))
    ));
}

#[test]
fn missing_scene_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let paths = LocalizerPaths {
        scene: dir.path().join("nowhere.json"),
        descriptors: dir.path().to_owned(),
        vocabulary: dir.path().join("vocabulary.bin"),
        weights: None,
    };
    assert!(matches!(
        Localizer::load(&paths),
        Err(InitializationError::Io { .. })
    ));
}
