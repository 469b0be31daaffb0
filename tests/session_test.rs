use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array1;
use tokio_test::{assert_err, assert_ok};
use teachable::{
    ClassLabel, ClassifierConfig, ClassifierError, ClassifierSession, Embedding, ExemplarStore, ExtractorBuilder,
    FeatureExtractor, ModelSnapshot, Phase, ProgressEvent, SessionState, SharedExtractor,
};

const RED: [u8; 3] = [230, 20, 20];
const BLUE: [u8; 3] = [20, 20, 230];

fn png(color: [u8; 3], variant: u32) -> Vec<u8> {
    // One off-colour pixel keeps the images distinct
    let image = RgbImage::from_fn(48, 48, |x, y| {
        if x == variant && y == 0 {
            Rgb([color[0] / 2 + 10, color[1], color[2] / 2 + 10])
        } else {
            Rgb(color)
        }
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Embeds every image as `[1, n]` for the n-th call and fails once on call `fail_on`.
#[derive(Debug)]
struct FlakyExtractor {
    calls: AtomicUsize,
    fail_on: AtomicUsize,
}

impl FlakyExtractor {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(usize::MAX),
        }
    }

    /// Makes the `n`-th embedding from now on fail.
    fn fail_after(&self, n: usize) {
        self.fail_on.store(self.calls.load(Ordering::SeqCst) + n, Ordering::SeqCst);
    }
}

impl FeatureExtractor for FlakyExtractor {
    fn model_version(&self) -> &str {
        "flaky-v1"
    }

    fn embedding_dim(&self) -> usize {
        2
    }

    fn embed(&self, _image: &DynamicImage) -> Result<Embedding, ClassifierError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_on.load(Ordering::SeqCst) {
            return Err(ClassifierError::Inference("device lost".into()));
        }
        Ok(Array1::from(vec![1.0, call as f32 + 1.0]))
    }
}

fn snapshot_with(version: &str, classes: &[(u32, &str, Vec<f32>)]) -> Vec<u8> {
    let mut store = ExemplarStore::new();
    for (label, _, embedding) in classes {
        store
            .add_example(ClassLabel(*label), Array1::from(embedding.clone()))
            .unwrap();
    }
    ModelSnapshot::from_store(&store, version, |label| {
        classes
            .iter()
            .find(|(l, _, _)| ClassLabel(*l) == label)
            .map(|(_, name, _)| name.to_string())
    })
    .to_json()
    .unwrap()
}

fn shared_histogram(bins: u32) -> Arc<SharedExtractor> {
    let builder = ExtractorBuilder::new().with_histogram(bins).unwrap();
    Arc::new(SharedExtractor::new(builder, Duration::from_secs(30)))
}

fn new_session() -> ClassifierSession {
    ClassifierSession::new(shared_histogram(4), ClassifierConfig::default()).unwrap()
}

async fn collect_images(session: &ClassifierSession) -> (ClassLabel, ClassLabel) {
    let red = session.create_class("red").await;
    let blue = session.create_class("blue").await;
    for i in 0..3 {
        session.add_image(red, png(RED, i)).await.unwrap();
        session.add_image(blue, png(BLUE, i)).await.unwrap();
    }
    (red, blue)
}

async fn train(session: &ClassifierSession) -> Vec<ProgressEvent> {
    let (handle, mut receiver) = assert_ok!(session.start_training().await);
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    assert_ok!(handle.wait().await);
    events
}

#[tokio::test]
async fn test_training_reports_monotonic_progress() {
    let session = new_session();
    collect_images(&session).await;

    let events = train(&session).await;
    assert_eq!(events.first().map(|e| e.phase), Some(Phase::Loading));
    for pair in events.windows(2) {
        assert!(pair[1].percent >= pair[0].percent, "{:?}", pair);
    }
    let terminal: Vec<_> = events.iter().filter(|e| e.phase.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Done);
    assert_eq!(last.percent, 100.0);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.total_examples().await, 6);
}

#[tokio::test]
async fn test_trained_session_predicts_colours() {
    let session = new_session();
    let (red, blue) = collect_images(&session).await;
    train(&session).await;

    let prediction = session.predict_live(&png(RED, 40)).await.unwrap().unwrap();
    assert_eq!(prediction.label, red);
    assert_eq!(prediction.name.as_deref(), Some("red"));
    assert!(prediction.confidence > 0.9);

    let prediction = session.predict_live(&png(BLUE, 40)).await.unwrap().unwrap();
    assert_eq!(prediction.label, blue);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_untrained_prediction_does_not_load_extractor() {
    let extractor = shared_histogram(4);
    let session = ClassifierSession::new(Arc::clone(&extractor), ClassifierConfig::default()).unwrap();
    session.create_class("anything").await;

    assert!(session.predict_live(&png(RED, 0)).await.unwrap().is_none());
    assert!(!extractor.is_loaded());
}

#[tokio::test]
async fn test_insufficient_data_leaves_state_untouched() {
    let session = new_session();
    let red = session.create_class("red").await;
    let blue = session.create_class("blue").await;
    for i in 0..3 {
        session.add_image(red, png(RED, i)).await.unwrap();
    }
    session.add_image(blue, png(BLUE, 0)).await.unwrap();

    let err = assert_err!(session.start_training().await);
    assert!(matches!(err, ClassifierError::InsufficientData(_)));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.total_examples().await, 0);
}

#[tokio::test]
async fn test_invalid_upload_is_not_recorded() {
    let session = new_session();
    let red = session.create_class("red").await;

    let tiny = {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    };
    assert!(matches!(
        session.add_image(red, tiny).await,
        Err(ClassifierError::InvalidImage(_))
    ));
    assert!(matches!(
        session.add_image(red, b"not an image".to_vec()).await,
        Err(ClassifierError::InvalidImage(_))
    ));
    assert!(matches!(
        session.add_image(ClassLabel(99), png(RED, 0)).await,
        Err(ClassifierError::UnknownClass(ClassLabel(99)))
    ));
    assert_eq!(session.classes().await[0].image_count, 0);
}

#[tokio::test]
async fn test_mutations_are_busy_during_training() {
    let session = new_session();
    let (red, _) = collect_images(&session).await;

    let (handle, mut receiver) = session.start_training().await.unwrap();
    assert!(session.state().is_training());
    assert!(matches!(session.delete_class(red).await, Err(ClassifierError::Busy(_))));
    assert!(matches!(session.remove_image(red, 0).await, Err(ClassifierError::Busy(_))));
    assert!(matches!(session.start_training().await, Err(ClassifierError::Busy(_))));

    while receiver.recv().await.is_some() {}
    assert_ok!(handle.wait().await);
    assert_ok!(session.delete_class(red).await);
}

#[tokio::test]
async fn test_cancel_returns_to_idle() {
    let session = new_session();
    collect_images(&session).await;

    let (handle, mut receiver) = session.start_training().await.unwrap();
    handle.cancel();
    let mut last = None;
    while let Some(event) = receiver.recv().await {
        last = Some(event.phase);
    }
    assert!(matches!(handle.wait().await, Err(ClassifierError::Cancelled)));
    assert_eq!(last, Some(Phase::Cancelled));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_labels_are_never_reused() {
    let session = new_session();
    let first = session.create_class("a").await;
    assert_ok!(session.delete_class(first).await);
    let second = session.create_class("a").await;
    assert_ne!(first, second);
    assert!(matches!(
        session.rename_class(first, "b").await,
        Err(ClassifierError::UnknownClass(_))
    ));
}

#[tokio::test]
async fn test_images_added_after_training_are_learned_incrementally() {
    let session = new_session();
    let (red, _) = collect_images(&session).await;
    train(&session).await;

    session.add_image(red, png(RED, 10)).await.unwrap();
    assert_eq!(session.example_count(red).await, 4);

    session.remove_image(red, 0).await.unwrap();
    assert_eq!(session.example_count(red).await, 3);
    assert_eq!(session.classes().await[0].image_count, 3);
}

#[tokio::test]
async fn test_snapshot_moves_between_sessions() {
    let extractor = shared_histogram(4);
    let source = ClassifierSession::new(Arc::clone(&extractor), ClassifierConfig::default()).unwrap();
    let (red, _) = collect_images(&source).await;
    train(&source).await;
    let snapshot = source.export_snapshot().await.unwrap();

    let target = ClassifierSession::new(extractor, ClassifierConfig::default()).unwrap();
    target.import_snapshot(&snapshot).await.unwrap();
    assert_eq!(target.state(), SessionState::Ready);
    assert_eq!(target.total_examples().await, 6);
    assert_eq!(target.class_name(red).await.as_deref(), Some("red"));

    let prediction = target.predict_live(&png(RED, 20)).await.unwrap().unwrap();
    assert_eq!(prediction.label, red);

    // Fresh classes must not collide with imported labels
    let new_label = target.create_class("green").await;
    assert!(new_label > red);
}

#[tokio::test]
async fn test_failed_import_leaves_session_intact() {
    let session = new_session();
    collect_images(&session).await;
    train(&session).await;
    let classes_before = session.classes().await;

    let ragged = br#"{"modelVersion":"rgb-histogram-4","embeddingDim":64,
        "classes":[{"label":0,"embeddings":[[1.0,2.0]]}]}"#;
    assert!(matches!(session.import_snapshot(ragged).await, Err(ClassifierError::Schema(_))));

    let other_model = ClassifierSession::new(shared_histogram(8), ClassifierConfig::default()).unwrap();
    let foreign = other_model.export_snapshot().await.unwrap();
    assert!(matches!(
        session.import_snapshot(&foreign).await,
        Err(ClassifierError::Schema(_)) | Err(ClassifierError::VersionMismatch { .. })
    ));

    assert_eq!(session.classes().await, classes_before);
    assert_eq!(session.total_examples().await, 6);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_version_mismatch_between_extractors() {
    let source = ClassifierSession::new(shared_histogram(4), ClassifierConfig::default()).unwrap();
    collect_images(&source).await;
    train(&source).await;
    let snapshot = source.export_snapshot().await.unwrap();

    let target = ClassifierSession::new(shared_histogram(8), ClassifierConfig::default()).unwrap();
    match target.import_snapshot(&snapshot).await {
        Err(ClassifierError::VersionMismatch { expected, found }) => {
            assert_eq!(expected, "rgb-histogram-8");
            assert_eq!(found, "rgb-histogram-4");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(target.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_evaluation_on_separable_colours() {
    let session = new_session();
    collect_images(&session).await;
    train(&session).await;

    let evaluation = session.evaluate().await.unwrap().unwrap();
    assert_eq!(evaluation.evaluated, 6);
    assert_eq!(evaluation.accuracy, 1.0);
}

#[tokio::test]
async fn test_failure_mid_run_reports_location_and_keeps_partial_exemplars() {
    let flaky = Arc::new(FlakyExtractor::new());
    let extractor = Arc::new(SharedExtractor::preloaded(flaky.clone()));
    let session = ClassifierSession::new(extractor, ClassifierConfig::default()).unwrap();
    let (red, blue) = collect_images(&session).await;

    // Red embeds fully, then the second blue image fails
    flaky.fail_after(4);
    let (handle, mut receiver) = session.start_training().await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    assert!(matches!(handle.wait().await, Err(ClassifierError::Inference(_))));

    assert_eq!(events.iter().filter(|e| e.phase.is_terminal()).count(), 1);
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Failed);
    let failure = last.failure.as_ref().unwrap();
    assert_eq!(failure.kind, "InferenceError");
    assert_eq!(failure.label, Some(blue));
    assert_eq!(failure.class_index, Some(1));
    assert_eq!(failure.image_index, Some(1));

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.example_count(red).await, 3);
    assert_eq!(session.example_count(blue).await, 1);

    // A partial run leaves the classes unmirrored, so uploads wait for the next run
    session.add_image(red, png(RED, 20)).await.unwrap();
    assert_eq!(session.example_count(red).await, 3);
    assert_eq!(session.classes().await[0].image_count, 4);
}

#[tokio::test]
async fn test_uploads_after_import_never_remove_imported_exemplars() {
    let extractor = shared_histogram(4);
    assert_ok!(extractor.load().await);
    let session = ClassifierSession::new(extractor, ClassifierConfig::default()).unwrap();

    let imported = vec![0.25; 64];
    let snapshot = snapshot_with("rgb-histogram-4", &[(0, "cat", imported.clone())]);
    session.import_snapshot(&snapshot).await.unwrap();
    let cat = ClassLabel(0);

    // Image and exemplar counts line up after the first upload, yet the
    // upload must not be mistaken for the imported exemplar
    session.add_image(cat, png(RED, 0)).await.unwrap();
    session.add_image(cat, png(RED, 1)).await.unwrap();
    assert_eq!(session.example_count(cat).await, 1);

    session.remove_image(cat, 0).await.unwrap();
    assert_eq!(session.example_count(cat).await, 1);
    assert_eq!(session.classes().await[0].image_count, 1);

    let exported: serde_json::Value = serde_json::from_slice(&session.export_snapshot().await.unwrap()).unwrap();
    let kept: Vec<f64> = exported["classes"][0]["embeddings"][0]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    assert_eq!(kept, vec![0.25; 64]);
}

#[tokio::test]
async fn test_failed_extractor_load_keeps_trained_state() {
    let builder = ExtractorBuilder::new().with_loader("offline-v1", || {
        Err(ClassifierError::ModelLoad("weights unavailable".into()))
    });
    let extractor = Arc::new(SharedExtractor::new(builder, Duration::from_secs(5)));
    let session = ClassifierSession::new(extractor, ClassifierConfig::default()).unwrap();

    let snapshot = snapshot_with("offline-v1", &[(0, "red", vec![1.0, 0.0]), (1, "blue", vec![0.0, 1.0])]);
    session.import_snapshot(&snapshot).await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    for i in 0..3 {
        session.add_image(ClassLabel(0), png(RED, i)).await.unwrap();
        session.add_image(ClassLabel(1), png(BLUE, i)).await.unwrap();
    }

    let (handle, mut receiver) = session.start_training().await.unwrap();
    let mut last = None;
    while let Some(event) = receiver.recv().await {
        last = Some(event);
    }
    assert!(matches!(handle.wait().await, Err(ClassifierError::ModelLoad(_))));
    let last = last.unwrap();
    assert_eq!(last.phase, Phase::Failed);
    let failure = last.failure.unwrap();
    assert_eq!(failure.kind, "ModelLoadError");
    assert_eq!(failure.label, None);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.total_examples().await, 2);
    let distribution = session
        .predict_embedding(&Array1::from(vec![0.9, 0.1]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(distribution.top().map(|(label, _)| label), Some(ClassLabel(0)));
}
