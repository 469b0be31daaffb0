//! Training orchestration: the session state machine, progress events and the
//! embed-and-store loop.
//!
//! ```text
//! Idle -> Loading -> PerClassIterating(class, image) -> Ready -> Predicting -> Ready
//!   ^        |               |
//!   +--------+---------------+  (failure or cancellation)
//! ```
//!
//! A run is not transactional: if it fails or is cancelled part-way, the
//! exemplars added so far stay in the store and the session goes back to
//! `Idle`. Stopping before the store is cleared (for instance when the extractor
//! fails to load) leaves the old exemplars and restores the previous state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::classifier::{ClassLabel, ClassifierError, ExemplarStore, SharedExtractor};
use crate::config::ClassifierConfig;
use crate::session::ClassRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Loading,
    PerClassIterating { class_index: usize, image_index: usize },
    Ready,
    Predicting,
}

impl SessionState {
    pub fn is_training(&self) -> bool {
        matches!(self, Self::Loading | Self::PerClassIterating { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Loading,
    Embedding,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Where and why a training run stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingFailure {
    /// Error kind, e.g. `"InvalidImageError"`
    pub kind: String,
    pub message: String,
    pub label: Option<ClassLabel>,
    pub class_index: Option<usize>,
    pub image_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// 0 to 100
    pub percent: f64,
    pub message: String,
    pub failure: Option<TrainingFailure>,
}

impl ProgressEvent {
    fn new(phase: Phase, percent: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            percent,
            message: message.into(),
            failure: None,
        }
    }
}

/// Requests that a training run stop before its next (class, image) step.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrainingSummary {
    pub classes: usize,
    pub examples: usize,
}

/// A running training task.
#[derive(Debug)]
pub struct TrainingHandle {
    cancel: CancellationFlag,
    task: JoinHandle<Result<TrainingSummary, ClassifierError>>,
}

impl TrainingHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the run to finish.
    pub async fn wait(self) -> Result<TrainingSummary, ClassifierError> {
        self.task
            .await
            .map_err(|e| ClassifierError::Inference(format!("Training task failed: {}", e)))?
    }
}

/// The images of one class, captured when training starts.
#[derive(Debug, Clone)]
pub(crate) struct TrainingClass {
    pub label: ClassLabel,
    pub name: String,
    pub images: Vec<Arc<[u8]>>,
}

#[derive(Debug, Clone)]
pub(crate) struct TrainingPlan {
    pub classes: Vec<TrainingClass>,
}

impl TrainingPlan {
    pub fn labels(&self) -> impl Iterator<Item = ClassLabel> + '_ {
        self.classes.iter().map(|c| c.label)
    }

    pub fn total_images(&self) -> usize {
        self.classes.iter().map(|c| c.images.len()).sum()
    }

    /// Rejects plans that cannot produce a usable classifier.
    pub fn validate(&self, config: &ClassifierConfig) -> Result<(), ClassifierError> {
        if self.classes.len() < config.min_classes {
            return Err(ClassifierError::InsufficientData(format!(
                "At least {} classes are required, found {}",
                config.min_classes,
                self.classes.len()
            )));
        }
        if self.total_images() == 0 {
            return Err(ClassifierError::InsufficientData("No images found in classes".into()));
        }
        for class in &self.classes {
            let count = class.images.len();
            if count < config.min_examples_per_class {
                return Err(ClassifierError::InsufficientData(format!(
                    "Class \"{}\" requires at least {} images, found {}",
                    class.name, config.min_examples_per_class, count
                )));
            }
            if count > config.max_examples_per_class {
                return Err(ClassifierError::InsufficientData(format!(
                    "Class \"{}\" exceeds maximum {} images ({})",
                    class.name, config.max_examples_per_class, count
                )));
            }
        }
        Ok(())
    }
}

/// Progress in percent after `processed` of `total` images.
pub fn progress_percent(processed: usize, total: usize, warmup_fraction: f64) -> f64 {
    if total == 0 {
        return 100.0 * warmup_fraction;
    }
    let done = processed.min(total) as f64 / total as f64;
    100.0 * (warmup_fraction + done * (1.0 - warmup_fraction))
}

/// Shared pieces of a session a training run operates on.
pub(crate) struct TrainingContext {
    pub extractor: Arc<SharedExtractor>,
    pub store: Arc<RwLock<ExemplarStore>>,
    pub registry: Arc<Mutex<ClassRegistry>>,
    pub state: Arc<watch::Sender<SessionState>>,
    /// State to return to when the run stops before touching the store
    pub resume_state: SessionState,
    pub warmup_fraction: f64,
    pub cancel: CancellationFlag,
}

/// Spawns the run. The caller must already have moved the state to `Loading`.
pub(crate) fn spawn_training(
    plan: TrainingPlan,
    ctx: TrainingContext,
) -> (TrainingHandle, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (events, receiver) = mpsc::unbounded_channel();
    let cancel = ctx.cancel.clone();
    let task = tokio::spawn(run_training(plan, ctx, events));
    (TrainingHandle { cancel, task }, receiver)
}

async fn run_training(
    plan: TrainingPlan,
    ctx: TrainingContext,
    events: mpsc::UnboundedSender<ProgressEvent>,
) -> Result<TrainingSummary, ClassifierError> {
    // A dropped receiver only means nobody is watching
    let emit = |event: ProgressEvent| {
        let _ = events.send(event);
    };
    let total = plan.total_images();

    emit(ProgressEvent::new(
        Phase::Loading,
        0.0,
        "Initializing feature extractor (this may take a moment on first run)...",
    ));
    let extractor = match ctx.extractor.load().await {
        Ok(extractor) => extractor,
        Err(e) => return Err(fail(&ctx, &emit, e, None, ctx.resume_state)),
    };
    if ctx.cancel.is_cancelled() {
        return Err(cancelled(&ctx, &emit, 0, total, ctx.resume_state));
    }

    ctx.registry.lock().await.set_mirrored(plan.labels(), false);
    ctx.store.write().await.clear_all();
    ctx.state.send_replace(SessionState::PerClassIterating {
        class_index: 0,
        image_index: 0,
    });
    emit(ProgressEvent::new(
        Phase::Embedding,
        progress_percent(0, total, ctx.warmup_fraction),
        format!("Feature extractor ready, embedding {} images...", total),
    ));

    let mut processed = 0usize;
    for (class_index, class) in plan.classes.iter().enumerate() {
        info!("Processing class '{}' ({} images)", class.name, class.images.len());
        for (image_index, bytes) in class.images.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled(&ctx, &emit, processed, total, SessionState::Idle));
            }
            ctx.state.send_replace(SessionState::PerClassIterating {
                class_index,
                image_index,
            });

            let worker = Arc::clone(&extractor);
            let image = Arc::clone(bytes);
            let embedded = tokio::task::spawn_blocking(move || worker.embed_bytes(&image))
                .await
                .unwrap_or_else(|e| Err(ClassifierError::Inference(format!("Embedding task failed: {}", e))));
            let stored = match embedded {
                Ok(embedding) => ctx.store.write().await.add_example(class.label, embedding),
                Err(e) => Err(e),
            };
            if let Err(e) = stored {
                let location = (class.label, class_index, image_index);
                return Err(fail(&ctx, &emit, e, Some(location), SessionState::Idle));
            }

            processed += 1;
            debug!("Embedded image {} of class '{}' ({}/{})", image_index, class.name, processed, total);
            emit(ProgressEvent::new(
                Phase::Embedding,
                progress_percent(processed, total, ctx.warmup_fraction),
                format!(
                    "Class '{}': image {}/{}",
                    class.name,
                    image_index + 1,
                    class.images.len()
                ),
            ));
        }
    }

    ctx.registry.lock().await.set_mirrored(plan.labels(), true);
    ctx.state.send_replace(SessionState::Ready);
    info!("Training complete: {} examples across {} classes", processed, plan.classes.len());
    emit(ProgressEvent::new(
        Phase::Done,
        100.0,
        "Training complete! Model is now ready for inference.",
    ));
    Ok(TrainingSummary {
        classes: plan.classes.len(),
        examples: processed,
    })
}

fn fail(
    ctx: &TrainingContext,
    emit: &impl Fn(ProgressEvent),
    err: ClassifierError,
    location: Option<(ClassLabel, usize, usize)>,
    next_state: SessionState,
) -> ClassifierError {
    match location {
        Some((label, class_index, image_index)) => error!(
            "Training failed at class {} image {}: {}",
            label, image_index, err
        ),
        None => error!("Training failed: {}", err),
    }
    ctx.state.send_replace(next_state);
    emit(ProgressEvent {
        phase: Phase::Failed,
        percent: 0.0,
        message: format!("Training failed: {}", err),
        failure: Some(TrainingFailure {
            kind: err.kind().to_string(),
            message: err.to_string(),
            label: location.map(|(label, _, _)| label),
            class_index: location.map(|(_, class_index, _)| class_index),
            image_index: location.map(|(_, _, image_index)| image_index),
        }),
    });
    err
}

fn cancelled(
    ctx: &TrainingContext,
    emit: &impl Fn(ProgressEvent),
    processed: usize,
    total: usize,
    next_state: SessionState,
) -> ClassifierError {
    warn!("Training cancelled after {}/{} images", processed, total);
    ctx.state.send_replace(next_state);
    emit(ProgressEvent::new(
        Phase::Cancelled,
        progress_percent(processed, total, ctx.warmup_fraction),
        format!("Training cancelled after {} of {} images", processed, total),
    ));
    ClassifierError::Cancelled
}
