use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::classifier::{
    evaluate, validate_image, ClassLabel, ClassifierError, ConfidenceDistribution, DatasetStats, Embedding,
    Evaluation, ExemplarStore, ModelSnapshot, NearestNeighbor, SharedExtractor,
};
use crate::config::ClassifierConfig;
use crate::training::{
    spawn_training, CancellationFlag, ProgressEvent, SessionState, TrainingClass, TrainingContext, TrainingHandle,
    TrainingPlan,
};

/// Snapshot of one class as seen by a presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassInfo {
    pub label: ClassLabel,
    pub name: String,
    /// Images collected for the next training run
    pub image_count: usize,
    /// Embeddings currently in the exemplar store
    pub example_count: usize,
}

/// Outcome of a live prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: ClassLabel,
    pub name: Option<String>,
    pub confidence: f64,
    pub distribution: ConfidenceDistribution,
}

#[derive(Debug)]
struct ClassEntry {
    name: String,
    images: Vec<Arc<[u8]>>,
    /// Exemplar `i` in the store is the embedding of `images[i]`
    mirrored: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ClassRegistry {
    classes: BTreeMap<ClassLabel, ClassEntry>,
    next_label: u32,
}

impl ClassRegistry {
    fn entry_mut(&mut self, label: ClassLabel) -> Result<&mut ClassEntry, ClassifierError> {
        self.classes.get_mut(&label).ok_or(ClassifierError::UnknownClass(label))
    }

    /// Records whether the listed classes' exemplars correspond one to one with
    /// their collected images. Unknown labels are skipped.
    pub(crate) fn set_mirrored(&mut self, labels: impl IntoIterator<Item = ClassLabel>, mirrored: bool) {
        for label in labels {
            if let Some(entry) = self.classes.get_mut(&label) {
                entry.mirrored = mirrored;
            }
        }
    }
}

/// One user's classifier: named classes, their collected images, the exemplar
/// store and the training state machine.
///
/// Sessions are isolated from one another; only the [`SharedExtractor`] is
/// shared. Mutations of the store go through one lock, so predictions never see
/// a half-applied change. While a training run is active the run is the store's
/// only writer and other mutations fail with `Busy`.
///
/// ```no_run
/// # async fn demo() -> Result<(), teachable::ClassifierError> {
/// use std::sync::Arc;
/// use teachable::{ClassifierConfig, ClassifierSession, ExtractorBuilder, SharedExtractor};
///
/// let config = ClassifierConfig::default();
/// let extractor = Arc::new(SharedExtractor::new(ExtractorBuilder::new(), config.load_timeout()));
/// let session = ClassifierSession::new(extractor, config)?;
///
/// let cats = session.create_class("cat").await;
/// session.add_image(cats, std::fs::read("cat.png").unwrap()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ClassifierSession {
    config: ClassifierConfig,
    knn: NearestNeighbor,
    extractor: Arc<SharedExtractor>,
    registry: Arc<Mutex<ClassRegistry>>,
    store: Arc<RwLock<ExemplarStore>>,
    state: Arc<watch::Sender<SessionState>>,
}

impl ClassifierSession {
    pub fn new(extractor: Arc<SharedExtractor>, config: ClassifierConfig) -> Result<Self, ClassifierError> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            knn: NearestNeighbor::new(config.k),
            config,
            extractor,
            registry: Arc::new(Mutex::new(ClassRegistry::default())),
            store: Arc::new(RwLock::new(ExemplarStore::new())),
            state: Arc::new(state),
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receives every state transition, for presentation layers that render it.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn ensure_not_training(&self) -> Result<(), ClassifierError> {
        if self.state.borrow().is_training() {
            return Err(ClassifierError::Busy("a training run is in progress".into()));
        }
        Ok(())
    }

    /// Registers a class. Labels are never reused within a session, and names
    /// need not be unique.
    pub async fn create_class(&self, name: impl Into<String>) -> ClassLabel {
        let mut registry = self.registry.lock().await;
        let label = ClassLabel(registry.next_label);
        registry.next_label += 1;
        registry.classes.insert(
            label,
            ClassEntry {
                name: name.into(),
                images: Vec::new(),
                mirrored: true,
            },
        );
        label
    }

    pub async fn rename_class(&self, label: ClassLabel, name: impl Into<String>) -> Result<(), ClassifierError> {
        let mut registry = self.registry.lock().await;
        registry.entry_mut(label)?.name = name.into();
        Ok(())
    }

    /// Removes the class, its collected images and its exemplars.
    pub async fn delete_class(&self, label: ClassLabel) -> Result<(), ClassifierError> {
        let mut registry = self.registry.lock().await;
        self.ensure_not_training()?;
        if registry.classes.remove(&label).is_none() {
            return Err(ClassifierError::UnknownClass(label));
        }
        self.store.write().await.remove_class(label);
        info!("Deleted class {}", label);
        Ok(())
    }

    /// Classes in creation order.
    pub async fn classes(&self) -> Vec<ClassInfo> {
        let registry = self.registry.lock().await;
        let store = self.store.read().await;
        registry
            .classes
            .iter()
            .map(|(label, entry)| ClassInfo {
                label: *label,
                name: entry.name.clone(),
                image_count: entry.images.len(),
                example_count: store.example_count(*label),
            })
            .collect()
    }

    pub async fn class_name(&self, label: ClassLabel) -> Option<String> {
        let registry = self.registry.lock().await;
        registry.classes.get(&label).map(|entry| entry.name.clone())
    }

    /// Validates and records an image for the class, returning its index.
    ///
    /// When an extractor is already loaded and the class's exemplars mirror its
    /// images (after a completed training run, or for a class that has neither),
    /// the image is embedded and added to the store right away, so the classifier
    /// learns incrementally without a new training run. Otherwise it is picked up
    /// by the next run and the class stops mirroring until then.
    ///
    /// # Errors
    /// - `UnknownClass`, `Busy`
    /// - `InvalidImage` if the bytes fail validation; nothing is recorded
    /// - extractor or store errors from the incremental path; nothing is recorded
    pub async fn add_image(&self, label: ClassLabel, bytes: impl Into<Vec<u8>>) -> Result<usize, ClassifierError> {
        let bytes: Arc<[u8]> = Arc::from(bytes.into());
        let mut registry = self.registry.lock().await;
        self.ensure_not_training()?;
        let entry = registry.entry_mut(label)?;
        let image = validate_image(&bytes, &self.config.image_limits())?;

        if entry.mirrored {
            match self.extractor.get() {
                Some(extractor) => {
                    let embedding = tokio::task::spawn_blocking(move || extractor.embed(&image))
                        .await
                        .map_err(|e| ClassifierError::Inference(format!("Embedding task failed: {}", e)))??;
                    self.store.write().await.add_example(label, embedding)?;
                }
                None => entry.mirrored = false,
            }
        }

        entry.images.push(bytes);
        Ok(entry.images.len() - 1)
    }

    /// Removes a collected image; when the class's exemplars mirror its images
    /// the exemplar at the same index goes too. Later indices shift down by one.
    pub async fn remove_image(&self, label: ClassLabel, index: usize) -> Result<(), ClassifierError> {
        let mut registry = self.registry.lock().await;
        self.ensure_not_training()?;
        let entry = registry.entry_mut(label)?;
        let len = entry.images.len();
        if index >= len {
            return Err(ClassifierError::IndexOutOfRange { label, index, len });
        }

        if entry.mirrored {
            self.store.write().await.remove_example(label, index)?;
        }
        entry.images.remove(index);
        Ok(())
    }

    /// Removes one exemplar from the store without touching collected images,
    /// e.g. for classes that came from an imported snapshot.
    pub async fn remove_example(&self, label: ClassLabel, index: usize) -> Result<(), ClassifierError> {
        let mut registry = self.registry.lock().await;
        self.ensure_not_training()?;
        self.store.write().await.remove_example(label, index)?;
        registry.set_mirrored([label], false);
        Ok(())
    }

    /// Adds a precomputed embedding to a registered class.
    pub async fn add_embedding(&self, label: ClassLabel, embedding: Embedding) -> Result<(), ClassifierError> {
        let mut registry = self.registry.lock().await;
        self.ensure_not_training()?;
        let entry = registry.entry_mut(label)?;
        self.store.write().await.add_example(label, embedding)?;
        entry.mirrored = false;
        Ok(())
    }

    /// Starts a training run over every collected image.
    ///
    /// Once the extractor is loaded the store is cleared and rebuilt class by
    /// class. Progress arrives on the returned receiver, which ends after one
    /// terminal `Done`, `Failed` or `Cancelled` event. A run that stops before the
    /// store is cleared returns the session to the state it started from.
    ///
    /// # Errors
    /// - `InsufficientData` before any work starts, leaving all state untouched
    /// - `Busy` if a run is already active
    pub async fn start_training(
        &self,
    ) -> Result<(TrainingHandle, mpsc::UnboundedReceiver<ProgressEvent>), ClassifierError> {
        let registry = self.registry.lock().await;
        let plan = TrainingPlan {
            classes: registry
                .classes
                .iter()
                .map(|(label, entry)| TrainingClass {
                    label: *label,
                    name: entry.name.clone(),
                    images: entry.images.clone(),
                })
                .collect(),
        };
        if let Err(e) = plan.validate(&self.config) {
            warn!("Training rejected: {}", e);
            return Err(e);
        }

        let mut resume_state = SessionState::Idle;
        let started = self.state.send_if_modified(|state| {
            if state.is_training() {
                false
            } else {
                resume_state = match *state {
                    SessionState::Predicting => SessionState::Ready,
                    other => other,
                };
                *state = SessionState::Loading;
                true
            }
        });
        if !started {
            return Err(ClassifierError::Busy("a training run is already in progress".into()));
        }
        info!(
            "Starting training: {} classes, {} images",
            plan.classes.len(),
            plan.total_images()
        );

        let ctx = TrainingContext {
            extractor: Arc::clone(&self.extractor),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            state: Arc::clone(&self.state),
            resume_state,
            warmup_fraction: self.config.warmup_fraction,
            cancel: CancellationFlag::new(),
        };
        Ok(spawn_training(plan, ctx))
    }

    /// Classifies raw image bytes.
    ///
    /// Returns `Ok(None)` while the store holds no exemplars; the extractor is not
    /// loaded in that case.
    pub async fn predict_live(&self, bytes: &[u8]) -> Result<Option<Prediction>, ClassifierError> {
        if self.store.read().await.is_empty() {
            return Ok(None);
        }
        let image = validate_image(bytes, &self.config.image_limits())?;
        let extractor = self.extractor.load().await?;
        let query = tokio::task::spawn_blocking(move || extractor.embed(&image))
            .await
            .map_err(|e| ClassifierError::Inference(format!("Embedding task failed: {}", e)))??;

        let distribution = self.predict_embedding(&query).await?;
        let Some(distribution) = distribution else {
            return Ok(None);
        };
        let Some((label, confidence)) = distribution.top() else {
            return Ok(None);
        };
        Ok(Some(Prediction {
            label,
            name: self.class_name(label).await,
            confidence,
            distribution,
        }))
    }

    /// Classifies an embedding directly. Does not mutate the store.
    pub async fn predict_embedding(&self, query: &Embedding) -> Result<Option<ConfidenceDistribution>, ClassifierError> {
        let entered = self.state.send_if_modified(|state| {
            if *state == SessionState::Ready {
                *state = SessionState::Predicting;
                true
            } else {
                false
            }
        });
        let result = {
            let store = self.store.read().await;
            self.knn.predict(&store, query)
        };
        if entered {
            self.state.send_if_modified(|state| {
                if *state == SessionState::Predicting {
                    *state = SessionState::Ready;
                    true
                } else {
                    false
                }
            });
        }
        result
    }

    /// Serialises the store as snapshot JSON, tagged with the extractor's version.
    pub async fn export_snapshot(&self) -> Result<Vec<u8>, ClassifierError> {
        let registry = self.registry.lock().await;
        let store = self.store.read().await;
        let snapshot = ModelSnapshot::from_store(&store, self.extractor.model_version(), |label| {
            registry.classes.get(&label).map(|entry| entry.name.clone())
        });
        snapshot.to_json()
    }

    /// Replaces the store and the class registry with a snapshot's content.
    ///
    /// On any error the session is left exactly as it was. Collected images are
    /// discarded on success, since they no longer correspond to the exemplars.
    pub async fn import_snapshot(&self, bytes: &[u8]) -> Result<(), ClassifierError> {
        let mut registry = self.registry.lock().await;
        self.ensure_not_training()?;
        let imported = ModelSnapshot::from_json(bytes)?.into_store(&self.extractor.model_version())?;

        let mut classes = BTreeMap::new();
        for (label, name) in imported.names {
            let name = name.unwrap_or_else(|| format!("Class {}", label.0 + 1));
            classes.insert(
                label,
                ClassEntry {
                    name,
                    images: Vec::new(),
                    mirrored: imported.store.example_count(label) == 0,
                },
            );
        }
        let next_label = classes
            .keys()
            .next_back()
            .map_or(0, |label| label.0.saturating_add(1))
            .max(registry.next_label);

        let trained = !imported.store.is_empty();
        *self.store.write().await = imported.store;
        registry.classes = classes;
        registry.next_label = next_label;
        self.state.send_replace(if trained {
            SessionState::Ready
        } else {
            SessionState::Idle
        });
        info!("Imported snapshot with {} classes", registry.classes.len());
        Ok(())
    }

    /// Leave-one-out accuracy and confusion matrix of the current store.
    pub async fn evaluate(&self) -> Result<Option<Evaluation>, ClassifierError> {
        let store = self.store.read().await;
        evaluate(&store, &self.knn)
    }

    /// Counts of collected images per class.
    pub async fn stats(&self) -> DatasetStats {
        let registry = self.registry.lock().await;
        DatasetStats::from_counts(
            registry
                .classes
                .iter()
                .map(|(label, entry)| (*label, entry.images.len())),
        )
    }

    pub async fn example_count(&self, label: ClassLabel) -> usize {
        self.store.read().await.example_count(label)
    }

    pub async fn total_examples(&self) -> usize {
        self.store.read().await.total_examples()
    }
}
