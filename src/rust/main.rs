use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use teachable::{
    BuiltinModel, ClassifierConfig, ClassifierSession, ExtractorBuilder, ModelManager, Phase, RuntimeConfig,
    SharedExtractor,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with classifier settings (defaults plus TEACHABLE_* env vars otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the builtin feature extractor
    Download {
        /// Force a fresh download of the model file
        #[arg(short, long)]
        fresh: bool,
    },
    /// Train on a directory holding one sub-directory of images per class
    Train {
        data_dir: PathBuf,
        /// Where to write the snapshot
        #[arg(short, long)]
        out: PathBuf,
        #[command(flatten)]
        extractor: ExtractorArgs,
    },
    /// Classify images against a snapshot
    Predict {
        #[arg(short, long)]
        snapshot: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[command(flatten)]
        extractor: ExtractorArgs,
    },
    /// Leave-one-out evaluation of a snapshot
    Evaluate {
        #[arg(short, long)]
        snapshot: PathBuf,
        #[command(flatten)]
        extractor: ExtractorArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExtractorKind {
    Onnx,
    Histogram,
}

#[derive(Args)]
struct ExtractorArgs {
    #[arg(long, value_enum, default_value = "onnx")]
    extractor: ExtractorKind,
    /// Buckets per channel for the histogram extractor
    #[arg(long, default_value_t = 8)]
    bins: u32,
    /// Custom ONNX model instead of the builtin one
    #[arg(long, requires = "model_version")]
    model: Option<PathBuf>,
    /// Version tag recorded in snapshots for a custom model
    #[arg(long)]
    model_version: Option<String>,
    #[arg(long, default_value_t = 224)]
    input_size: u32,
}

impl ExtractorArgs {
    fn builder(&self) -> Result<ExtractorBuilder> {
        let builder = ExtractorBuilder::new().with_runtime_config(RuntimeConfig::from_env());
        Ok(match (self.extractor, &self.model, &self.model_version) {
            (ExtractorKind::Histogram, _, _) => builder.with_histogram(self.bins)?,
            (ExtractorKind::Onnx, Some(path), Some(version)) => {
                builder.with_custom_model(path, version.clone(), self.input_size)?
            }
            (ExtractorKind::Onnx, _, _) => builder.with_model(BuiltinModel::MobileNetV2),
        })
    }
}

fn load_config(path: Option<&Path>) -> Result<ClassifierConfig> {
    Ok(match path {
        Some(path) => ClassifierConfig::from_json_file(path)?,
        None => ClassifierConfig::from_env()?,
    })
}

fn new_session(config: ClassifierConfig, args: &ExtractorArgs) -> Result<ClassifierSession> {
    let extractor = Arc::new(SharedExtractor::new(args.builder()?, config.load_timeout()));
    Ok(ClassifierSession::new(extractor, config)?)
}

async fn download(fresh: bool) -> Result<()> {
    let manager = ModelManager::new_default()?;
    let model = BuiltinModel::MobileNetV2;
    if fresh {
        info!("Fresh download requested - removing any existing model file...");
        manager.remove_download(model)?;
    }
    let path = manager.ensure_model_downloaded(model).await?;
    println!("Model ready at {}", path.display());
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

async fn train(config: ClassifierConfig, data_dir: &Path, out: &Path, args: &ExtractorArgs) -> Result<()> {
    let session = new_session(config, args)?;
    let start_time = Instant::now();

    for class_dir in sorted_entries(data_dir)?.into_iter().filter(|p| p.is_dir()) {
        let name = class_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let label = session.create_class(name.clone()).await;
        for path in sorted_entries(&class_dir)?.into_iter().filter(|p| p.is_file()) {
            let bytes = fs::read(&path)?;
            // Bad uploads are skipped and reported, not fatal
            if let Err(e) = session.add_image(label, bytes).await {
                warn!("Skipping {}: {}", path.display(), e);
            }
        }
        let stats = session.stats().await;
        info!(
            "Class '{}': {} images",
            name,
            stats.images_per_class.get(&label).copied().unwrap_or(0)
        );
    }

    let (handle, mut events) = session.start_training().await?;
    while let Some(event) = events.recv().await {
        println!("[{:>5.1}%] {}", event.percent, event.message);
        if event.phase == Phase::Failed {
            if let Some(failure) = &event.failure {
                eprintln!(
                    "  {} at class {:?} image {:?}",
                    failure.kind, failure.label, failure.image_index
                );
            }
        }
    }
    let summary = handle.wait().await?;

    fs::write(out, session.export_snapshot().await?)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!(
        "Trained {} examples across {} classes in {:.2?}; snapshot written to {}",
        summary.examples,
        summary.classes,
        start_time.elapsed(),
        out.display()
    );
    Ok(())
}

async fn open_snapshot(config: ClassifierConfig, snapshot: &Path, args: &ExtractorArgs) -> Result<ClassifierSession> {
    let session = new_session(config, args)?;
    let bytes = fs::read(snapshot).with_context(|| format!("Failed to read {}", snapshot.display()))?;
    session.import_snapshot(&bytes).await?;
    Ok(session)
}

async fn predict(config: ClassifierConfig, snapshot: &Path, images: &[PathBuf], args: &ExtractorArgs) -> Result<()> {
    let session = open_snapshot(config, snapshot, args).await?;
    for path in images {
        let bytes = fs::read(path)?;
        match session.predict_live(&bytes).await {
            Ok(Some(prediction)) => {
                println!("\n{}", path.display());
                println!(
                    "  Predicted class: {} ({:.1}%)",
                    prediction.name.as_deref().unwrap_or("?"),
                    prediction.confidence * 100.0
                );
                for (label, confidence) in prediction.distribution.ranked() {
                    let name = session.class_name(label).await.unwrap_or_else(|| label.to_string());
                    println!("    {}: {:.1}%", name, confidence * 100.0);
                }
            }
            Ok(None) => println!("{}: classifier is untrained", path.display()),
            Err(e) => eprintln!("{}: {}", path.display(), e),
        }
    }
    Ok(())
}

async fn evaluate(config: ClassifierConfig, snapshot: &Path, args: &ExtractorArgs) -> Result<()> {
    let session = open_snapshot(config, snapshot, args).await?;
    let Some(evaluation) = session.evaluate().await? else {
        bail!("Snapshot holds fewer than two examples");
    };
    println!("Leave-one-out accuracy: {:.1}% ({} examples)", evaluation.accuracy * 100.0, evaluation.evaluated);
    for (label, row) in evaluation.labels.iter().zip(&evaluation.confusion_matrix) {
        let name = session.class_name(*label).await.unwrap_or_else(|| label.to_string());
        println!("  {:<20} {:?}", name, row);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Command::Download { fresh } => download(*fresh).await,
        Command::Train {
            data_dir,
            out,
            extractor,
        } => train(config, data_dir, out, extractor).await,
        Command::Predict {
            snapshot,
            images,
            extractor,
        } => predict(config, snapshot, images, extractor).await,
        Command::Evaluate { snapshot, extractor } => evaluate(config, snapshot, extractor).await,
    }
}
