use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use flakescan::{
    LoggingObserver, ModelCatalog, ModelReference, PipelineController, PipelineState,
    RunConfiguration,
};

#[derive(Parser)]
#[command(name = "flakescan")]
#[command(about = "Detect material flakes in a folder of microscope images")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the detector over every image in a folder
    Run {
        /// Folder containing the images
        #[arg(value_name = "IMAGES_DIR")]
        images_dir: PathBuf,

        /// Folder holding the contrast models and models_info.json
        #[arg(long, value_name = "DIR", default_value = "Models")]
        models_dir: PathBuf,

        /// Model display name from models_info.json
        #[arg(long, conflicts_with = "parameter_file")]
        model: Option<String>,

        /// Parameter file name inside the models folder
        #[arg(long, value_name = "FILE")]
        parameter_file: Option<String>,

        /// JSON file with run settings; flags below override it
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Minimum flake size in pixels [default: 1000]
        #[arg(long)]
        size_threshold: Option<u32>,

        /// Minimum confidence for a flake to be drawn [default: 0.0]
        #[arg(long)]
        min_confidence: Option<f32>,

        /// Flatfield image used to remove vignetting
        #[arg(long, value_name = "PATH")]
        flatfield: Option<PathBuf>,

        /// Shared folder to save results into, if reachable
        #[arg(long, value_name = "DIR")]
        shared_output: Option<PathBuf>,
    },
    /// List the models in models_info.json
    Models {
        #[arg(long, value_name = "DIR", default_value = "Models")]
        models_dir: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("flakescan={default_level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Models { models_dir } => {
            let catalog = ModelCatalog::load(&models_dir)?;
            for (name, entry) in catalog.entries() {
                println!("{name}  ({})", entry.parameter_file);
                if !entry.description.is_empty() {
                    println!("    {}", entry.description);
                }
            }
            Ok(())
        }
        Command::Run {
            images_dir,
            models_dir,
            model,
            parameter_file,
            config,
            size_threshold,
            min_confidence,
            flatfield,
            shared_output,
        } => {
            let reference = match (model, parameter_file) {
                (Some(name), _) => ModelCatalog::load(&models_dir)?
                    .reference(&name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown model: {}", name))?,
                (None, Some(file)) => ModelReference::new(&models_dir, file),
                (None, None) => anyhow::bail!("Either --model or --parameter-file is required"),
            };

            let mut config = match config {
                Some(path) => RunConfiguration::from_json_file(&path)?,
                None => RunConfiguration::default(),
            };
            if let Some(size) = size_threshold {
                config = config.with_size_threshold(size);
            }
            if let Some(confidence) = min_confidence {
                config = config.with_confidence_threshold(confidence);
            }
            if let Some(path) = flatfield {
                config = config.with_flatfield(path);
            }
            if let Some(root) = shared_output {
                config = config.with_shared_output(root);
            }

            let mut controller = PipelineController::new(Arc::new(LoggingObserver));
            let token = controller.start(config, &reference, &images_dir)?;

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let state = controller.drive().await;
            if let Some(summary) = controller.summary() {
                println!("\n=== Flake Detection Results ===");
                println!("Images processed: {}", summary.processed);
                println!("Images skipped:   {}", summary.skipped);
                println!("Sources skipped:  {}", summary.skipped_sources);
                println!("Images with flakes: {}", summary.images_written);
                println!("Output folder: {}", summary.output_directory.display());
            }

            if state == PipelineState::Cancelled {
                anyhow::bail!("Run cancelled");
            }
            Ok(())
        }
    }
}
