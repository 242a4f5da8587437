//! MedGuard command-line driver.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use medguard::{LabeledImages, MedguardConfig, train, write_labels};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "medguard")]
#[command(about = "Counterfeit medicine package detection", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `medguard=debug,anomaly=debug`
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract embeddings, fit the configured models and write reports
    Train {
        /// YAML run configuration
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write the `filename,label` table for two class directories
    Labels {
        #[arg(long, default_value = "real_medicines")]
        genuine_dir: PathBuf,

        #[arg(long, default_value = "fake_medicines")]
        counterfeit_dir: PathBuf,

        #[arg(short, long, default_value = "labels.csv")]
        output: PathBuf,
    },

    /// Print the default run configuration as YAML
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Train { config } => {
            let cfg = MedguardConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let report = train(&cfg)?;
            for model in &report.models {
                let metrics = model.evaluation.classification.as_ref();
                println!(
                    "{:<12} threshold {:>10.5} ({}), f1 {}, saved to {}",
                    model.fit.method.as_str(),
                    model.fit.threshold,
                    model.fit.threshold_source.as_str(),
                    metrics.map_or_else(|| "n/a".to_string(), |m| format!("{:.3}", m.f1)),
                    model.model_path.display()
                );
            }
            if let Some(ensemble) = &report.ensemble {
                println!(
                    "ensemble     f1 {:.3}, {} of {} validation images low-confidence",
                    ensemble.classification.f1,
                    ensemble.low_confidence,
                    report.samples.validation_genuine + report.samples.validation_counterfeit
                );
            }
        }
        Commands::Labels {
            genuine_dir,
            counterfeit_dir,
            output,
        } => {
            let images = LabeledImages::discover(&genuine_dir, &counterfeit_dir)?;
            write_labels(&output, &images)?;
            println!("label table created: {}", output.display());
        }
        Commands::InitConfig => {
            print!("{}", MedguardConfig::default().to_yaml()?);
        }
    }

    Ok(())
}
