use anyhow::Context;
use clap::{Parser, Subcommand};
use ecg_ingest::config::{load_field_list, IngestConfig};
use ecg_ingest::logging;
use ecg_ingest::pipeline::{self, IngestPipeline, RunSummary};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ecg_ingest")]
#[command(about = "De-identifying ingestion of resting ECG XML exports")]
#[command(version)]
struct Cli {
    /// Directory for rolling JSON log files
    #[arg(long, default_value = "logs", global = true)]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every *.xml file of a directory as one batch
    Ingest {
        /// TOML run configuration
        #[arg(long)]
        config: PathBuf,
        /// Directory of exported XML files
        #[arg(long)]
        xml_dir: PathBuf,
    },
    /// Propose a PHI field list from a sample export
    SuggestPhi {
        #[arg(long)]
        sample: PathBuf,
    },
    /// List PHI-looking tags in a directory that the configured field list misses
    AuditPhi {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        xml_dir: PathBuf,
    },
}

fn print_summary(summary: &RunSummary) {
    println!("\nIngestion results for batch {}:", summary.buid);
    println!("   Total files: {}", summary.total_files);
    println!("   Accepted: {}", summary.accepted);
    println!("   Unparsable: {}", summary.unparsable);
    println!("   Duplicates: {}", summary.duplicates);
    println!("   Unique patients: {}", summary.unique_patients);
    println!("   New PUIDs: {}", summary.new_puids);
    if let (Some(oldest), Some(newest)) = (summary.oldest_acquisition, summary.newest_acquisition) {
        println!("   Acquired: {} to {}", oldest, newest);
    }
    println!("   At 500 Hz: {:.1}%", summary.percent_500hz);
    println!("   Low-pass 40 Hz: {:.1}%", summary.percent_lpf_40hz);
    if summary.feature_failures > 0 || summary.sink_failures > 0 {
        println!(
            "   Failed feature sub-batches: {}, undelivered records: {}",
            summary.feature_failures, summary.sink_failures
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(&cli.log_dir)?;

    match cli.command {
        Commands::Ingest { config, xml_dir } => {
            let config = IngestConfig::load(&config)?;
            let files = pipeline::list_xml_files(&xml_dir)
                .with_context(|| format!("listing {}", xml_dir.display()))?;
            info!(files = files.len(), dir = %xml_dir.display(), "Starting ingestion");

            let pipeline = IngestPipeline::from_config(&config)?;
            match pipeline.run(&files) {
                Ok(summary) => print_summary(&summary),
                Err(e) => {
                    error!("Ingestion failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Commands::SuggestPhi { sample } => {
            for field in pipeline::suggest_phi_fields(&sample)? {
                println!("{}", field);
            }
        }
        Commands::AuditPhi { config, xml_dir } => {
            let config = IngestConfig::load(&config)?;
            let configured = load_field_list(&config.fields.phi_fields)?;
            let files = pipeline::list_xml_files(&xml_dir)?;
            let uncovered = pipeline::audit_phi_tags(&files, &configured);
            if uncovered.is_empty() {
                println!("All PHI-looking tags in {} files are configured", files.len());
            } else {
                for (tag, count) in uncovered {
                    println!("{}\t{} files", tag, count);
                }
            }
        }
    }

    Ok(())
}
