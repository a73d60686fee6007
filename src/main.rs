use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use folio_lib::commands::batch_commands::{self, BatchRequest};
use folio_lib::commands::{process_commands, watch_commands};
use folio_lib::config::Config;
use folio_lib::logging;
use folio_lib::services::export_service::ExportFormat;
use folio_lib::services::ocr_service::{PdfTextRecognizer, TextRecognizer};

#[derive(Parser, Debug)]
#[command(name = "folio-ocr", version, about = "Incremental OCR for document archives")]
struct Cli {
    /// Config file (defaults to config.toml in the app support directory)
    #[arg(long, global = true, env = "FOLIO_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the documents directory and keep it recognized
    Watch {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Recognize one document and print the export to stdout
    Process {
        path: PathBuf,
        #[arg(long, value_enum)]
        format: Option<ExportFormat>,
    },
    /// Recognize every document in a directory
    Batch {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        parallel: bool,
        #[arg(long, value_enum)]
        format: Option<ExportFormat>,
    },
    /// Write a document's PDF payload to a file
    Extract { path: PathBuf, output: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let mut config = Config::resolve(cli.config.as_deref()).context("failed to load configuration")?;
    let recognizer: Arc<dyn TextRecognizer> = Arc::new(PdfTextRecognizer);

    match cli.command {
        Command::Watch { root } => {
            if let Some(root) = root {
                config.documents_dir = root;
            }
            watch_commands::run_watch(&config, recognizer)
                .await
                .context("watcher stopped with an error")?;
        }
        Command::Process { path, format } => {
            let format = format.unwrap_or(config.export_format);
            let bytes = process_commands::process_file(&path, recognizer, &config.ocr, format)
                .with_context(|| format!("failed to process {}", path.display()))?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
        Command::Batch {
            input,
            output,
            parallel,
            format,
        } => {
            let request = BatchRequest {
                input,
                output,
                parallel,
                format: format.unwrap_or(config.export_format),
                results_dir_name: config.results_dir_name.clone(),
                options: config.ocr.clone(),
            };
            let summary = batch_commands::run_batch(request, recognizer)
                .await
                .context("batch failed")?;
            tracing::info!(
                processed = summary.processed,
                failed = summary.failed.len(),
                "batch complete"
            );
        }
        Command::Extract { path, output } => {
            let written = process_commands::extract_pdf(&path, &output)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if !written {
                anyhow::bail!("{} has no PDF payload", path.display());
            }
        }
    }

    Ok(())
}
