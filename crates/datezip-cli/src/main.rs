use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use datezip_core::date::DateField;
use datezip_core::{CancellationToken, ConvertControl, ConvertOptions};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum DateFieldArg {
    /// EXIF DateTime (ModifyDate)
    Modify,
    /// EXIF DateTimeOriginal, then DateTimeDigitized
    Create,
}

impl From<DateFieldArg> for DateField {
    fn from(arg: DateFieldArg) -> Self {
        match arg {
            DateFieldArg::Modify => DateField::Modify,
            DateFieldArg::Create => DateField::Create,
        }
    }
}

#[derive(Parser)]
#[command(name = "datezip", version, about = "Convert photos to WebP and package them by capture date")]
struct Cli {
    /// JPEG/PNG files to convert
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// JSON options file; command-line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep original dimensions
    #[arg(long)]
    no_compress: bool,

    /// Organize the archive into <root>/YYYY/M/D folders
    #[arg(long)]
    organize: bool,

    /// Maximum width for landscape images
    #[arg(long)]
    max_width: Option<u32>,

    /// Maximum height for portrait and square images
    #[arg(long)]
    max_height: Option<u32>,

    /// EXIF timestamp used for bucketing
    #[arg(long, value_enum)]
    date_field: Option<DateFieldArg>,

    /// Archive file name (default: <root-folder>.zip)
    #[arg(long)]
    archive_name: Option<String>,

    /// Top-level folder inside an organized archive (default: photos_<timestamp>)
    #[arg(long)]
    root_folder: Option<String>,

    /// Give up decoding a single image after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Worker threads (default: one per CPU)
    #[arg(long)]
    threads: Option<usize>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn options(self) -> anyhow::Result<ConvertOptions> {
        let mut options = match &self.config {
            Some(path) => ConvertOptions::from_json_file(path)?,
            None => ConvertOptions::default(),
        };
        options.inputs = self.inputs;
        options.output = self.output;
        if self.no_compress {
            options.compress = false;
        }
        if self.organize {
            options.organize = true;
        }
        if let Some(w) = self.max_width {
            options.max_width = w;
        }
        if let Some(h) = self.max_height {
            options.max_height = h;
        }
        if let Some(field) = self.date_field {
            options.date_field = field.into();
        }
        if self.archive_name.is_some() {
            options.archive_name = self.archive_name;
        }
        if self.root_folder.is_some() {
            options.root_folder = self.root_folder;
        }
        if let Some(secs) = self.timeout_secs {
            options.decode_timeout_secs = secs;
        }
        if let Some(threads) = self.threads {
            options.threads = threads;
        }
        Ok(options)
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let t_total = std::time::Instant::now();
    let options = cli.options()?;

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        handler_token.cancel();
    })?;

    let pb = ProgressBar::new(options.inputs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} {msg}")?,
    );
    let bar = pb.clone();
    let progress = Arc::new(move |_stage: &str, current: u64, total: u64, message: &str| {
        bar.set_length(total);
        bar.set_position(current);
        bar.set_message(message.to_string());
    });

    let control = ConvertControl::new().with_cancel_token(token);
    let result = datezip_core::convert_with_control(&options, &control, progress);
    pb.finish_and_clear();
    let result = result?;

    for warning in &result.warnings {
        tracing::warn!("{}", warning);
    }
    eprintln!(
        "Done! {} converted, {} failed, {} without date -> {} ({:.2}s)",
        result.converted,
        result.failed,
        result.undated,
        result.output.display(),
        t_total.elapsed().as_secs_f64()
    );

    Ok(())
}
