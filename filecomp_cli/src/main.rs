use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use filecomp_common::{
    ensure_config, load_config, load_config_from, BinaryDiffResult, CompareOptions, CompareOutcome, CompareResult,
    Encoding, Endian, EolConversion, LineSpec, LoadedConfig, Side, SideOptions, TextDiffResult, TextFileModel,
};
use filecomp_core::{collapse_context, CompareOrchestrator, CompareRequest, CompareWorker};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "filecomp")]
#[command(author = "FileComp Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Text and binary file comparison", long_about = None)]
struct Cli {
    /// Use the configuration stored next to the executable
    #[arg(long, global = true)]
    portable: bool,

    /// Load configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two files
    Compare {
        /// Left file path
        left: PathBuf,

        /// Right file path
        right: PathBuf,

        #[command(flatten)]
        options: CompareArgs,

        /// Show only differences with N lines of context
        #[arg(short = 'C', long, value_name = "N")]
        context: Option<usize>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,

        /// Report only whether the files differ
        #[arg(short = 'q', long, conflicts_with_all = ["json", "context"])]
        brief: bool,

        /// Do not show a progress spinner
        #[arg(long)]
        no_progress: bool,

        /// Disable ANSI colors in output
        #[arg(long)]
        no_color: bool,
    },
    /// Detect the encoding of a file
    Detect {
        file: PathBuf,

        /// Encoding hint
        #[arg(long, value_enum)]
        encoding: Option<EncodingArg>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct CompareArgs {
    /// Compare as text even if the content looks binary
    #[arg(long, conflicts_with = "force_binary")]
    force_text: bool,

    /// Compare byte by byte
    #[arg(long)]
    force_binary: bool,

    /// Ignore case differences
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Ignore all white space
    #[arg(short = 'w', long)]
    ignore_all_space: bool,

    /// Ignore changes in the amount of white space
    #[arg(short = 'b', long)]
    ignore_space_change: bool,

    /// Ignore where lines are broken
    #[arg(long)]
    ignore_line_breaks: bool,

    /// Report changed lines without character-level detail
    #[arg(long)]
    no_details: bool,

    /// Normalize text to Unicode NFC before comparing
    #[arg(long)]
    nfc: bool,

    /// Encoding of the left file
    #[arg(long, value_enum)]
    left_encoding: Option<EncodingArg>,

    /// Encoding of the right file
    #[arg(long, value_enum)]
    right_encoding: Option<EncodingArg>,

    /// Single-byte recoding table for the left file (e.g. windows-1250)
    #[arg(long, value_name = "LABEL")]
    left_table: Option<String>,

    /// Single-byte recoding table for the right file
    #[arg(long, value_name = "LABEL")]
    right_table: Option<String>,

    /// Line endings converted to LF (repeatable)
    #[arg(long, value_enum, value_delimiter = ',')]
    eol: Vec<EolArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EncodingArg {
    Auto,
    Ascii8,
    Utf8,
    Utf16le,
    Utf16be,
    Utf32le,
    Utf32be,
}

impl EncodingArg {
    fn apply(self, side: &mut SideOptions) {
        let (encoding, endian) = match self {
            EncodingArg::Auto => (Encoding::Auto, Endian::Little),
            EncodingArg::Ascii8 => (Encoding::Ascii8, Endian::Little),
            EncodingArg::Utf8 => (Encoding::Utf8, Endian::Little),
            EncodingArg::Utf16le => (Encoding::Utf16, Endian::Little),
            EncodingArg::Utf16be => (Encoding::Utf16, Endian::Big),
            EncodingArg::Utf32le => (Encoding::Utf32, Endian::Little),
            EncodingArg::Utf32be => (Encoding::Utf32, Endian::Big),
        };
        side.encoding = encoding;
        side.endian = endian;
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EolArg {
    Cr,
    Crlf,
    Nul,
    None,
}

impl CompareArgs {
    /// Flags override the configured defaults
    fn apply(&self, options: &mut CompareOptions) {
        options.force_text |= self.force_text;
        options.force_binary |= self.force_binary;
        options.ignore_case |= self.ignore_case;
        options.ignore_all_space |= self.ignore_all_space;
        options.ignore_space_change |= self.ignore_space_change;
        options.ignore_line_break_changes |= self.ignore_line_breaks;
        options.normalization_form |= self.nfc;
        if self.no_details {
            options.detailed_differences = false;
        }

        let encodings = [self.left_encoding, self.right_encoding];
        let tables = [&self.left_table, &self.right_table];
        for side in Side::BOTH {
            let s = side.index();
            let target = &mut options.sides[s];
            if let Some(encoding) = encodings[s] {
                encoding.apply(target);
            }
            if let Some(table) = tables[s] {
                target.input_table = Some(table.clone());
            }
            if !self.eol.is_empty() {
                target.eol_conversion = self.eol.iter().fold(EolConversion::empty(), |mask, eol| match eol {
                    EolArg::Cr => mask | EolConversion::CR,
                    EolArg::Crlf => mask | EolConversion::CRLF,
                    EolArg::Nul => mask | EolConversion::NUL,
                    EolArg::None => mask,
                });
            }
        }
    }
}

fn main() -> ExitCode {
    // Initialize tracing to stderr (so JSON output can go cleanly to stdout)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Compare {
            left,
            right,
            options,
            context,
            json,
            brief,
            no_progress,
            no_color,
        } => {
            if *brief {
                run_brief(&cli, left, right, options)
            } else {
                run_compare(&cli, left, right, options, *context, *json, *no_progress, *no_color)
            }
        }
        Commands::Detect { file, encoding, json } => run_detect(&cli, file, *encoding, *json),
        Commands::Config { init } => run_config(&cli, *init),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load(cli: &Cli) -> Result<LoadedConfig> {
    let loaded = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(cli.portable),
    };
    loaded.context("failed to load configuration")
}

#[allow(clippy::too_many_arguments)]
fn run_compare(
    cli: &Cli,
    left: &Path,
    right: &Path,
    args: &CompareArgs,
    context: Option<usize>,
    json: bool,
    no_progress: bool,
    no_color: bool,
) -> Result<ExitCode> {
    let loaded = load(cli)?;
    info!("Using configuration {}", loaded.path.display());
    let mut options = loaded.config.compare.clone();
    args.apply(&mut options);

    let orchestrator = Arc::new(CompareOrchestrator::new(loaded.config.engine));
    let request = CompareRequest {
        left: left.to_path_buf(),
        right: right.to_path_buf(),
        options,
    };
    let handle = CompareWorker::spawn(orchestrator, request)?;

    let spinner = if no_progress || json || !std::io::stderr().is_terminal() {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Comparing...");
        Some(pb)
    };

    let outcome = handle.wait_with(|event| {
        if let Some(pb) = &spinner {
            pb.set_message(format!("{}% ({} changes)", event.percent, event.changes));
        }
    });
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let result = match outcome {
        CompareOutcome::Completed(result) => result,
        CompareOutcome::Cancelled => bail!("comparison cancelled"),
        CompareOutcome::Failed(e) => return Err(e).context("comparison failed"),
    };

    let use_color = !no_color && std::io::stdout().is_terminal();
    if json {
        let report = build_json_report(left, right, &result, context);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match &result {
            CompareResult::Identical => println!("Files are identical"),
            CompareResult::TextDiff(diff) => print_text_diff(diff, context, use_color),
            CompareResult::BinaryDiff(diff) => print_binary_diff(diff),
        }
    }

    Ok(if result.is_identical() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn run_brief(cli: &Cli, left: &Path, right: &Path, args: &CompareArgs) -> Result<ExitCode> {
    let loaded = load(cli)?;
    let mut options = loaded.config.compare.clone();
    args.apply(&mut options);

    let orchestrator = CompareOrchestrator::new(loaded.config.engine);
    if orchestrator.files_differ(left, right, &options, None)? {
        println!("Files {} and {} differ", left.display(), right.display());
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_text_diff(diff: &TextDiffResult, context: Option<usize>, color: bool) {
    let [left_name, right_name] = [&diff.files[0].name, &diff.files[1].name];
    let [left_enc, right_enc] = diff.encoding_names();
    println!("--- {} ({})", left_name.display(), left_enc);
    println!("+++ {} ({})", right_name.display(), right_enc);

    let scripts = match context {
        Some(lines) => collapse_context(&diff.line_scripts, lines),
        None => diff.line_scripts.clone(),
    };

    for (left, right) in scripts[0].iter().zip(scripts[1].iter()) {
        match (left, right) {
            (LineSpec::Separator, _) | (_, LineSpec::Separator) => println!("{:>6}   ...", ""),
            (LineSpec::Common { line }, LineSpec::Common { .. }) => {
                println!("{:>6}   {}", line + 1, diff.files[0].line_string(*line))
            }
            _ => {
                if let Some(line) = left.line() {
                    println!("{:>6} < {}", line + 1, render_line(&diff.files[0], left, color));
                }
                if let Some(line) = right.line() {
                    println!("{:>6} > {}", line + 1, render_line(&diff.files[1], right, color));
                }
            }
        }
    }

    println!("\n{} change block(s)", diff.change_count());
}

/// Line text with changed ranges shown in reverse video
fn render_line(file: &TextFileModel, spec: &LineSpec, color: bool) -> String {
    let Some(line) = spec.line() else {
        return String::new();
    };
    let units = file.line(line);
    let ranges = match spec.ranges() {
        Some(ranges) if color => ranges,
        _ => return String::from_utf16_lossy(units),
    };

    let mut out = String::new();
    let mut pos = 0;
    for &(start, end) in ranges {
        let (start, end) = (start.min(units.len()), end.min(units.len()));
        if start < pos {
            continue;
        }
        out.push_str(&String::from_utf16_lossy(&units[pos..start]));
        out.push_str("\x1b[7m");
        out.push_str(&String::from_utf16_lossy(&units[start..end]));
        out.push_str("\x1b[0m");
        pos = end;
    }
    out.push_str(&String::from_utf16_lossy(&units[pos..]));
    out
}

fn print_binary_diff(diff: &BinaryDiffResult) {
    println!(
        "Binary files differ ({} and {} bytes), first difference at offset {:#x}",
        diff.sizes[0], diff.sizes[1], diff.first_difference
    );
    for change in &diff.changes {
        println!("  {:#010x}  {} byte(s)", change.offset, change.length);
    }
    if diff.truncated {
        println!("  ... list truncated after {} changes", diff.changes.len());
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    left: String,
    right: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<JsonText>,
    #[serde(skip_serializing_if = "Option::is_none")]
    binary: Option<&'a BinaryDiffResult>,
}

#[derive(Serialize)]
struct JsonText {
    encodings: [String; 2],
    blocks: Vec<JsonBlock>,
    rows: Vec<JsonRow>,
}

#[derive(Serialize)]
struct JsonBlock {
    row: usize,
    rows: usize,
}

#[derive(Serialize)]
struct JsonRow {
    left: LineSpec,
    right: LineSpec,
}

fn build_json_report<'a>(left: &Path, right: &Path, result: &'a CompareResult, context: Option<usize>) -> JsonReport<'a> {
    let (status, text, binary) = match result {
        CompareResult::Identical => ("identical", None, None),
        CompareResult::TextDiff(diff) => {
            let scripts = match context {
                Some(lines) => collapse_context(&diff.line_scripts, lines),
                None => diff.line_scripts.clone(),
            };
            let [left_rows, right_rows] = scripts;
            let text = JsonText {
                encodings: diff.encoding_names().map(str::to_string),
                blocks: diff
                    .change_index
                    .iter()
                    .zip(&diff.change_lengths)
                    .map(|(&row, &rows)| JsonBlock { row, rows })
                    .collect(),
                rows: left_rows
                    .to_vec()
                    .into_iter()
                    .zip(right_rows.to_vec())
                    .map(|(left, right)| JsonRow { left, right })
                    .collect(),
            };
            ("text-diff", Some(text), None)
        }
        CompareResult::BinaryDiff(diff) => ("binary-diff", None, Some(diff)),
    };

    JsonReport {
        left: left.display().to_string(),
        right: right.display().to_string(),
        status,
        text,
        binary,
    }
}

#[derive(Serialize)]
struct JsonDetection {
    path: String,
    text: bool,
    encoding: String,
    confidence: String,
}

fn run_detect(cli: &Cli, file: &Path, hint: Option<EncodingArg>, json: bool) -> Result<ExitCode> {
    let loaded = load(cli)?;
    let mut options = loaded.config.compare.clone();
    if let Some(hint) = hint {
        hint.apply(&mut options.sides[Side::Left.index()]);
    }

    let orchestrator = CompareOrchestrator::new(loaded.config.engine);
    let detection = orchestrator
        .detect_file(file, &options, Side::Left)
        .with_context(|| format!("failed to detect encoding of {}", file.display()))?;

    if json {
        let report = JsonDetection {
            path: file.display().to_string(),
            text: detection.is_text,
            encoding: detection.encoding_name(),
            confidence: format!("{:?}", detection.confidence),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if detection.is_text {
        println!("{}: {} ({:?})", file.display(), detection.encoding_name(), detection.confidence);
    } else {
        println!("{}: binary", file.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_config(cli: &Cli, init: bool) -> Result<ExitCode> {
    let loaded = if init && cli.config.is_none() {
        ensure_config(cli.portable).context("failed to write configuration")?
    } else {
        load(cli)?
    };

    println!("# {}{}", loaded.path.display(), if loaded.exists { "" } else { " (defaults)" });
    print!("{}", toml::to_string_pretty(&loaded.config)?);
    Ok(ExitCode::SUCCESS)
}
