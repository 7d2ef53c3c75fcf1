//! `dandi-dl`: CLI entry point.
//!
//! Parses arguments, wires a [`HttpArchiveClient`] into the
//! [`engine::coordinator`], renders progress to the terminal, and maps the
//! run's outcome onto the process exit status (spec.md §7).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use dandi_dl::engine::config::{HttpConfig, JobsConfig, RetryConfig};
use dandi_dl::engine::coordinator::{self, CoordinatorRequest, Format, PathFilter, PathMatch};
use dandi_dl::engine::dandiset_yaml::{self, DandisetYamlExistence, DandisetYamlRequest};
use dandi_dl::engine::file_downloader::ExistencePolicy;
use dandi_dl::engine::http_archive::HttpArchiveClient;
use dandi_dl::engine::progress::{ItemsSummary, ProgressEvent, StatusKind};
use dandi_dl::engine::sync::{self, InteractiveConfirmer};
use dandi_dl::error::EngineError;

#[derive(Clone, Parser)]
#[command(
    name = "dandi-dl",
    version,
    about = "A resumable, checksum-verifying downloader for versioned scientific dataset archives.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet logging: only errors are emitted.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging; repeat for more detail.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Subcommand)]
enum Commands {
    /// Download every asset the archive reports under `url`.
    Download(DownloadArgs),
}

#[derive(Clone, ValueEnum)]
enum ExistencePolicyArg {
    Error,
    Skip,
    Overwrite,
    OverwriteDifferent,
    Refresh,
}

impl From<ExistencePolicyArg> for ExistencePolicy {
    fn from(value: ExistencePolicyArg) -> Self {
        match value {
            ExistencePolicyArg::Error => ExistencePolicy::Error,
            ExistencePolicyArg::Skip => ExistencePolicy::Skip,
            ExistencePolicyArg::Overwrite => ExistencePolicy::Overwrite,
            ExistencePolicyArg::OverwriteDifferent => ExistencePolicy::OverwriteDifferent,
            ExistencePolicyArg::Refresh => ExistencePolicy::Refresh,
        }
    }
}

impl From<ExistencePolicyArg> for DandisetYamlExistence {
    fn from(value: ExistencePolicyArg) -> Self {
        match value {
            ExistencePolicyArg::Error => DandisetYamlExistence::Error,
            ExistencePolicyArg::Skip => DandisetYamlExistence::Skip,
            ExistencePolicyArg::Overwrite | ExistencePolicyArg::OverwriteDifferent => {
                DandisetYamlExistence::Overwrite
            }
            ExistencePolicyArg::Refresh => DandisetYamlExistence::Refresh,
        }
    }
}

#[derive(Clone, Parser)]
struct DownloadArgs {
    /// Root URL of the archive's asset manifest (`<url>/assets.json`).
    url: Url,

    /// Local directory to materialize the dataset into.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// What to do when a local path already exists.
    #[arg(long = "existing", value_enum, default_value_t = ExistencePolicyArgDefault::get())]
    existing: ExistencePolicyArg,

    /// Relative manifest path for a raw `dandiset.yaml`; skipped if absent.
    #[arg(long = "dandiset-yaml-path")]
    dandiset_yaml_path: Option<String>,

    /// After a successful download, offer to delete local paths absent from
    /// the remote asset set (spec.md §6 sync mode).
    #[arg(long = "sync")]
    sync: bool,

    /// Download report format: `pyout` tallies every asset's outcome and
    /// reports a summary; `debug` re-raises the first failure instead
    /// (spec.md §6, §7).
    #[arg(long = "format", value_enum, default_value_t = FormatArg::Pyout)]
    format: FormatArg,

    /// Only download assets whose path matches this pattern (spec.md §6).
    #[arg(long = "path-filter")]
    path_filter: Option<String>,

    /// How `--path-filter` is matched against each asset's path.
    #[arg(long = "path-type", value_enum, default_value_t = PathMatchArg::Exact)]
    path_type: PathMatchArg,

    #[command(flatten)]
    http: HttpConfig,

    #[command(flatten)]
    retry: RetryConfig,

    #[command(flatten)]
    jobs: JobsConfig,
}

// `ValueEnum`'s `default_value_t` wants a `Display` value, not a clap-free
// default; this indirection keeps `ExistencePolicyArg` itself free of a
// manual `Display` impl while still defaulting to `overwrite-different`.
struct ExistencePolicyArgDefault;
impl ExistencePolicyArgDefault {
    fn get() -> ExistencePolicyArg {
        ExistencePolicyArg::OverwriteDifferent
    }
}

impl std::fmt::Display for ExistencePolicyArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExistencePolicyArg::Error => "error",
            ExistencePolicyArg::Skip => "skip",
            ExistencePolicyArg::Overwrite => "overwrite",
            ExistencePolicyArg::OverwriteDifferent => "overwrite-different",
            ExistencePolicyArg::Refresh => "refresh",
        };
        f.write_str(s)
    }
}

/// Download report format (spec.md §6).
#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Pyout,
    Debug,
}

impl From<FormatArg> for Format {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Pyout => Format::Pyout,
            FormatArg::Debug => Format::Debug,
        }
    }
}

impl std::fmt::Display for FormatArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FormatArg::Pyout => "pyout",
            FormatArg::Debug => "debug",
        })
    }
}

/// Path matching mode for `--path-filter` (spec.md §6).
#[derive(Clone, Copy, ValueEnum)]
enum PathMatchArg {
    Exact,
    Glob,
}

impl From<PathMatchArg> for PathMatch {
    fn from(value: PathMatchArg) -> Self {
        match value {
            PathMatchArg::Exact => PathMatch::Exact,
            PathMatchArg::Glob => PathMatch::Glob,
        }
    }
}

impl std::fmt::Display for PathMatchArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PathMatchArg::Exact => "exact",
            PathMatchArg::Glob => "glob",
        })
    }
}

fn setup_tracing(cli: &Cli) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(Level::WARN.into())
        .from_env_lossy();

    if std::env::var("RUST_LOG").is_err() {
        if cli.quiet {
            filter = filter.add_directive(Level::ERROR.into());
        } else {
            filter = filter.add_directive(
                match cli.verbose {
                    0 => Level::WARN,
                    1 => Level::INFO,
                    2 => Level::DEBUG,
                    _ => Level::TRACE,
                }
                .into(),
            );
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .unwrap()
        .progress_chars("##-"),
    );
    bar
}

async fn run_download(args: DownloadArgs) -> anyhow::Result<i32> {
    let client = HttpArchiveClient::new(args.url.clone(), &args.http)?;

    let req = CoordinatorRequest {
        output_root: args.output.clone(),
        existence: args.existing.clone().into(),
        jobs: args.jobs,
        retry: args.retry,
        path_filter: args.path_filter.clone().map(|pattern| PathFilter {
            pattern,
            mode: args.path_type.into(),
        }),
    };

    tokio::fs::create_dir_all(&args.output).await?;

    let items_summary = ItemsSummary::new();
    let bar = progress_bar();
    let per_asset_done: Mutex<std::collections::HashMap<String, u64>> =
        Mutex::new(std::collections::HashMap::new());

    let mut emit = |path: &str, event: ProgressEvent| match event {
        ProgressEvent::Size(n) => {
            let mut totals = per_asset_done.lock().unwrap();
            totals.entry(path.to_string()).or_insert(0);
            drop(totals);
            bar.inc_length(n);
        }
        ProgressEvent::Done { done, .. } => {
            let mut totals = per_asset_done.lock().unwrap();
            let prev = totals.insert(path.to_string(), done).unwrap_or(0);
            drop(totals);
            bar.inc(done.saturating_sub(prev));
        }
        ProgressEvent::Status { kind, message } => match kind {
            StatusKind::Error => {
                bar.println(format!(
                    "{} {path}: {}",
                    "error".red().bold(),
                    message.unwrap_or_default()
                ));
            }
            StatusKind::Skipped => {
                bar.println(format!("{} {path}", "skipped".yellow()));
            }
            StatusKind::Done => {
                bar.set_message(format!("last: {path}"));
            }
            StatusKind::Downloading | StatusKind::SettingMtime => {}
        },
        ProgressEvent::Checksum { outcome, .. } => {
            if outcome == dandi_dl::engine::progress::ChecksumOutcome::Differs {
                bar.println(format!("{} {path}: checksum mismatch", "error".red().bold()));
            }
        }
        ProgressEvent::Message(_) => {}
    };

    let mut summary = coordinator::run(&client, &req, &items_summary, &mut emit).await?;
    bar.finish_and_clear();

    if matches!(Format::from(args.format), Format::Debug) {
        if let Some(error) = summary.take_first_error() {
            return Err(error.into());
        }
    }

    if let Some(relative) = &args.dandiset_yaml_path {
        let url = args.url.join(relative)?;
        let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
        let yaml_req = DandisetYamlRequest {
            path: args.output.join("dandiset.yaml"),
            toplevel_path: args.output.clone(),
            contents: bytes.to_vec(),
            mtime: None,
            existence: args.existing.clone().into(),
        };
        let mut yaml_emit = |_: ProgressEvent| {};
        dandiset_yaml::update_dandiset_yaml(&yaml_req, &mut yaml_emit).await?;
    }

    if args.sync {
        let downloaded: HashSet<String> = summary
            .outcomes
            .iter()
            .filter(|o| o.error.is_none())
            .map(|o| o.path.clone())
            .collect();
        let deleted = sync::sync(&args.output, &downloaded, &InteractiveConfirmer).await?;
        if !deleted.is_empty() {
            println!("{}", format!("deleted {} stale local path(s)", deleted.len()).purple());
        }
    }

    let snapshot = items_summary.snapshot();
    if summary.all_succeeded() {
        println!(
            "{}",
            format!(
                "downloaded {} of {} asset(s) into {}",
                summary.total_assets,
                snapshot.files_seen,
                args.output.display()
            )
            .purple()
        );
        Ok(0)
    } else {
        let failed = summary.failed();
        eprintln!("{}", format!("{failed} of {} asset(s) failed", summary.total_assets).red());
        Ok(summary
            .first_error()
            .map(EngineError::exit_code)
            .unwrap_or(exitcode::SOFTWARE))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic::setup_panic!();
    let cli = Cli::parse();
    setup_tracing(&cli);

    let code = match cli.command {
        Commands::Download(args) => run_download(args).await?,
    };
    std::process::exit(code);
}
