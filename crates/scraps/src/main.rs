use std::env;
use std::fs;
use std::io::{self, IsTerminal as _, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context as _};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use directories::BaseDirs;
use scraps::api::ApiClient;
use scraps::claim::{generate_agent_id, ClaimClient};
use scraps::config_store;
use scraps::output::{claim_json, claim_text, release_json, release_text, SignalPrinter};
use scraps::transport::Subscription;
use scraps::watch::{build_transport, spawn_stdin_reader, SessionClaims, WatchOptions, WatchSession};
use scraps_core::backoff::Backoff;
use scraps_core::claims::{ClaimVerdict, DEFAULT_DESCRIPTION, DEFAULT_TTL_SECONDS};
use scraps_core::config::{resolve_endpoint, ConfigFile, EnvOverrides, OutputFormat, TransportKind};
use scraps_core::event::EventKind;
use scraps_core::paths::{compute_paths, PathInputs, ScrapsPaths};
use scraps_core::reference::{BranchRef, RepoRef};
use scraps_core::watch::WatchFilter;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scraps",
    version,
    about = "Watch live repository activity and coordinate file claims"
)]
struct Cli {
    #[arg(long, global = true, value_name = "DIR", env = "SCRAPS_DIR")]
    scraps_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "URL", env = "SCRAPS_HOST")]
    host: Option<String>,

    #[arg(long, global = true, env = "SCRAPS_LOG", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream live events for a repository
    Watch(WatchArgs),
    /// Claim file patterns on a branch
    Claim(ClaimArgs),
    /// Release previously claimed patterns
    Release(ReleaseArgs),
    Version,
    Completion {
        #[command(subcommand)]
        command: CompletionCommand,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// store/repo[:branch]
    reference: String,

    #[arg(short, long)]
    branch: Option<String>,

    /// Only events touching paths under this prefix or glob
    #[arg(long)]
    path: Option<String>,

    /// Resume after this event id on the first connection
    #[arg(long, value_name = "ID")]
    last_event_id: Option<String>,

    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Event kinds to show (repeatable or comma separated)
    #[arg(short = 't', long = "type", value_name = "KIND", value_delimiter = ',')]
    kinds: Vec<EventKind>,

    /// Case-insensitive text filter
    #[arg(short, long)]
    filter: Option<String>,

    /// Hide claim activity
    #[arg(long)]
    no_claims: bool,

    /// Read commands from stdin even when it is not a terminal
    #[arg(short, long)]
    interactive: bool,
}

#[derive(Args, Debug)]
struct ClaimArgs {
    /// store/repo:branch
    reference: String,

    #[arg(required = true)]
    patterns: Vec<String>,

    #[arg(short, long)]
    branch: Option<String>,

    #[arg(short, long, default_value = DEFAULT_DESCRIPTION)]
    message: String,

    /// Seconds until the claim lapses
    #[arg(long, default_value_t = DEFAULT_TTL_SECONDS)]
    ttl: u32,

    /// Reuse an identity from an earlier claim
    #[arg(long)]
    agent_id: Option<String>,
}

#[derive(Args, Debug)]
struct ReleaseArgs {
    /// store/repo:branch
    reference: String,

    #[arg(required = true)]
    patterns: Vec<String>,

    #[arg(short, long)]
    branch: Option<String>,

    /// Identity printed by `scraps claim`
    #[arg(long, required = true)]
    agent_id: String,
}

#[derive(Subcommand, Debug)]
enum CompletionCommand {
    Bash,
    Fish,
    Powershell,
    Zsh,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TransportArg {
    Sse,
    Ws,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Sse => TransportKind::Sse,
            TransportArg::Ws => TransportKind::Ws,
        }
    }
}

/// Settings every networked command needs.
struct CommandContext {
    paths: ScrapsPaths,
    config: ConfigFile,
    format: OutputFormat,
    api: ApiClient,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths(cli.scraps_dir.as_ref())?;
    // A broken config is reported by the command that needs it, not here.
    let config_level = config_store::load(&paths)
        .await
        .ok()
        .and_then(|config| config.log_level);
    init_logging(&paths, cli.log_level.as_deref(), config_level.as_deref())?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scraps starting");

    let globals = Globals {
        host: cli.host,
        json: cli.json,
    };
    dispatch(cli.command, &paths, globals).await
}

struct Globals {
    host: Option<String>,
    json: bool,
}

fn resolve_paths(scraps_dir_override: Option<&PathBuf>) -> anyhow::Result<ScrapsPaths> {
    let base_dirs = BaseDirs::new().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let home_dir = base_dirs.home_dir().to_path_buf();

    let scraps_dir_override = scraps_dir_override
        .cloned()
        .or_else(|| env::var_os("SCRAPS_DIR").map(PathBuf::from));

    Ok(compute_paths(PathInputs {
        home_dir,
        scraps_dir_override,
    }))
}

fn init_logging(
    paths: &ScrapsPaths,
    log_level: Option<&str>,
    config_level: Option<&str>,
) -> anyhow::Result<()> {
    let dir_ok = fs::create_dir_all(&paths.scraps_dir).is_ok();

    let env_level = env::var("RUST_LOG").ok();
    let level = log_level
        .map(str::to_owned)
        .or_else(|| env::var("SCRAPS_LOG").ok())
        .or(env_level)
        .or_else(|| config_level.map(str::to_owned))
        .unwrap_or_else(|| "info".to_owned());

    let explicit =
        log_level.is_some() || env::var_os("SCRAPS_LOG").is_some() || config_level.is_some();
    // Stdout carries command output; the console only shows warnings unless a
    // level was asked for.
    let stderr_level = if explicit { level.clone() } else { "warn".to_owned() };

    let filter = EnvFilter::try_new(level).context("parse log level")?;
    let stderr_filter = EnvFilter::try_new(stderr_level).context("parse log level")?;

    let file_layer = if dir_ok {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::NEVER)
            .filename_prefix("scraps")
            .filename_suffix("log")
            .build(&paths.scraps_dir)
            .ok()
            .map(|file_appender| {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_appender)
            })
    } else {
        None
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .with_filter(stderr_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

async fn dispatch(command: Command, paths: &ScrapsPaths, globals: Globals) -> anyhow::Result<()> {
    match command {
        Command::Version => version(),
        Command::Completion { command } => completion(command),
        Command::Watch(args) => watch(load_context(paths, &globals).await?, args).await,
        Command::Claim(args) => claim(load_context(paths, &globals).await?, args).await,
        Command::Release(args) => release(load_context(paths, &globals).await?, args).await,
    }
}

async fn load_context(paths: &ScrapsPaths, globals: &Globals) -> anyhow::Result<CommandContext> {
    let config = config_store::load(paths).await?;
    let credentials = config_store::load_credentials(paths).await?;

    let env = EnvOverrides {
        base_url: env::var("SCRAPS_BASE_URL").ok(),
        api_key: env::var("SCRAPS_API_KEY").ok(),
    };
    let endpoint = resolve_endpoint(&config, &credentials, globals.host.as_deref(), &env)
        .context("resolve host")?;
    let api_key = endpoint.api_key.ok_or_else(|| {
        anyhow!(
            "no API key for {}; set SCRAPS_API_KEY or add one to {}",
            endpoint.host,
            paths.credentials_file.display()
        )
    })?;
    tracing::debug!(host = %endpoint.host, "resolved endpoint");

    let format = if globals.json {
        OutputFormat::Json
    } else {
        config.effective_output_format()
    };

    Ok(CommandContext {
        paths: paths.clone(),
        config,
        format,
        api: ApiClient::new(endpoint.host, api_key)?,
    })
}

fn parse_branch_ref(reference: &str, branch: Option<String>) -> anyhow::Result<BranchRef> {
    let repo = RepoRef::parse(reference)?.or_branch(branch);
    Ok(repo.require_branch()?)
}

async fn watch(ctx: CommandContext, args: WatchArgs) -> anyhow::Result<()> {
    let repo = RepoRef::parse(&args.reference)?.or_branch(args.branch);
    let watch_cfg = ctx.config.effective_watch();
    let transport_kind = args.transport.map(TransportKind::from).unwrap_or(watch_cfg.transport);

    let options = WatchOptions {
        subscription: Subscription::new(repo.clone(), args.path, args.last_event_id),
        filter: WatchFilter::new(args.filter.as_deref().unwrap_or_default(), args.kinds),
        show_claims: watch_cfg.show_claims && !args.no_claims,
        backoff: Backoff::from_config(&watch_cfg),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let mut printer = SignalPrinter::new(io::stdout(), ctx.format);
    if !io::stdout().is_terminal() {
        printer = printer.without_timestamps();
    }

    let transport = build_transport(transport_kind, &ctx.api);
    let mut session = WatchSession::new(transport, options, printer, cancel);
    if let Ok(branch) = repo.require_branch() {
        let agent_id = generate_agent_id();
        tracing::info!(%branch, agent_id = %agent_id, "watch session identity");
        session = session.with_claims(SessionClaims::new(
            ClaimClient::new(ctx.api.clone()),
            branch,
            agent_id,
        ));
    }

    let commands = (args.interactive || io::stdin().is_terminal()).then(spawn_stdin_reader);
    let report = session.run(commands).await?;
    tracing::info!(
        events = report.events_seen,
        warnings = report.warnings,
        log = %ctx.paths.log_path.display(),
        "watch ended"
    );
    Ok(())
}

async fn claim(ctx: CommandContext, args: ClaimArgs) -> anyhow::Result<()> {
    let branch = parse_branch_ref(&args.reference, args.branch)?;
    let client = ClaimClient::new(ctx.api);
    let outcome = client
        .claim(
            &branch,
            args.patterns.clone(),
            &args.message,
            args.ttl,
            args.agent_id,
        )
        .await
        .with_context(|| format!("claim on {branch}"))?;

    let mut out = io::stdout().lock();
    match ctx.format {
        OutputFormat::Json => {
            let value = claim_json(&args.patterns, &outcome);
            writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        }
        OutputFormat::Table => write!(out, "{}", claim_text(&branch, &args.patterns, &outcome))?,
    }
    out.flush()?;

    match outcome.verdict {
        ClaimVerdict::Granted { .. } => Ok(()),
        ClaimVerdict::Conflict { competitors } => Err(anyhow!(
            "claim conflict: {} existing claim(s) overlap",
            competitors.len()
        )),
    }
}

async fn release(ctx: CommandContext, args: ReleaseArgs) -> anyhow::Result<()> {
    let branch = parse_branch_ref(&args.reference, args.branch)?;
    let client = ClaimClient::new(ctx.api);
    let outcome = client
        .release(&branch, args.patterns.clone(), &args.agent_id)
        .await
        .with_context(|| format!("release on {branch}"))?;

    match ctx.format {
        OutputFormat::Json => println!("{}", release_json(&outcome)),
        OutputFormat::Table => print!("{}", release_text(&branch, &args.patterns, &outcome)),
    }
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn completion(command: CompletionCommand) -> anyhow::Result<()> {
    let shell = match command {
        CompletionCommand::Bash => Shell::Bash,
        CompletionCommand::Fish => Shell::Fish,
        CompletionCommand::Powershell => Shell::PowerShell,
        CompletionCommand::Zsh => Shell::Zsh,
    };

    let mut cmd = Cli::command();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, "scraps", &mut buf);
    match io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write completion script to stdout"),
    }
}
