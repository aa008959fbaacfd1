use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use jazzsync::checkin::{changes_page_url, ensure_checkin_target};
use jazzsync::{
    detect_changes, AuthenticatingTransport, CheckinCoordinator, CheckinOutcome, Credentials,
    HttpScmService, JazzIgnore, LoadOptions, LoadTarget, MetadataStore, Sandbox, SandboxLoader,
    Settings, SharedIgnore,
};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "jazzsync",
    about = "Mirror a remote SCM stream or workspace into a local sandbox and check changes back in",
    version
)]
struct Cli {
    /// Verbose logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SCM server base URL
    #[arg(long, global = true, value_name = "url")]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a stream or workspace into a sandbox
    Load(LoadArgs),

    /// Show local changes
    Status(SandboxArgs),

    /// Check local changes in to the sandbox's workspace
    Checkin(SandboxArgs),
}

#[derive(Debug, Args)]
struct SandboxArgs {
    /// Sandbox directory (default: nearest sandbox above the current directory)
    #[arg(long, value_name = "path")]
    sandbox: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Project, e.g. "owner | project"; omit to reload the sandbox's current target
    #[arg(value_name = "project")]
    project: Option<String>,

    #[command(flatten)]
    sandbox: SandboxArgs,

    /// Stream or workspace name (default: "<project> Stream" / "<project> Workspace")
    #[arg(long, value_name = "name")]
    stream: Option<String>,

    /// Load a personal repository workspace, creating it if needed
    #[arg(long)]
    workspace: bool,

    #[arg(long, value_name = "id")]
    user_id: Option<String>,

    /// Delete conflicting local content instead of backing it up
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let layer = fmt::layer().compact().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(layer).with(filter).init();

    if let Err(error) = run(cli).await {
        error!("{error:#}");
        exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(server) = &cli.server {
        settings.server_url = server.clone();
    }

    match cli.command {
        Command::Load(args) => run_load(args, settings, cli.server.is_some()).await,
        Command::Status(args) => run_status(args),
        Command::Checkin(args) => run_checkin(args, settings, cli.server.is_some()).await,
    }
}

async fn run_load(args: LoadArgs, settings: Settings, server_flag: bool) -> Result<()> {
    let sandbox = match &args.sandbox.sandbox {
        Some(path) => Sandbox::create(path)?,
        None => Sandbox::discover(std::env::current_dir()?)?,
    };

    let user_id = args.user_id.clone().or_else(|| settings.user_id.clone());
    let (target, base_url) = match &args.project {
        Some(project) => {
            let target = LoadTarget {
                project: project.clone(),
                name: args.stream.clone(),
                workspace: args.workspace,
                user_id: user_id.clone(),
                resolved: None,
            };
            if target.workspace && target.user_id.is_none() {
                bail!("--user-id is required to load a workspace");
            }
            (target, settings.server_url.clone())
        }
        None => {
            let store = MetadataStore::load(&sandbox.metadata_path())?;
            let target = LoadTarget::from_metadata(store.metadata())?;
            let recorded = &store.metadata().ccm_base_url;
            let base_url = if server_flag || recorded.is_empty() {
                settings.server_url.clone()
            } else {
                recorded.clone()
            };
            (target, base_url)
        }
    };

    // Streams allow guest access; only prompt when a workspace needs it
    let credentials = match &target.user_id {
        Some(user) if target.workspace => Some(credentials_for(user, &settings)?),
        Some(user) => settings
            .password
            .as_ref()
            .map(|password| Credentials::new(user, password)),
        None => None,
    };

    let service = build_service(&base_url, credentials, &settings)?;
    let ignore: SharedIgnore = Arc::new(JazzIgnore::new(sandbox.root()));
    let loader = SandboxLoader::new(&service, &sandbox, ignore);
    let summary = loader
        .load(
            &target,
            LoadOptions {
                force: args.force,
            },
        )
        .await
        .with_context(|| format!("Failed to load {}", target.project))?;

    println!(
        "Loaded {} files and {} folders into {}",
        summary.files,
        summary.directories,
        sandbox.root().display()
    );
    if summary.backed_up > 0 {
        println!(
            "{} {} local entries were moved to {}",
            "Note:".yellow().bold(),
            summary.backed_up,
            sandbox.backup_path().display()
        );
    }
    Ok(())
}

fn run_status(args: SandboxArgs) -> Result<()> {
    let sandbox = open_sandbox(args.sandbox.as_deref())?;
    let store = MetadataStore::load(&sandbox.metadata_path())?;
    let ignore: SharedIgnore = Arc::new(JazzIgnore::new(sandbox.root()));
    let changes = detect_changes(&sandbox, store.records(), &ignore)?;

    if changes.unchanged() {
        println!("Sandbox is unchanged");
        return Ok(());
    }

    for path in changes.added.keys() {
        println!("{} {}", "A".green().bold(), path.display());
    }
    for (path, modification) in &changes.modified {
        let note = if modification.kind_changed() {
            " (type changed)"
        } else {
            ""
        };
        println!("{} {}{}", "M".yellow().bold(), path.display(), note);
    }
    for path in changes.deleted.keys() {
        println!("{} {}", "D".red().bold(), path.display());
    }
    println!(
        "{} added, {} modified, {} deleted",
        changes.added.len(),
        changes.modified.len(),
        changes.deleted.len()
    );
    Ok(())
}

async fn run_checkin(args: SandboxArgs, settings: Settings, server_flag: bool) -> Result<()> {
    let sandbox = open_sandbox(args.sandbox.as_deref())?;
    let metadata = MetadataStore::load(&sandbox.metadata_path())?
        .metadata()
        .clone();
    ensure_checkin_target(&metadata)?;

    let user_id = if metadata.user_id.is_empty() {
        settings
            .user_id
            .clone()
            .context("No user id recorded in the sandbox or configured")?
    } else {
        metadata.user_id.clone()
    };
    let base_url = if server_flag || metadata.ccm_base_url.is_empty() {
        settings.server_url.clone()
    } else {
        metadata.ccm_base_url.clone()
    };

    let credentials = credentials_for(&user_id, &settings)?;
    let service = build_service(&base_url, Some(credentials), &settings)?;
    let ignore: SharedIgnore = Arc::new(JazzIgnore::new(sandbox.root()));
    let coordinator = CheckinCoordinator::new(&service, &sandbox, ignore)
        .with_concurrency(settings.upload_concurrency);

    match coordinator.checkin().await.context("Check-in failed")? {
        CheckinOutcome::Unchanged => println!("Sandbox is unchanged, nothing checked in"),
        CheckinOutcome::Completed(summary) => {
            println!(
                "{} {} modified, {} added, {} deleted",
                "Check-in complete:".green().bold(),
                summary.modified,
                summary.added,
                summary.deleted
            );
            if let Some(url) = changes_page_url(&base_url, &user_id, &metadata.project_name) {
                println!("Visit the following URL to deliver your changes to the rest of the team:");
                println!("{}", url);
            }
        }
    }
    Ok(())
}

fn open_sandbox(path: Option<&Path>) -> Result<Sandbox> {
    let sandbox = match path {
        Some(path) => Sandbox::open(path)?,
        None => Sandbox::discover(std::env::current_dir()?)?,
    };
    Ok(sandbox)
}

fn credentials_for(user_id: &str, settings: &Settings) -> Result<Credentials> {
    let password = match &settings.password {
        Some(password) => password.clone(),
        None => inquire::Password::new(&format!("Password for {}:", user_id))
            .without_confirmation()
            .prompt()
            .context("Failed to read password")?,
    };
    Ok(Credentials::new(user_id, password))
}

fn build_service(
    base_url: &str,
    credentials: Option<Credentials>,
    settings: &Settings,
) -> Result<HttpScmService> {
    let transport = AuthenticatingTransport::new(base_url, credentials, settings.timeout())?;
    Ok(HttpScmService::new(transport))
}
