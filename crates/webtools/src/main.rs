use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use webtools_core::cache::SqliteCache;
use webtools_core::form::{SETTINGS_RIGHT, Viewer};
use webtools_core::hooks::{HostEvent, WebTools};
use webtools_core::migrate::{pending_migration_count, run_migrations};
use webtools_core::output::HeadBuffer;
use webtools_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};

#[derive(Debug, Parser)]
#[command(
    name = "webtools",
    version,
    about = "Manage analytics and social metadata settings for a MediaWiki site"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Db(DbArgs),
    Settings(SettingsArgs),
    Meta(MetaArgs),
    Head(HeadArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    #[command(about = "Delete expired metadata cache rows")]
    Purge,
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[command(subcommand)]
    command: SettingsSubcommand,
}

#[derive(Debug, Subcommand)]
enum SettingsSubcommand {
    Show {
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Describe the admin form fields")]
    Fields,
    #[command(about = "Submit KEY=VALUE pairs through the admin form")]
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        assignments: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct MetaArgs {
    #[command(subcommand)]
    command: MetaSubcommand,
}

#[derive(Debug, Subcommand)]
enum MetaSubcommand {
    Resolve {
        title: String,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Refresh cached description/image as if the page was just saved")]
    Regenerate { title: String },
}

#[derive(Debug, Args)]
struct HeadArgs {
    #[command(subcommand)]
    command: HeadSubcommand,
}

#[derive(Debug, Subcommand)]
enum HeadSubcommand {
    Render { title: String },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Purge => run_db_purge(&runtime),
        },
        Some(Commands::Settings(SettingsArgs { command })) => match command {
            SettingsSubcommand::Show { json } => run_settings_show(&runtime, json),
            SettingsSubcommand::Fields => run_settings_fields(&runtime),
            SettingsSubcommand::Set { assignments } => run_settings_set(&runtime, &assignments),
        },
        Some(Commands::Meta(MetaArgs { command })) => match command {
            MetaSubcommand::Resolve { title, json } => run_meta_resolve(&runtime, &title, json),
            MetaSubcommand::Regenerate { title } => run_meta_regenerate(&runtime, &title),
        },
        Some(Commands::Head(HeadArgs { command })) => match command {
            HeadSubcommand::Render { title } => run_head_render(&runtime, &title),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WEBTOOLS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized webtools runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    println!("next: webtools db migrate");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    if let Some(bytes) = status.db_size_bytes {
        println!("db_size_bytes: {bytes}");
    }
    println!("pending_migrations: {}", pending_migration_count(&paths)?);
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;
    if report.applied.is_empty() {
        println!("Database is up to date (version {})", report.current_version);
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
        println!("current_version: {}", report.current_version);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_purge(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let removed = SqliteCache::new(&paths.db_path).purge_expired()?;
    println!("purged_expired_entries: {removed}");
    Ok(())
}

fn run_settings_show(runtime: &RuntimeOptions, json: bool) -> Result<()> {
    let tools = open_webtools(runtime)?;
    let values = tools.settings().get_values();
    if json {
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }
    for (key, value) in values.iter() {
        match value {
            Some(value) => println!("{}: {}", key.as_str(), value.replace('\n', "\\n")),
            None => println!("{}: <null>", key.as_str()),
        }
    }
    Ok(())
}

fn run_settings_fields(runtime: &RuntimeOptions) -> Result<()> {
    let tools = open_webtools(runtime)?;
    let fields = tools.form().open(&operator())?;
    println!("{}", serde_json::to_string_pretty(&fields)?);
    Ok(())
}

fn run_settings_set(runtime: &RuntimeOptions, assignments: &[String]) -> Result<()> {
    let tools = open_webtools(runtime)?;
    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let Some((key, value)) = assignment.split_once('=') else {
            bail!("expected KEY=VALUE, got `{assignment}`");
        };
        pairs.push((key.trim(), value));
    }
    let report = tools.form().submit(&operator(), pairs)?;
    for key in &report.stored {
        println!("stored: {}", key.as_str());
    }
    for key in &report.dropped {
        println!("ignored: {key}");
    }
    Ok(())
}

fn run_meta_resolve(runtime: &RuntimeOptions, title: &str, json: bool) -> Result<()> {
    let tools = open_webtools(runtime)?;
    let page = tools.page(title);
    let tags = tools.resolver().resolve(&page);
    if json {
        println!("{}", serde_json::to_string_pretty(&tags)?);
        return Ok(());
    }
    if tags.is_empty() {
        println!("<no tags: open graph output is disabled>");
    }
    for (name, content) in tags.iter() {
        println!("{name}: {content}");
    }
    Ok(())
}

fn run_meta_regenerate(runtime: &RuntimeOptions, title: &str) -> Result<()> {
    let tools = open_webtools(runtime)?;
    let page = tools.page(title);
    let summary = tools.on_page_save_complete(&page.page_id)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_head_render(runtime: &RuntimeOptions, title: &str) -> Result<()> {
    let tools = open_webtools(runtime)?;
    let page = tools.page(title);
    let mut head = HeadBuffer::default();
    tools.handle(HostEvent::BeforePageDisplay {
        page: &page,
        out: &mut head,
    });
    println!("{}", head.render());
    Ok(())
}

fn open_webtools(runtime: &RuntimeOptions) -> Result<WebTools> {
    let paths = resolve_runtime_paths(runtime)?;
    print_diagnostics(runtime, &paths);
    WebTools::from_paths(&paths)
}

/// Whoever runs the CLI has shell access to the database, so acts as a manager.
fn operator() -> Viewer {
    Viewer::new("cli", &[SETTINGS_RIGHT])
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
