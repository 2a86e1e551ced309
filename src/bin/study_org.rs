use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use study_organizer::app::{App, CancelToken, OrganizeOptions};
use study_organizer::catalog::Catalog;
use study_organizer::config::ConfigLoader;
use study_organizer::error::StudyError;
use study_organizer::git::SystemGit;
use study_organizer::output::{JsonOutput, LogProgress};
use study_organizer::store::Layout;

#[derive(Parser)]
#[command(name = "study-org")]
#[command(about = "Organize dataset repositories into study repositories without cloning them")]
#[command(version, author)]
struct Cli {
    /// Top-level repository (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Link discovered datasets into study repositories")]
    Organize(OrganizeArgs),
    #[command(about = "Show the lifecycle state of every study")]
    Status(DescriptorArgs),
    #[command(about = "List derivatives that could not be organized")]
    Unresolved,
}

#[derive(Args)]
struct OrganizeArgs {
    /// Study id globs to organize, e.g. `study-ds0000*`.
    targets: Vec<String>,

    #[command(flatten)]
    descriptors: DescriptorArgs,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    allow_relink: bool,
}

#[derive(Args)]
struct DescriptorArgs {
    /// Discovery output; defaults to `.study-org/discovered-datasets.json`.
    #[arg(long)]
    descriptors: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<StudyError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &StudyError) -> u8 {
    match error {
        StudyError::ConfigRead(_)
        | StudyError::ConfigParse(_)
        | StudyError::InvalidConfig(_)
        | StudyError::InvalidTarget(_)
        | StudyError::DescriptorRead { .. }
        | StudyError::RegistryRead(_)
        | StudyError::MissingTool(_)
        | StudyError::RepositoryInitialization { .. } => 2,
        StudyError::AllStudiesFailed { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let layout = match cli.root {
        Some(root) => Layout::new(root),
        None => Layout::current()?,
    };
    let mut config = ConfigLoader::resolve(cli.config.as_deref(), &layout.config_path())?;

    match cli.command {
        Commands::Organize(args) => {
            if let Some(workers) = args.workers {
                if workers == 0 {
                    return Err(
                        StudyError::InvalidConfig("--workers must be at least 1".to_string())
                            .into(),
                    );
                }
                config.workers = workers;
            }
            let git = SystemGit::new(config.committer.clone());
            if !git.is_available() {
                return Err(StudyError::MissingTool("git".to_string()).into());
            }
            let catalog = load_catalog(&layout, &args.descriptors)?;
            let app = App::new(layout, config, git);
            let options = OrganizeOptions {
                dry_run: args.dry_run,
                allow_relink: args.allow_relink,
                targets: args.targets,
            };
            let result = app.organize(&catalog, &options, &LogProgress, &CancelToken::default())?;
            JsonOutput::print_organize(&result).into_diagnostic()?;
        }
        Commands::Status(args) => {
            let git = SystemGit::new(config.committer.clone());
            let catalog = load_catalog(&layout, &args)?;
            let app = App::new(layout, config, git);
            let result = app.status(&catalog)?;
            JsonOutput::print_status(&result).into_diagnostic()?;
        }
        Commands::Unresolved => {
            let git = SystemGit::new(config.committer.clone());
            let app = App::new(layout, config, git);
            let result = app.unresolved()?;
            JsonOutput::print_unresolved(&result).into_diagnostic()?;
        }
    }
    Ok(())
}

fn load_catalog(layout: &Layout, args: &DescriptorArgs) -> Result<Catalog, StudyError> {
    let path = args
        .descriptors
        .clone()
        .unwrap_or_else(|| layout.descriptors_path());
    Catalog::load(&path)
}
