use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use haven_core::StackTarget;
use std::path::PathBuf;
use std::process::ExitCode;

mod app;
mod commands;

#[derive(Parser)]
#[command(name = "haven")]
#[command(about = "Hub and leaf stack orchestration", long_about = None)]
struct Cli {
    /// Deployment context to act on
    #[arg(short, long, global = true, env = "HAVEN_CONTEXT")]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage deployment contexts
    #[command(subcommand)]
    Context(ContextCommands),

    /// Manage hub and leaf configuration documents
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Plan, apply and tear down stacks
    #[command(subcommand)]
    Stack(StackCommands),

    /// Manage stack secrets
    #[command(subcommand)]
    Secret(SecretCommands),

    /// Run a provisioner command against a stack
    Run {
        /// Which stack to run against
        project_type: ProjectType,

        /// Command line passed to the provisioner
        command: String,

        /// Leaf name (required for leaf stacks)
        #[arg(short, long)]
        leaf_name: Option<String>,
    },
}

#[derive(Subcommand)]
enum ContextCommands {
    /// Register a new context
    Create {
        name: String,

        #[arg(long)]
        subscription_name: String,

        #[arg(long)]
        admin_group_name: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Show one context and its derived names
    Show { name: Option<String> },

    /// List every context
    List,

    /// Change the description or admin group of a context
    Migrate {
        name: Option<String>,

        #[arg(long)]
        admin_group_name: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a starter document
    Template {
        kind: ProjectType,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Publish a local document to the configuration store
    Upload {
        file: PathBuf,

        /// Upload changes without asking
        #[arg(short, long, conflicts_with = "no")]
        yes: bool,

        /// Never upload changes to an existing document
        #[arg(short, long)]
        no: bool,
    },

    /// Print a remote document
    Show {
        kind: ProjectType,

        #[arg(short, long)]
        leaf_name: Option<String>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show what an upload of a local document would change
    Diff { file: PathBuf },
}

#[derive(Subcommand)]
enum StackCommands {
    /// Validate a stack and its prerequisites
    Plan {
        project_type: ProjectType,

        #[arg(short, long)]
        leaf_name: Option<String>,
    },

    /// Deploy a stack from its remote document
    Apply {
        project_type: ProjectType,

        #[arg(short, long)]
        leaf_name: Option<String>,
    },

    /// Check whether a deployed stack's document has changed
    Refresh {
        project_type: ProjectType,

        #[arg(short, long)]
        leaf_name: Option<String>,
    },

    /// Destroy a stack's resources
    Teardown {
        project_type: ProjectType,

        #[arg(short, long)]
        leaf_name: Option<String>,
    },

    /// List every stack of the context
    Status,
}

#[derive(Subcommand)]
enum SecretCommands {
    /// List stored secret names
    List {
        #[arg(long = "stack")]
        project_type: ProjectType,

        #[arg(short, long)]
        leaf_name: Option<String>,
    },

    /// Replace a secret; takes effect on the next apply
    Rotate {
        #[arg(long = "stack")]
        project_type: ProjectType,

        name: String,

        #[arg(short, long)]
        leaf_name: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProjectType {
    Hub,
    Leaf,
}

impl ProjectType {
    fn kind(self) -> haven_core::DocumentKind {
        match self {
            Self::Hub => haven_core::DocumentKind::Hub,
            Self::Leaf => haven_core::DocumentKind::Leaf,
        }
    }
}

/// Resolve a stack target or exit with a usage error.
fn target(project_type: ProjectType, leaf_name: Option<String>) -> StackTarget {
    match (project_type, leaf_name) {
        (ProjectType::Hub, _) => StackTarget::Hub,
        (ProjectType::Leaf, Some(name)) => StackTarget::Leaf(name),
        (ProjectType::Leaf, None) => Cli::command()
            .error(ErrorKind::MissingRequiredArgument, "--leaf-name is required for leaf stacks")
            .exit(),
    }
}

/// The named context or exit with a usage error.
fn require_context(context: Option<String>) -> String {
    context.unwrap_or_else(|| {
        Cli::command()
            .error(ErrorKind::MissingRequiredArgument, "--context (or HAVEN_CONTEXT) is required")
            .exit()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match haven_core::Config::load() {
        Ok(config) => config,
        Err(e) => return fail(e.into()),
    };
    if let Err(e) = haven_core::init_observability(&config.log_level) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(e),
    }
}

fn fail(error: anyhow::Error) -> ExitCode {
    eprintln!("{} {:#}", "Error:".red().bold(), error);
    ExitCode::FAILURE
}

async fn open(config: haven_core::Config, context: Option<String>) -> anyhow::Result<app::App> {
    app::App::open(config, &require_context(context)).await
}

async fn run(cli: Cli, config: haven_core::Config) -> anyhow::Result<()> {
    let context = cli.context;
    match cli.command {
        Commands::Context(command) => match command {
            ContextCommands::Create { name, subscription_name, admin_group_name, description } => {
                commands::context::create(&config, &name, &subscription_name, &admin_group_name, &description)
            }
            ContextCommands::Show { name } => {
                commands::context::show(&config, &name.unwrap_or_else(|| require_context(context)))
            }
            ContextCommands::List => commands::context::list(&config),
            ContextCommands::Migrate { name, admin_group_name, description } => commands::context::migrate(
                &config,
                &name.unwrap_or_else(|| require_context(context)),
                admin_group_name,
                description,
            ),
        },

        Commands::Config(command) => match command {
            ConfigCommands::Template { kind, file } => commands::config::template(kind.kind(), file.as_deref()),
            ConfigCommands::Upload { file, yes, no } => {
                let answer = if yes { Some(true) } else if no { Some(false) } else { None };
                commands::config::upload(&open(config, context).await?, &file, answer).await
            }
            ConfigCommands::Show { kind, leaf_name, file } => {
                let target = target(kind, leaf_name);
                commands::config::show(&open(config, context).await?, &target, file.as_deref()).await
            }
            ConfigCommands::Diff { file } => commands::config::diff(&open(config, context).await?, &file).await,
        },

        Commands::Stack(command) => match command {
            StackCommands::Plan { project_type, leaf_name } => {
                let target = target(project_type, leaf_name);
                commands::stack::plan(&open(config, context).await?, &target).await
            }
            StackCommands::Apply { project_type, leaf_name } => {
                let target = target(project_type, leaf_name);
                commands::stack::apply(&open(config, context).await?, &target).await
            }
            StackCommands::Refresh { project_type, leaf_name } => {
                let target = target(project_type, leaf_name);
                commands::stack::refresh(&open(config, context).await?, &target).await
            }
            StackCommands::Teardown { project_type, leaf_name } => {
                let target = target(project_type, leaf_name);
                commands::stack::teardown(&open(config, context).await?, &target).await
            }
            StackCommands::Status => commands::stack::status(&open(config, context).await?).await,
        },

        Commands::Secret(command) => match command {
            SecretCommands::List { project_type, leaf_name } => {
                let target = target(project_type, leaf_name);
                commands::secret::list(&open(config, context).await?, &target).await
            }
            SecretCommands::Rotate { project_type, name, leaf_name } => {
                let target = target(project_type, leaf_name);
                commands::secret::rotate(&open(config, context).await?, &target, &name).await
            }
        },

        Commands::Run { project_type, command, leaf_name } => {
            let target = target(project_type, leaf_name);
            commands::run::run(&open(config, context).await?, &target, &command).await
        }
    }
}
