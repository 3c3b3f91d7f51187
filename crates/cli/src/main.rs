//! JARVIS CLI: the main entry point.
//!
//! Commands:
//! - `chat`     Interactive or single-message chat
//! - `memory`   Add, search, preview and delete memories
//! - `prefs`    Read and write preferences
//! - `profile`  Show and edit the user profile
//! - `models`   Model tier status
//! - `config`   Print the effective configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "jarvis",
    about = "JARVIS, a local AI assistant with persistent memory",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Print tokens and thoughts as they are generated
        #[arg(long)]
        stream: bool,
    },

    /// Manage memories
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },

    /// Manage preferences
    Prefs {
        #[command(subcommand)]
        command: PrefsCommands,
    },

    /// Manage the user profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Inspect model tiers
    Models {
        #[command(subcommand)]
        command: ModelsCommands,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Remember something
    Add {
        content: String,
        #[arg(short, long, default_value = "general")]
        category: String,
        /// 0 (trivial) to 10 (critical)
        #[arg(short, long, default_value_t = 5)]
        importance: i32,
    },
    /// Search memories by relevance
    Search {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
    /// Show the memory digest a query would put into the prompt
    Context { query: String },
    /// Forget one memory by id
    Delete { id: i64 },
    /// Show store statistics and the most important memories
    Stats,
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Set a preference
    Set {
        category: String,
        key: String,
        value: String,
    },
    /// List all preferences
    List,
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the user profile
    Show,
    /// Set the user's name
    SetName { name: String },
    /// Add a fact about the user
    AddFact { fact: String },
}

#[derive(Subcommand)]
enum ModelsCommands {
    /// Load configured models and report each tier
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat { message, stream } => commands::chat::run(message, stream).await?,
        Commands::Memory { command } => match command {
            MemoryCommands::Add {
                content,
                category,
                importance,
            } => commands::memory::add(&content, &category, importance).await?,
            MemoryCommands::Search { query, limit } => commands::memory::search(&query, limit).await?,
            MemoryCommands::Context { query } => commands::memory::context(&query).await?,
            MemoryCommands::Delete { id } => commands::memory::delete(id).await?,
            MemoryCommands::Stats => commands::memory::stats().await?,
        },
        Commands::Prefs { command } => match command {
            PrefsCommands::Set {
                category,
                key,
                value,
            } => commands::prefs::set(&category, &key, &value).await?,
            PrefsCommands::List => commands::prefs::list().await?,
        },
        Commands::Profile { command } => match command {
            ProfileCommands::Show => commands::profile::show().await?,
            ProfileCommands::SetName { name } => commands::profile::set_name(&name).await?,
            ProfileCommands::AddFact { fact } => commands::profile::add_fact(&fact).await?,
        },
        Commands::Models { command } => match command {
            ModelsCommands::Status { json } => commands::models::status(json).await?,
        },
        Commands::Config => commands::config_cmd::show()?,
    }

    Ok(())
}
