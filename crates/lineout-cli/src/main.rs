use anyhow::Result;
use clap::{Parser, Subcommand};

mod admin_client;
mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "lineout")]
#[command(about = "Team documents from Google Drive, searchable.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon health, sync cursor and watch channels
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sync the Drive tree into the document store
    Sync {
        /// Drain pending Drive changes instead of a full rescan
        #[arg(long)]
        changes: bool,
    },

    /// Walk the Drive tree without indexing
    Discover,

    /// Search indexed documents
    Search {
        /// Free-text query
        #[arg(value_name = "QUERY")]
        query: Vec<String>,

        /// Require a tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Require a player mention (repeatable)
        #[arg(long = "player")]
        players: Vec<String>,

        /// Highest access level to include (public, team, coaches, admin)
        #[arg(long)]
        access: Option<String>,

        /// Number of results
        #[arg(long, short = 'n', default_value = "10")]
        size: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask the team assistant
    Ask {
        #[arg(value_name = "TEXT", required = true)]
        text: Vec<String>,

        /// Continue an earlier conversation
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Manage Drive push notification channels
    Watch {
        #[command(subcommand)]
        command: WatchCommand,
    },

    /// Rebuild the search index from stored documents
    Reindex,

    /// Upload a local text file to Drive and index it
    Upload {
        #[arg(value_name = "PATH")]
        path: std::path::PathBuf,

        /// Drive file name (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,

        /// Parent folder id (defaults to the watched root)
        #[arg(long)]
        folder: Option<String>,

        /// Replace the content of an existing Drive file
        #[arg(long = "file-id")]
        file_id: Option<String>,
    },

    /// Authorize Lineout against Google Drive and Calendar
    Auth,
}

#[derive(Subcommand)]
enum WatchCommand {
    /// Register a changes channel, or a file channel with --file
    Start {
        #[arg(long)]
        file: Option<String>,
    },
    /// Stop the changes channel, or a specific channel with --channel
    Stop {
        #[arg(long)]
        channel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // debug logs stay hidden unless RUST_LOG asks for them
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status { json } => commands::status::run(json).await,
        Commands::Sync { changes } => commands::sync::run(changes).await,
        Commands::Discover => commands::sync::discover().await,
        Commands::Search {
            query,
            tags,
            players,
            access,
            size,
            json,
        } => {
            let args = commands::search::SearchArgs {
                query: query.join(" "),
                tags,
                players,
                access,
                size,
            };
            commands::search::run(args, json).await
        }
        Commands::Ask { text, conversation } => {
            commands::ask::run(&text.join(" "), conversation).await
        }
        Commands::Watch { command } => match command {
            WatchCommand::Start { file } => commands::watch::start(file).await,
            WatchCommand::Stop { channel } => commands::watch::stop(channel).await,
        },
        Commands::Reindex => commands::sync::reindex().await,
        Commands::Upload {
            path,
            name,
            folder,
            file_id,
        } => commands::upload::run(&path, name, folder, file_id).await,
        Commands::Auth => commands::auth::run().await,
    }
}
