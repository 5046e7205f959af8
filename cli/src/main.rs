use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox_atproto::{AtProtoOAuthProvider, SqliteAuthStore, XrpcAgentFactory};
use sandbox_session::{
    BootstrapError, Collaborators, HttpMetadataSource, Page, RecordRef, SessionController,
    StoredRecord,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

mod config;
mod page;
mod web;

use config::Config;
use page::TerminalPage;

#[derive(Parser)]
#[command(name = "sandbox")]
#[command(about = "ATProto OAuth sandbox - sign in, inspect the session and store a record", long_about = None)]
struct Cli {
    /// Config file to use instead of discovery
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the page and show the session state
    Status {
        /// URL the authorization server redirected to, to finish a sign-in
        #[arg(long)]
        callback_url: Option<Url>,
    },
    /// Start signing in and print the authorization URL
    Login {
        /// Handle (e.g., will.bsky.social), DID or server URL
        handle: String,
    },
    /// Sign the current session out
    Logout,
    #[command(subcommand)]
    Record(RecordCommands),
    /// Serve the page over HTTP
    Serve {
        /// Listen address (defaults to the config's `listen`)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Write the test record
    Put {
        /// Text stored in the record
        text: String,
    },
    /// Read the test record back
    Get,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::loader::load_from_file(path)?,
        None => config::loader::load_with_discovery()?,
    };

    let collaborators = build_collaborators(&config).await?;

    match cli.command {
        Commands::Status { callback_url } => status(&config, collaborators, callback_url).await?,
        Commands::Login { handle } => login(&config, collaborators, &handle).await?,
        Commands::Logout => logout(&config, collaborators).await?,
        Commands::Record(record_cmd) => match record_cmd {
            RecordCommands::Put { text } => {
                put_record(&config, collaborators, terminal(), text).await?;
            }
            RecordCommands::Get => {
                get_record(&config, collaborators, terminal()).await?;
            }
        },
        Commands::Serve { listen } => serve(&config, collaborators, listen).await?,
    }

    Ok(())
}

async fn build_collaborators(config: &Config) -> Result<Collaborators> {
    let store_path = config.store_path.to_str().with_context(|| {
        format!("store_path is not valid UTF-8: {}", config.store_path.display())
    })?;
    let store = SqliteAuthStore::new(store_path).await?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("sandbox/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    Ok(Collaborators {
        metadata: Arc::new(HttpMetadataSource::new(http_client.clone())),
        oauth: Arc::new(AtProtoOAuthProvider::new(store, http_client.clone())),
        agents: Arc::new(XrpcAgentFactory::new(http_client)),
    })
}

fn terminal() -> Box<dyn Page> {
    Box::new(TerminalPage::default())
}

/// Bootstrap against the page URL, or `location` when given.
async fn load_page(
    config: &Config,
    collaborators: Collaborators,
    page: Box<dyn Page>,
    location: Option<Url>,
) -> Result<SessionController> {
    let mut controller = SessionController::new(config.controller_settings()?, collaborators, page);
    let location = match location {
        Some(location) => location,
        None => config.page_url()?,
    };
    controller.bootstrap(&location).await?;
    Ok(controller)
}

async fn status(config: &Config, collaborators: Collaborators, callback_url: Option<Url>) -> Result<()> {
    let mut controller = load_page(config, collaborators, terminal(), callback_url).await?;
    controller.drain_background().await;

    match controller.subject() {
        Some(subject) => println!("✓ Signed in as {}", subject),
        None => println!("Not signed in. Run `sandbox login <handle>` to start."),
    }
    Ok(())
}

async fn login(config: &Config, collaborators: Collaborators, handle: &str) -> Result<()> {
    let mut controller = load_page(config, collaborators, terminal(), None).await?;
    if let Some(subject) = controller.subject() {
        println!("Already signed in as {}. Run `sandbox logout` first.", subject);
        return Ok(());
    }

    if controller.login(handle).await?.is_some() {
        println!();
        println!("After approving, pass the address you are sent back to:");
        println!("  sandbox status --callback-url '<redirected URL>'");
    }
    Ok(())
}

async fn logout(config: &Config, collaborators: Collaborators) -> Result<()> {
    let mut controller = load_page(config, collaborators, terminal(), None).await?;
    if controller.subject().is_none() {
        println!("Not signed in.");
        return Ok(());
    }
    controller.logout().await?;
    println!("✓ Signed out");
    Ok(())
}

async fn put_record(
    config: &Config,
    collaborators: Collaborators,
    page: Box<dyn Page>,
    text: String,
) -> Result<RecordRef> {
    let mut controller = load_page(config, collaborators, page, None).await?;
    if !controller.is_authenticated() {
        return Err(BootstrapError::NotAuthenticated.into());
    }

    let record = serde_json::json!({
        "$type": config.record.collection,
        "text": text,
    });
    let saved = controller
        .save_record(&config.record.collection, &config.record.rkey, record)
        .await;
    // Finish the search started by bootstrap.
    controller.drain_background().await;
    let saved = saved?;

    println!("✓ Record saved");
    println!("  URI: {}", saved.uri);
    println!("  CID: {}", saved.cid);
    Ok(saved)
}

async fn get_record(
    config: &Config,
    collaborators: Collaborators,
    page: Box<dyn Page>,
) -> Result<Option<StoredRecord>> {
    let mut controller = load_page(config, collaborators, page, None).await?;
    if !controller.is_authenticated() {
        return Err(BootstrapError::NotAuthenticated.into());
    }

    let record = controller
        .read_record(&config.record.collection, &config.record.rkey)
        .await;
    controller.drain_background().await;

    match record? {
        Some(record) => {
            println!("{}", record.uri);
            println!(
                "{}",
                serde_json::to_string_pretty(&record.value).context("Failed to format record")?
            );
            Ok(Some(record))
        }
        None => {
            println!("No record saved yet. Run `sandbox record put <text>`.");
            Ok(None)
        }
    }
}

async fn serve(config: &Config, collaborators: Collaborators, listen: Option<SocketAddr>) -> Result<()> {
    let addr = listen.unwrap_or(config.listen);
    let state = Arc::new(web::WebState {
        settings: config.controller_settings()?,
        collaborators,
        page_url: Url::parse(&format!("http://{}/", addr)).context("Invalid listen address")?,
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Sandbox page listening on http://{}", addr);

    axum::serve(listener, web::router(state))
        .await
        .context("Server error")?;
    Ok(())
}
