//! Command line client for pg-pubsub
//!
//! Publishes to and listens on pg-pubsub topics, and prints the effective
//! layered configuration.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pg_pubsub::{logging, PgPubSub, PubSubConfig, PublishOptions, SubscribeOptions};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pg-pubsub-cli")]
#[command(about = "Publish and listen on PostgreSQL LISTEN/NOTIFY topics")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Application prefix override
    #[arg(long, global = true)]
    app: Option<String>,

    /// Namespace prefix override
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one payload to a topic
    Publish(PublishArgs),
    /// Print notifications for one or more topics until Ctrl-C
    Listen(ListenArgs),
    /// Print the effective configuration as JSON
    ShowConfig,
}

#[derive(Args)]
struct PublishArgs {
    /// Topic, without app and namespace prefix
    topic: String,

    /// Payload text
    payload: String,
}

#[derive(Args)]
struct ListenArgs {
    /// Topics, without app and namespace prefix
    #[arg(required = true)]
    topics: Vec<String>,

    /// Print one JSON object per notification
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct NotificationLine<'a> {
    topic: &'a str,
    payload: std::borrow::Cow<'a, str>,
    received_at: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_structured_logging();
    let cli = Cli::parse();

    let mut config = PubSubConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(app) = cli.app {
        config = config.with_app(app);
    }
    if let Some(namespace) = cli.namespace {
        config = config.with_namespace(namespace);
    }
    config.validate()?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Publish(args) => {
            let pubsub = connect(cli.database_url.as_deref(), config).await?;
            pubsub
                .publish(&args.topic, args.payload.as_bytes(), PublishOptions::new())
                .await?;
            println!("Published to {}", pubsub.config().format_topic(&args.topic));
            pubsub.close().await?;
        }
        Commands::Listen(args) => {
            let pubsub = connect(cli.database_url.as_deref(), config).await?;
            listen(&pubsub, args).await?;
            pubsub.close().await?;
        }
    }

    Ok(())
}

async fn connect(database_url: Option<&str>, config: PubSubConfig) -> anyhow::Result<PgPubSub> {
    let url = database_url.context("--database-url or DATABASE_URL is required")?;
    Ok(PgPubSub::connect(url, config).await?)
}

async fn listen(pubsub: &PgPubSub, args: ListenArgs) -> anyhow::Result<()> {
    let (first, rest) = args
        .topics
        .split_first()
        .context("at least one topic is required")?;
    let options = SubscribeOptions::new().with_topics(rest.iter().cloned());
    let (subscription, mut notifications) = pubsub.subscribe_channel(first, options).await?;

    eprintln!("Listening on {}", subscription.topics().join(", "));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = notifications.recv() => {
                let Some(notification) = received else { break };
                if args.json {
                    let line = NotificationLine {
                        topic: &notification.topic,
                        payload: String::from_utf8_lossy(&notification.payload),
                        received_at: chrono::Utc::now().to_rfc3339(),
                    };
                    println!("{}", serde_json::to_string(&line)?);
                } else {
                    println!(
                        "{}: {}",
                        notification.topic,
                        String::from_utf8_lossy(&notification.payload)
                    );
                }
            }
        }
    }

    subscription.close()?;
    Ok(())
}
