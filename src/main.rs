use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use shardgate::config::{Config, ConfigError, LoggingConfig};
use shardgate::transport::store::ShardStore;
use shardgate::{
    Document, Filter, KeyBound, KeyRange, Router, ShardServer, TcpShardConnector, WriteOutcome,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardgate")]
#[command(about = "A failure-tolerant query router for sharded document stores")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shard server backed by an in-memory store
    Shard {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Listen address, overriding the configuration
        #[arg(short, long)]
        listen: Option<String>,
        /// Reject writes routed with a partition map older than this version
        #[arg(long)]
        min_routing_version: Option<u64>,
    },
    /// Print the partition map the router would use
    Routes {
        #[arg(short, long, default_value = "config/shardgate.toml")]
        config: PathBuf,
    },
    /// Run a read through the router
    Find {
        #[arg(short, long, default_value = "config/shardgate.toml")]
        config: PathBuf,
        /// Namespace as <database>.<collection>
        namespace: String,
        /// Match one shard key
        #[arg(long, conflicts_with_all = ["min", "max", "field"])]
        key: Option<i64>,
        /// Inclusive lower shard-key bound
        #[arg(long)]
        min: Option<i64>,
        /// Exclusive upper shard-key bound
        #[arg(long)]
        max: Option<i64>,
        /// Match a field against --value
        #[arg(long, requires = "value")]
        field: Option<String>,
        /// JSON value for --field; bare words are taken as strings
        #[arg(long)]
        value: Option<String>,
    },
    /// Insert one JSON document through the router and report its acknowledgment
    Insert {
        #[arg(short, long, default_value = "config/shardgate.toml")]
        config: PathBuf,
        /// Namespace as <database>.<collection>
        namespace: String,
        /// Document as a JSON object
        document: String,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Shard {
            config,
            listen,
            min_routing_version,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => Config::default(),
            };
            init_logging(&config.logging)?;
            run_shard(config, listen, min_routing_version).await?;
        }
        Commands::Routes { config } => {
            let config = load_config(&config)?;
            init_logging(&config.logging)?;
            show_routes(&config).await?;
        }
        Commands::Find {
            config,
            namespace,
            key,
            min,
            max,
            field,
            value,
        } => {
            let config = load_config(&config)?;
            init_logging(&config.logging)?;
            let filter = build_filter(key, min, max, field, value)?;
            run_find(&config, &namespace, &filter).await?;
        }
        Commands::Insert {
            config,
            namespace,
            document,
        } => {
            let config = load_config(&config)?;
            init_logging(&config.logging)?;
            let document: Document =
                serde_json::from_str(&document).context("Document must be a JSON object")?;
            run_insert(&config, &namespace, document).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    Config::load_from_file(path).with_context(|| format!("Failed to load config from {:?}", path))
}

async fn build_router(config: &Config) -> anyhow::Result<Router> {
    let connector = Arc::new(TcpShardConnector::new(config.router.tcp_keepalive()));
    let router = Router::from_config(config, connector);
    let version = router
        .refresh()
        .await
        .context("Failed to load the partition map")?;
    info!("Router ready with partition map version {}", version);
    Ok(router)
}

async fn run_shard(
    config: Config,
    listen: Option<String>,
    min_routing_version: Option<u64>,
) -> anyhow::Result<()> {
    let listen_addr = listen.unwrap_or_else(|| config.server.listen_addr.clone());
    let store = Arc::new(ShardStore::new());
    if let Some(version) = min_routing_version {
        store.require_routing_version(version);
    }

    let server = ShardServer::new(store);
    let listener = server
        .bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!(
        "Starting shard {} (shardgate v{})",
        config.server.shard_id,
        env!("CARGO_PKG_VERSION")
    );

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shard {} shutting down", config.server.shard_id);
        }
    }
    Ok(())
}

async fn show_routes(config: &Config) -> anyhow::Result<()> {
    let router = build_router(config).await?;
    let map = router.directory().snapshot().await?;

    println!("Partition map version {}", map.version());
    println!("Shards:");
    for shard in map.shards() {
        println!("  {}  {}", shard.id, shard.endpoint);
    }
    println!("Databases:");
    for (name, primary) in map.databases() {
        println!("  {}  primary {}", name, primary);
    }
    println!("Sharded collections:");
    for namespace in map.sharded_namespaces() {
        println!("  {}  key {}", namespace, map.shard_key(namespace).unwrap_or("_id"));
        for chunk in map.chunks(namespace).unwrap_or_default() {
            println!("    {} -> {}", chunk.range, chunk.shard);
        }
    }
    Ok(())
}

fn build_filter(
    key: Option<i64>,
    min: Option<i64>,
    max: Option<i64>,
    field: Option<String>,
    value: Option<String>,
) -> anyhow::Result<Filter> {
    if let Some(key) = key {
        return Ok(Filter::KeyEq { key });
    }
    if min.is_some() || max.is_some() {
        if field.is_some() {
            bail!("--field cannot be combined with --min/--max");
        }
        let range = KeyRange::new(
            min.map_or(KeyBound::MinKey, KeyBound::Value),
            max.map_or(KeyBound::MaxKey, KeyBound::Value),
        );
        return Ok(Filter::KeyRange { range });
    }
    match (field, value) {
        (Some(field), Some(value)) => {
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            Ok(Filter::FieldEq { field, value })
        }
        (Some(_), None) => Err(anyhow!("--field requires --value")),
        _ => Ok(Filter::All),
    }
}

async fn run_find(config: &Config, namespace: &str, filter: &Filter) -> anyhow::Result<()> {
    let router = build_router(config).await?;
    let session = router.open_session().await;
    let result = router.route_read(&session, namespace, filter).await;
    router.close_session(&session).await;

    let result = result?;
    for document in &result.documents {
        println!("{}", serde_json::to_string(document)?);
    }
    for failure in &result.failures {
        let hint = if failure.error.is_recoverable() {
            " (may succeed if retried)"
        } else {
            ""
        };
        eprintln!(
            "shard {} did not answer: {}{}",
            failure.shard, failure.error, hint
        );
    }
    if result.is_partial() {
        eprintln!(
            "Partial result: {} of the targeted shards failed",
            result.failures.len()
        );
    }
    Ok(())
}

async fn run_insert(config: &Config, namespace: &str, document: Document) -> anyhow::Result<()> {
    let router = build_router(config).await?;
    let session = router.open_session().await;

    if let Err(e) = router.route_write(&session, namespace, document).await {
        eprintln!("Write was not handed off: {}", e);
    }
    let target = session.last_write().await.map(|w| w.shard().clone());
    let outcome = router.ack_last_write(&session).await;
    router.close_session(&session).await;

    let outcome = outcome?;
    let target = target.ok_or_else(|| anyhow!("no write was tracked"))?;
    if let WriteOutcome::Unknown { reason } = &outcome {
        eprintln!("The write may or may not be applied: {}", reason);
    }
    outcome
        .into_result(&target)
        .context("Write not acknowledged")?;
    println!("Success on shard {}", target);
    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Start one shard per [[metadata.shards]] entry, then run:");
    println!("  shardgate routes --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!(
                "  Timeouts: connect {}ms, operation {}ms, session {}s",
                config.router.connect_timeout_ms,
                config.router.operation_timeout_ms,
                config.router.session_timeout_sec
            );
            match &config.metadata.file {
                Some(file) => println!("  Metadata file: {:?}", file),
                None => {
                    println!("  Shards: {}", config.metadata.shards.len());
                    for (i, shard) in config.metadata.shards.iter().enumerate() {
                        println!("    {}: {} at {}", i + 1, shard.id, shard.endpoint);
                    }
                    println!("  Sharded collections: {}", config.metadata.collections.len());
                }
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("shardgate v{}", env!("CARGO_PKG_VERSION"));
    println!("A failure-tolerant query router for sharded document stores");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None if logging.stdout => BoxMakeWriter::new(std::io::stdout),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(logging.file.is_none());

    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", logging.level);
    Ok(())
}
