use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use journaled::kafka::KafkaStreamEndpoint;
use journaled::postgres::PgJobQueue;
use journaled::stream::{stream_env_var_name, EnvStreamNames, StreamNameResolver};
use journaled::{
    BulkWriter, Config, DeliveryAgent, DeliveryWorker, EnqueueOptions, JournalEvent, KeyStrategy,
    RawEvent, SchemaRegistry, Serializer,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "journaled")]
#[command(about = "Journal validated domain events to a durable stream", long_about = None)]
struct Args {
    /// Configuration file; `JOURNALED_*` variables are used when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate events from a JSON-lines file and enqueue them for delivery
    Journal {
        /// One event object per line; `-` reads standard input
        #[arg(value_name = "FILE")]
        events: PathBuf,

        /// Register an event schema, as NAME=PATH (repeatable)
        #[arg(long = "schema", value_name = "NAME=PATH")]
        schemas: Vec<String>,

        /// Derive missing partition keys: schema, random, field:NAME or composite:A,B
        #[arg(long)]
        key_strategy: Option<String>,

        /// Application whose stream receives the events
        #[arg(long)]
        app: Option<String>,

        #[arg(long)]
        priority: Option<i32>,

        #[arg(long)]
        queue: Option<String>,
    },

    /// Run the delivery worker until interrupted
    Work {
        /// Only run jobs from these queues (repeatable)
        #[arg(long = "queue", value_name = "NAME")]
        queues: Vec<String>,
    },

    /// Print the stream an application's events are delivered to
    StreamName {
        #[arg(long)]
        app: Option<String>,
    },

    /// Create the delivery job table
    InitQueue,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    let config = load_config(args.config.as_deref())?;
    info!(
        environment = %config.environment,
        delivery_enabled = config.delivery_enabled(),
        kafka_brokers = ?config.kafka.brokers,
        queue_table = %config.queue.table,
        "Configuration summary"
    );

    match args.command {
        Command::Journal {
            events,
            schemas,
            key_strategy,
            app,
            priority,
            queue,
        } => {
            let key_strategy = match key_strategy {
                Some(raw) => Some(
                    KeyStrategy::parse(&raw)
                        .with_context(|| format!("unknown key strategy '{}'", raw))?,
                ),
                None => None,
            };
            let registry = load_schemas(&schemas)?;
            let events = read_events(&events, key_strategy.as_ref())?;

            let options = EnqueueOptions {
                priority,
                queue,
                run_at: None,
            };

            let config = Arc::new(config);
            let scheduler = Arc::new(PgJobQueue::connect(&config.queue).await?);
            let writer = BulkWriter::new(Serializer::new(Arc::new(registry)), scheduler, config);

            let batches = writer.journal(&events, app.as_deref(), &options).await?;
            info!(events = events.len(), batches, "Journaled events");
        }

        Command::Work { queues } => {
            if !config.delivery_enabled() {
                warn!("Delivery is disabled; jobs will complete without reaching the stream");
            }

            let config = Arc::new(config);
            let queue = Arc::new(PgJobQueue::connect(&config.queue).await?);
            let endpoint = Arc::new(KafkaStreamEndpoint::new(&config.kafka)?);
            let agent = DeliveryAgent::new(endpoint, Arc::new(EnvStreamNames), queue.clone(), config.clone());

            let worker = DeliveryWorker::new(
                queue,
                agent,
                config.queue.max_attempts,
                config.queue.poll_interval(),
            )
            .with_queues(queues);

            worker
                .run(async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received shutdown signal");
                    }
                })
                .await?;
        }

        Command::StreamName { app } => {
            let app = app.or_else(|| config.default_app_name.clone());
            let name = EnvStreamNames
                .resolve_stream_name(app.as_deref())
                .with_context(|| format!("set {}", stream_env_var_name(app.as_deref())))?;
            println!("{}", name);
        }

        Command::InitQueue => {
            let queue = PgJobQueue::connect(&config.queue).await?;
            queue.ensure_schema().await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::from_file(path)
        }
        None => Config::from_env(),
    };
    config.context("Failed to load configuration")
}

fn load_schemas(specs: &[String]) -> anyhow::Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();

    for spec in specs {
        let Some((name, path)) = spec.split_once('=') else {
            bail!("schema must be given as NAME=PATH, got '{}'", spec);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema {}", path))?;
        registry.register_str(name, &raw)?;
        info!(schema = name, "Registered schema");
    }

    Ok(registry)
}

fn read_events(path: &Path, key_strategy: Option<&KeyStrategy>) -> anyhow::Result<Vec<JournalEvent>> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawEvent = serde_json::from_str(&line)
            .with_context(|| format!("line {}: not an event object", index + 1))?;
        let event = raw
            .into_event(key_strategy)
            .with_context(|| format!("line {}", index + 1))?;
        events.push(event);
    }

    Ok(events)
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("journaled=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("journaled=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
