//! gateway-events CLI: operator interface to the event system.

use clap::{Parser, Subcommand};
use gateway_events::config::Config;
use gateway_events::config::secrets::ExposeSecret;
use gateway_events::model::{Event, EventQuery, EventStatus, EventType, Priority};
use gateway_events::queue::TaskRequest;
use gateway_events::store::{EventStore, MemoryEventStore, PgEventStore};
use gateway_events::system::EventSystemManager;
use gateway_events::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gateway-events", about = "Durable event bus and task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bus and task queue until Ctrl-C
    Serve {
        /// Use an in-process store instead of Postgres
        #[arg(long)]
        memory: bool,
    },
    /// Publish an event
    Publish {
        /// Event type, e.g. "webhook.received"
        event_type: String,
        /// Producer identifier
        source: String,
        /// JSON payload
        #[arg(long)]
        data: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Queue a task
    Task {
        task_type: String,
        /// JSON task data
        #[arg(long)]
        data: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Inspect stored events
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// List recent events, newest first
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Filter by event type
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Event counts by type and status
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { memory } => cmd_serve(&config, memory).await,
        Command::Publish {
            event_type,
            source,
            data,
            priority,
            correlation_id,
        } => {
            let manager = connect(&config).await?;
            cmd_publish(&manager, event_type, source, data, priority, correlation_id).await
        }
        Command::Task {
            task_type,
            data,
            priority,
            correlation_id,
        } => {
            let manager = connect(&config).await?;
            cmd_task(&manager, task_type, data, priority, correlation_id).await
        }
        Command::Events { action } => {
            let manager = connect(&config).await?;
            match action {
                EventsAction::Recent {
                    limit,
                    event_type,
                    status,
                    correlation_id,
                } => cmd_events_recent(&manager, limit, event_type, status, correlation_id).await,
                EventsAction::Stats => cmd_events_stats(&manager).await,
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<EventSystemManager> {
    let url = config.database_url()?;
    let manager =
        EventSystemManager::connect_postgres(url.expose_secret(), config.system_config()?).await?;
    manager.event_bus().initialize().await?;
    Ok(manager)
}

async fn cmd_serve(config: &Config, memory: bool) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "gateway-events".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let manager = if memory {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        EventSystemManager::new(store, config.system_config()?)
    } else {
        let url = config.database_url()?;
        let store = PgEventStore::connect(url.expose_secret()).await?;
        store.health_check().await?;
        EventSystemManager::new(Arc::new(store), config.system_config()?)
    };

    manager.event_bus().subscribe_all(|event: Event| async move {
        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            source = %event.source,
            correlation_id = ?event.correlation_id,
            "event"
        );
        Ok(())
    });
    manager
        .task_queue()
        .register_task_handler("echo", |data: serde_json::Value| async move { Ok(data) })?;

    manager.initialize().await?;
    tracing::info!(memory, "gateway-events serving; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    manager.shutdown().await;
    Ok(())
}

fn parse_data(data: Option<String>) -> anyhow::Result<serde_json::Value> {
    Ok(match data {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    })
}

async fn cmd_publish(
    manager: &EventSystemManager,
    event_type: String,
    source: String,
    data: Option<String>,
    priority: String,
    correlation_id: Option<String>,
) -> anyhow::Result<()> {
    let event_type: EventType = event_type.parse()?;
    let priority: Priority = priority.parse()?;
    let event = Event::new(event_type, source, parse_data(data)?)
        .priority(priority)
        .maybe_correlation_id(correlation_id);

    let id = manager.event_bus().publish(event).await?;
    println!("Published: {id}");
    Ok(())
}

async fn cmd_task(
    manager: &EventSystemManager,
    task_type: String,
    data: Option<String>,
    priority: String,
    correlation_id: Option<String>,
) -> anyhow::Result<()> {
    let priority: Priority = priority.parse()?;
    let mut request = TaskRequest::new(task_type, parse_data(data)?).priority(priority);
    request.correlation_id = correlation_id;

    let id = manager.task_queue().submit(request).await?;
    println!("Queued task: {id}");
    Ok(())
}

async fn cmd_events_recent(
    manager: &EventSystemManager,
    limit: usize,
    event_type: Option<String>,
    status: Option<String>,
    correlation_id: Option<String>,
) -> anyhow::Result<()> {
    let mut query = EventQuery::new().limit(limit);
    if let Some(t) = event_type {
        query = query.event_type(t.parse()?);
    }
    if let Some(s) = status {
        query = query.status(s.parse::<EventStatus>()?);
    }
    if let Some(c) = correlation_id {
        query = query.correlation_id(c);
    }

    let events = manager.event_bus().query_events(&query).await?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<26}  {:<10}  {:<8}  {:<5}  TIMESTAMP",
        "ID", "TYPE", "STATUS", "PRIORITY", "TRIES"
    );
    println!("{}", "-".repeat(90));
    for event in &events {
        let id = event.event_id.to_string();
        println!(
            "{:<8}  {:<26}  {:<10}  {:<8}  {:<5}  {}",
            &id[..8],
            event.event_type.as_str(),
            event.status.as_str(),
            event.priority.to_string(),
            event.retry_count,
            event.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}

async fn cmd_events_stats(manager: &EventSystemManager) -> anyhow::Result<()> {
    let stats = manager.event_bus().get_event_stats().await?;
    if stats.0.is_empty() {
        println!("No events stored.");
        return Ok(());
    }
    for (event_type, by_status) in &stats.0 {
        let counts: Vec<String> = by_status
            .iter()
            .map(|(status, n)| format!("{status}={n}"))
            .collect();
        println!("{:<26}  {}", event_type.as_str(), counts.join(" "));
    }
    println!("\n{} event(s)", stats.total());
    Ok(())
}
