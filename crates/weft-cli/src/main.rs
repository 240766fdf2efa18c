use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::broker::{Broker, RedisBroker};
use weft_core::{
    BrokerConfig, Client, Handler, HandlerError, PeriodicTask, Scheduler, SchedulerConfig,
    ServerBuilder, ServerConfig, Task, TaskContext, TaskOption, TypedHandler, TypedTask,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "weft", about = "Redis-backed task queue")]
struct Cli {
    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BrokerArgs {
    #[arg(long, env = "WEFT_REDIS_URL", default_value = "redis://127.0.0.1:6379/0", global = true)]
    redis_url: String,

    #[arg(long, env = "WEFT_KEY_PREFIX", default_value = weft_core::keys::DEFAULT_KEY_PREFIX, global = true)]
    key_prefix: String,
}

impl BrokerArgs {
    fn config(&self) -> BrokerConfig {
        BrokerConfig {
            url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            ..BrokerConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Process tasks until Ctrl-C.
    Worker(WorkerArgs),
    /// Enqueue one task.
    Enqueue(EnqueueArgs),
    /// Run periodic tasks until Ctrl-C.
    Scheduler(SchedulerArgs),
}

#[derive(Args)]
struct WorkerArgs {
    /// 0 = number of CPUs
    #[arg(long, env = "WEFT_CONCURRENCY", default_value_t = 0)]
    concurrency: usize,

    /// `name=weight`, repeatable
    #[arg(long = "queue", value_parser = parse_queue, default_value = "default=1")]
    queues: Vec<(String, u32)>,

    #[arg(long)]
    strict_priority: bool,

    /// Seconds in-flight tasks get to finish on shutdown.
    #[arg(long, env = "WEFT_SHUTDOWN_TIMEOUT", default_value_t = 8)]
    shutdown_timeout: u64,
}

#[derive(Args)]
struct EnqueueArgs {
    kind: String,

    #[arg(default_value = "")]
    payload: String,

    #[arg(long)]
    queue: Option<String>,

    #[arg(long)]
    max_retry: Option<u32>,

    /// Seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Process after this many seconds.
    #[arg(long)]
    process_in: Option<u64>,

    /// Uniqueness window in seconds.
    #[arg(long)]
    unique: Option<u64>,

    /// Keep the completed task for this many seconds.
    #[arg(long)]
    retention: Option<u64>,

    #[arg(long)]
    id: Option<String>,
}

impl EnqueueArgs {
    fn options(&self) -> Vec<TaskOption> {
        let mut opts = Vec::new();
        if let Some(q) = &self.queue {
            opts.push(TaskOption::Queue(q.clone()));
        }
        if let Some(n) = self.max_retry {
            opts.push(TaskOption::MaxRetry(n));
        }
        if let Some(s) = self.timeout {
            opts.push(TaskOption::Timeout(Duration::from_secs(s)));
        }
        if let Some(s) = self.process_in {
            opts.push(TaskOption::ProcessAfter(Duration::from_secs(s)));
        }
        if let Some(s) = self.unique {
            opts.push(TaskOption::Unique(Duration::from_secs(s)));
        }
        if let Some(s) = self.retention {
            opts.push(TaskOption::Retention(Duration::from_secs(s)));
        }
        if let Some(id) = &self.id {
            opts.push(TaskOption::TaskId(id.clone()));
        }
        opts
    }
}

#[derive(Args)]
struct SchedulerArgs {
    /// `name|spec[|payload]`, e.g. `cleanup|@every 1m`; the name is also the task kind. Repeatable.
    #[arg(long = "entry", value_parser = parse_entry, required = true)]
    entries: Vec<(String, PeriodicTask)>,
}

fn parse_queue(s: &str) -> Result<(String, u32), String> {
    let (name, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=weight, got {s:?}"))?;
    let weight = weight
        .parse()
        .map_err(|e| format!("bad weight in {s:?}: {e}"))?;
    Ok((name.to_string(), weight))
}

fn parse_entry(s: &str) -> Result<(String, PeriodicTask), String> {
    let mut parts = s.splitn(3, '|');
    let (Some(name), Some(cron)) = (parts.next(), parts.next()) else {
        return Err(format!("expected name|spec[|payload], got {s:?}"));
    };
    let payload = parts.next().unwrap_or_default();
    Ok((
        name.to_string(),
        PeriodicTask {
            cron: cron.to_string(),
            payload: payload.as_bytes().to_vec(),
            opts: Vec::new(),
        },
    ))
}

/// `echo`: log the payload and keep it as the task result.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), HandlerError> {
        info!(task_id = %ctx.task_id(), payload = %String::from_utf8_lossy(task.payload()), "echo");
        ctx.result_writer().write(task.payload()).await?;
        Ok(())
    }
}

/// `sleep` task payload: `{"secs": 3}`
#[derive(Serialize, Deserialize)]
struct Sleep {
    secs: u64,
}

impl TypedTask for Sleep {
    const KIND: &'static str = "sleep";
}

struct Sleeper;

#[async_trait]
impl TypedHandler<Sleep> for Sleeper {
    async fn handle(&self, ctx: TaskContext, task: Sleep) -> Result<(), HandlerError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(task.secs)) => Ok(()),
            _ = ctx.cancelled() => Err(HandlerError::new("interrupted")),
        }
    }
}

async fn connect(args: &BrokerArgs) -> Result<RedisBroker, BoxError> {
    Ok(RedisBroker::connect_with_retry(&args.config()).await?)
}

async fn run_worker(broker: RedisBroker, args: WorkerArgs) -> Result<(), BoxError> {
    let config = ServerConfig {
        concurrency: args.concurrency,
        queues: args.queues.into_iter().collect::<BTreeMap<_, _>>(),
        strict_priority: args.strict_priority,
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        ..ServerConfig::default()
    };
    let mut server = ServerBuilder::new(Arc::new(broker))
        .config(config)
        .handle("echo", Echo)?
        .register::<Sleep, _>(Sleeper)?
        .build()?;

    server.start();
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}

async fn run_enqueue(broker: RedisBroker, args: EnqueueArgs) -> Result<(), BoxError> {
    let keys = broker.keys().clone();
    let client = Client::new(Arc::new(broker)).with_keys(keys);
    let task = Task::new(args.kind.clone(), args.payload.as_bytes().to_vec());
    let info = client.enqueue(&task, &args.options()).await?;
    println!(
        "{}",
        serde_json::json!({
            "id": info.id,
            "queue": info.queue,
            "kind": info.kind,
            "state": info.state.as_str(),
            "next_process_at": info.next_process_at.to_rfc3339(),
        })
    );
    Ok(())
}

async fn run_scheduler(broker: RedisBroker, args: SchedulerArgs) -> Result<(), BoxError> {
    let keys = broker.keys().clone();
    let client = Client::new(Arc::new(broker)).with_keys(keys);
    let mut scheduler = Scheduler::new(client, SchedulerConfig::default());
    for (name, periodic) in &args.entries {
        let entry_id = scheduler.register_periodic(name, periodic)?;
        info!(name = %name, entry_id = %entry_id, spec = %periodic.cron, "periodic task registered");
    }

    scheduler.start();
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let broker = connect(&cli.broker).await?;
    if let Err(e) = broker.ping().await {
        warn!(error = %e, "broker ping failed");
    }

    match cli.command {
        Command::Worker(args) => run_worker(broker, args).await,
        Command::Enqueue(args) => run_enqueue(broker, args).await,
        Command::Scheduler(args) => run_scheduler(broker, args).await,
    }
}
