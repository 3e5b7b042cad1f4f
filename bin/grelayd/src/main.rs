//! ---
//! grelay_section: "01-core-functionality"
//! grelay_subsection: "binary"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Binary entrypoint for the greeting relay daemon."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use grelay_api::{router, spawn_api_server, ApiServer, ApiState};
use grelay_common::{
    init_stderr, init_tracing, AppConfig, Environment, RelaySettings, TransportBackend,
};
use grelay_metrics::{new_registry, DaemonMetrics, SharedRegistry};
use grelay_msg::{
    connect_transport, parse_queue_event, Consumer, DurableQueue, InMemoryTopics, LoremGenerator,
    Producer, Publisher, QueuePoller, RelayMetrics, TopicHandle,
};
use grelay_rollout::{
    AlarmSignal, AliasRouter, DeploymentState, MetricAlarm, MetricFeed, MetricStore,
    RolloutController, RolloutMetrics, RolloutRunner, RolloutStatus, ScriptedAlarm,
};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/grelay.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "Greeting relay daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        global = true,
        help = "Override the ENVIRONMENT variable"
    )]
    environment: Option<CliEnvironment>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliEnvironment {
    Staging,
    Production,
}

impl From<CliEnvironment> for Environment {
    fn from(value: CliEnvironment) -> Self {
        match value {
            CliEnvironment::Staging => Environment::Staging,
            CliEnvironment::Production => Environment::Production,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the greeting endpoint and drain the local queue")]
    Serve,
    #[command(about = "Process one queue event (JSON with a Records array)")]
    Consume {
        #[arg(long, value_name = "FILE", help = "Event file; reads stdin when omitted")]
        file: Option<PathBuf>,
    },
    #[command(about = "Shift traffic to a new version on the environment's schedule")]
    Rollout(RolloutArgs),
    #[command(about = "Print the resolved configuration for the active environment")]
    Config,
}

#[derive(Debug, Args)]
struct RolloutArgs {
    #[arg(long, help = "Version receiving traffic")]
    target_version: Option<String>,

    #[arg(long, help = "Version currently serving all traffic")]
    stable_version: Option<String>,

    #[arg(long, help = "Function whose deployment group is rolled out")]
    function: Option<String>,

    #[arg(long, help = "Deployment group name; overrides --function")]
    group: Option<String>,

    #[arg(
        long,
        value_name = "FILE",
        conflicts_with = "fail_at_step",
        help = "JSON-lines feed of alarm metric datapoints, read before every step"
    )]
    metrics_file: Option<PathBuf>,

    #[arg(long, value_name = "STEP", help = "Raise the alarm from this step on (drill)")]
    fail_at_step: Option<u32>,

    #[arg(long, value_name = "FILE", help = "Persist rollout state after every step")]
    state_file: Option<PathBuf>,

    #[arg(long, requires = "state_file", help = "Resume the rollout saved in --state-file")]
    resume: bool,

    #[arg(long, value_name = "SECS", help = "Override the schedule interval")]
    interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    let load_duration = load_started.elapsed();
    let environment = cli
        .environment
        .map(Environment::from)
        .unwrap_or_else(Environment::detect);

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), environment.as_str());

    let command = cli.command.unwrap_or(Commands::Serve);
    if matches!(command, Commands::Config) {
        init_stderr();
    } else {
        init_tracing("grelayd", &config.logging)?;
    }
    info!(
        config_path = %loaded.source.display(),
        environment = %environment,
        "configuration loaded"
    );

    match command {
        Commands::Serve => serve(config, environment, registry).await?,
        Commands::Consume { file } => consume(&config, file, &registry)?,
        Commands::Rollout(args) => rollout(config, environment, args, registry).await?,
        Commands::Config => print_config(&config, environment, &loaded.source)?,
    }

    Ok(())
}

async fn serve(
    config: AppConfig,
    environment: Environment,
    registry: SharedRegistry,
) -> Result<()> {
    // a missing topic address is fatal before any request is served
    let settings =
        RelaySettings::resolve(&config.relay).context("relay configuration is incomplete")?;
    let profile = config.profile(environment);
    let relay_metrics = if config.metrics.enabled {
        Some(RelayMetrics::register(&registry)?)
    } else {
        None
    };

    let topic = TopicHandle::new(settings.topic_address.clone());
    let topics = InMemoryTopics::new();
    let queue = DurableQueue::new(
        &profile.resource_name("GreetingQueue"),
        settings.visibility_timeout,
    );
    topics.subscribe(&topic, queue.clone());
    if let Some(alarm_topic) = &settings.alarm_topic_address {
        topics.create(&TopicHandle::new(alarm_topic.clone()));
    }

    let transport = connect_transport(settings.backend, &topics).await?;
    let mut publisher = Publisher::new(transport);
    if let Some(metrics) = relay_metrics.clone() {
        publisher = publisher.with_metrics(metrics);
    }
    info!(
        topic = %topic,
        transport = publisher.transport_name(),
        memory_mb = profile.memory_mb,
        "publisher ready"
    );
    let producer = Producer::new(Arc::new(LoremGenerator::new()), publisher, topic);

    let poller = match settings.backend {
        TransportBackend::InMemory => {
            let poller = QueuePoller::new(
                queue,
                Arc::new(Consumer::new(relay_metrics)),
                settings.batch_size,
                settings.poll_interval,
            );
            let (tx, rx) = oneshot::channel();
            Some((tx, tokio::spawn(poller.run(rx))))
        }
        TransportBackend::Sns => {
            info!("managed topic in use; queue is drained by the deployed consumer");
            None
        }
    };

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(producer, environment.as_str()));
        let registry = config.metrics.enabled.then(|| registry.clone());
        let app = router(state, &config.api.resource_path, registry);
        let server = spawn_api_server(app, config.api.listen)?;
        info!(
            address = %server.addr(),
            path = %config.api.resource_path,
            "greeting endpoint ready"
        );
        api_server = Some(server);
    } else {
        info!("api server disabled by configuration");
    }

    info!(environment = %environment, "relay running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    if let Some((tx, handle)) = poller {
        let _ = tx.send(());
        let totals = handle.await.context("queue poller panicked")?;
        info!(decoded = totals.decoded, malformed = totals.malformed, "queue poller drained");
    }
    Ok(())
}

fn consume(config: &AppConfig, file: Option<PathBuf>, registry: &SharedRegistry) -> Result<()> {
    let raw = match &file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("unable to read queue event {}", path.display()))?,
        None => io::read_to_string(io::stdin()).context("unable to read queue event from stdin")?,
    };
    let event = parse_queue_event(&raw)?;
    let metrics = if config.metrics.enabled {
        Some(RelayMetrics::register(registry)?)
    } else {
        None
    };
    let report = Consumer::new(metrics).process_batch(&event.records);
    println!(
        "{}",
        serde_json::json!({
            "records": event.records.len(),
            "decoded": report.decoded,
            "malformed": report.malformed,
        })
    );
    Ok(())
}

async fn rollout(
    config: AppConfig,
    environment: Environment,
    args: RolloutArgs,
    registry: SharedRegistry,
) -> Result<()> {
    let router = AliasRouter::new();
    let alarm: Arc<dyn AlarmSignal> = match (args.fail_at_step, &args.metrics_file) {
        (Some(step), _) => {
            warn!(step, "drill: alarm will fire from this step");
            Arc::new(ScriptedAlarm {
                fail_at_step: Some(step),
            })
        }
        (None, Some(path)) => {
            info!(
                feed = %path.display(),
                metric = %config.alarm.metric_name,
                "alarm reads datapoints from feed"
            );
            let feed = MetricFeed::new(path, MetricStore::for_alarm(&config.alarm));
            Arc::new(MetricAlarm::with_feed(config.alarm.clone(), feed))
        }
        (None, None) => bail!(
            "a rollout needs an alarm source: pass --metrics-file with {} datapoints, \
             or --fail-at-step for a drill",
            config.alarm.metric_name
        ),
    };

    let controller = if args.resume {
        let path = args
            .state_file
            .as_deref()
            .context("--resume needs --state-file")?;
        let state = DeploymentState::load(path)
            .with_context(|| format!("unable to resume rollout from {}", path.display()))?;
        if state.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&state)?);
            return Ok(());
        }
        info!(
            rollout_id = %state.id,
            group = %state.group,
            steps_applied = state.steps_applied,
            "resuming rollout"
        );
        RolloutController::resume(state, Arc::new(router), alarm)?
    } else {
        let (Some(target), Some(stable)) = (&args.target_version, &args.stable_version) else {
            bail!("--target-version and --stable-version are required for a new rollout");
        };
        let profile = config.profile(environment);
        let group = match (&args.group, &args.function) {
            (Some(group), _) => group.clone(),
            (None, Some(function)) => profile.deployment_group(function),
            (None, None) => {
                let function = config
                    .deployment
                    .functions
                    .first()
                    .context("no functions configured under [deployment]")?;
                profile.deployment_group(function)
            }
        };
        let schedule = config.schedule_for(environment)?;
        RolloutController::start(&group, target, stable, schedule, Arc::new(router), alarm)?
    };

    let alarm_name = format!("{}-{}", controller.state().group, config.alarm.metric_name);
    let mut controller = controller
        .with_alarm_name(alarm_name)
        .with_metrics(RolloutMetrics::new(registry)?);
    if let Some(alarm_topic) = config.relay.alarm_topic() {
        let topics = InMemoryTopics::new();
        let topic = TopicHandle::new(alarm_topic);
        topics.create(&topic);
        let transport = connect_transport(config.relay.backend, &topics).await?;
        controller = controller.with_notifier(Publisher::new(transport), topic);
    }

    let mut runner = RolloutRunner::new(controller);
    if let Some(secs) = args.interval_secs {
        runner = runner.with_interval(Duration::from_secs(secs));
    }
    if let Some(path) = &args.state_file {
        runner = runner.with_state_file(path);
    }
    let state = runner.run().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    if state.status == RolloutStatus::RolledBack {
        warn!(group = %state.group, "rollout rolled back; stable version restored");
    }
    Ok(())
}

fn print_config(config: &AppConfig, environment: Environment, source: &Path) -> Result<()> {
    let profile = config.profile(environment);
    let schedule = config.schedule_for(environment)?;
    let relay = RelaySettings::resolve(&config.relay);
    let view = serde_json::json!({
        "source": source.display().to_string(),
        "environment": environment.as_str(),
        "profile": profile,
        "schedule": {
            "step_percent": schedule.step_percent,
            "interval_secs": schedule.interval.as_secs(),
            "total_steps": schedule.total_steps(),
        },
        "deployment_groups": config.deployment_groups(environment),
        "queue": profile.resource_name("GreetingQueue"),
        "topic_address": relay.as_ref().ok().map(|settings| settings.topic_address.clone()),
        "topic_error": relay.as_ref().err().map(|err| err.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
