use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use config::{load_config, NudgeConfig};
use nudge_bus::BroadcastHub;
use nudge_core::{
    JobPool, LlmProfileUpdater, LlmReplyGenerator, PassiveChat, ProfileRefresher,
    ProfileUpdaterConfig, ReplyGenerator, SelectorConfig, StoreSnapshot, TopicPool,
    TriggerSelector,
};
use nudge_memory::{ChatHistoryStore, DocumentStore, FileDocumentStore, ProfileStore};
use nudge_provider::{LlmProvider, LlmRequest, LlmResponse, OpenAiProvider};
use nudge_scheduler::{ProactiveConfig, RunStateStore, SchedulerDeps, SchedulerManager};
use nudge_schema::RunState;
use nudge_server::state::AppState;

#[derive(Parser)]
#[command(name = "nudgehive", version, about = "nudgehive proactive engagement service")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.nudgehive",
        help = "Config root directory (contains config/ and data/)"
    )]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the proactive schedulers and the HTTP API server")]
    Start {
        #[arg(long, help = "HTTP API server port (overrides server.addr)")]
        port: Option<u16>,
    },
    #[command(about = "Run one proactive tick for a user immediately")]
    Tick {
        #[arg(long, help = "User ID (defaults to default_user_id)")]
        user: Option<String>,
    },
    #[command(subcommand, about = "Inspect or change a user's proactive run state")]
    State(StateCommands),
    #[command(about = "Validate config files")]
    Validate,
}

#[derive(Subcommand)]
enum StateCommands {
    #[command(about = "Print the run state")]
    Show {
        #[arg(long)]
        user: Option<String>,
    },
    #[command(about = "Allow proactive messages")]
    Enable {
        #[arg(long)]
        user: Option<String>,
    },
    #[command(about = "Stop proactive messages")]
    Disable {
        #[arg(long)]
        user: Option<String>,
    },
    #[command(about = "End the current cooldown")]
    ClearCooldown {
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Expand ~ to home directory
    if cli.config_root.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            cli.config_root = PathBuf::from(home).join(
                cli.config_root
                    .strip_prefix("~")
                    .unwrap_or(&cli.config_root),
            );
        }
    }

    let loaded = load_config(&cli.config_root.join("config"));
    let data_dir = loaded
        .as_ref()
        .map(|config| config.data_dir(&cli.config_root))
        .unwrap_or_else(|_| cli.config_root.join("data"));

    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "nudgehive.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    let config = loaded?;

    match command {
        Commands::Validate => {
            println!(
                "Config valid. {} scheduled user(s), interval {}s, cooldown {}s, data dir {}.",
                config.scheduled_users().len(),
                config.proactive.interval_secs,
                config.proactive.cooldown_secs,
                data_dir.display()
            );
            if config.provider.api_key.is_empty() {
                println!("No provider API key: topic selection runs locally and replies fail.");
            }
        }
        Commands::Start { port } => {
            start(&cli.config_root, config, port).await?;
        }
        Commands::Tick { user } => {
            let runtime = bootstrap(&cli.config_root, &config)?;
            let user = user.unwrap_or_else(|| config.default_user_id.clone());
            let outcome = runtime.manager.scheduler(&user).tick(Utc::now()).await;
            runtime.jobs.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
        Commands::State(cmd) => {
            let docs: Arc<dyn DocumentStore> = Arc::new(FileDocumentStore::new(&data_dir));
            let states = RunStateStore::new(docs);
            let (user, state) = match cmd {
                StateCommands::Show { user } => {
                    let user = user.unwrap_or_else(|| config.default_user_id.clone());
                    let state = states.load(&user).await?;
                    (user, state)
                }
                StateCommands::Enable { user } => {
                    update_state(&states, &config, user, |s| s.enabled = true).await?
                }
                StateCommands::Disable { user } => {
                    update_state(&states, &config, user, |s| s.enabled = false).await?
                }
                StateCommands::ClearCooldown { user } => {
                    update_state(&states, &config, user, RunState::clear_cooldown).await?
                }
            };
            println!("User: {user}");
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    Ok(())
}

async fn update_state(
    states: &RunStateStore,
    config: &NudgeConfig,
    user: Option<String>,
    apply: impl FnOnce(&mut RunState),
) -> Result<(String, RunState)> {
    let user = user.unwrap_or_else(|| config.default_user_id.clone());
    nudge_memory::validate_user_id(&user)?;
    let state = states.update(&user, apply).await?;
    Ok((user, state))
}

/// Stands in for the completion service when no API key is configured.
struct Unconfigured;

#[async_trait]
impl LlmProvider for Unconfigured {
    async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
        bail!("no provider API key configured (provider.api_key or OPENAI_API_KEY)")
    }
}

struct Runtime {
    hub: BroadcastHub,
    jobs: Arc<JobPool>,
    manager: SchedulerManager,
    app_state: AppState,
}

fn bootstrap(root: &Path, config: &NudgeConfig) -> Result<Runtime> {
    let data_dir = config.data_dir(root);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
    let timezone = config.timezone()?;

    let docs: Arc<dyn DocumentStore> = Arc::new(FileDocumentStore::new(&data_dir));
    let chats = Arc::new(ChatHistoryStore::new(&data_dir));
    let profiles = ProfileStore::new(docs.clone());
    let states = RunStateStore::new(docs.clone());
    let hub = BroadcastHub::new(
        config.hub.clone(),
        Arc::new(StoreSnapshot::new(profiles.clone())),
    );

    let provider: Option<Arc<dyn LlmProvider>> = if config.provider.api_key.is_empty() {
        tracing::warn!("no provider API key configured, topic selection runs locally");
        None
    } else {
        Some(Arc::new(OpenAiProvider::with_timeout(
            config.provider.api_key.clone(),
            config.provider.api_base.clone(),
            Duration::from_secs(config.provider.timeout_secs),
        )))
    };
    let reply_provider = provider
        .clone()
        .unwrap_or_else(|| Arc::new(Unconfigured) as Arc<dyn LlmProvider>);
    let generator: Arc<dyn ReplyGenerator> = Arc::new(LlmReplyGenerator::new(
        reply_provider.clone(),
        profiles.clone(),
        chats.clone(),
        config.provider.reply_model(),
    ));

    let pool = Arc::new(TopicPool::new(docs));
    let selector = TriggerSelector::new(
        pool.clone(),
        chats.clone(),
        provider,
        SelectorConfig {
            model: config.provider.model.clone(),
            default_timezone: timezone,
            ..SelectorConfig::default()
        },
    );

    let jobs = Arc::new(JobPool::new(config.jobs.clone()));
    let refresher: Arc<dyn ProfileRefresher> = Arc::new(LlmProfileUpdater::new(
        reply_provider,
        profiles.clone(),
        chats.clone(),
        hub.clone(),
        ProfileUpdaterConfig {
            model: config.provider.model.clone(),
            default_timezone: timezone,
            ..ProfileUpdaterConfig::default()
        },
    ));

    let deps = SchedulerDeps {
        selector: Arc::new(selector),
        chats: chats.clone(),
        states: states.clone(),
        generator: generator.clone(),
        hub: hub.clone(),
        jobs: jobs.clone(),
        refresher: refresher.clone(),
    };
    let manager = SchedulerManager::new(
        ProactiveConfig {
            users: config.scheduled_users(),
            ..config.proactive.clone()
        },
        deps,
    );

    let chat = PassiveChat::new(
        chats.clone(),
        hub.clone(),
        generator,
        pool,
        jobs.clone(),
        refresher,
    );
    let app_state = AppState {
        hub: hub.clone(),
        profiles,
        chats,
        chat: Arc::new(chat),
        states,
        default_user_id: config.default_user_id.clone(),
    };

    Ok(Runtime {
        hub,
        jobs,
        manager,
        app_state,
    })
}

fn server_addr(config: &NudgeConfig, port: Option<u16>) -> String {
    match port {
        Some(port) => {
            let host = config
                .server
                .addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or("127.0.0.1");
            format!("{host}:{port}")
        }
        None => config.server.addr.clone(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                ctrl_c.await.ok();
                tracing::info!("Received SIGINT, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("Received SIGINT, shutting down...");
    }
}

async fn start(root: &Path, config: NudgeConfig, port: Option<u16>) -> Result<()> {
    let runtime = bootstrap(root, &config)?;

    if config.proactive.enabled {
        let started = runtime.manager.start_configured()?;
        tracing::info!(schedulers = started, "proactive scheduling enabled");
    } else {
        tracing::info!("proactive scheduling disabled by config");
    }

    let addr = server_addr(&config, port);
    let token = CancellationToken::new();
    let state = runtime.app_state.clone();
    let shutdown = token.clone().cancelled_owned();
    let mut server =
        tokio::spawn(async move { nudge_server::serve(state, &addr, shutdown).await });

    let exited_early = tokio::select! {
        _ = shutdown_signal() => None,
        joined = &mut server => Some(joined),
    };

    // Schedulers first so no tick publishes into a closed hub; closing the hub ends SSE streams.
    runtime.manager.stop_all().await;
    runtime.hub.close();
    token.cancel();
    let served = match exited_early {
        Some(joined) => joined,
        None => server.await,
    };
    runtime.jobs.shutdown().await;
    tracing::info!("Goodbye.");

    served.context("server task failed")??;
    Ok(())
}
