//! Nectar 入口
//!
//! - `nectar -m "text"`：单次对话，打印回复后退出
//! - `nectar`：网关模式，运行 CLI 渠道、分发循环、定时任务与心跳，直到 Ctrl+C / SIGTERM / 输入结束

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use futures_util::FutureExt;
use nectar::agent::{AgentLoop, AgentLoopBuilder};
use nectar::bus::{MessageBus, OutboundMessage};
use nectar::channels::{ChannelManager, CliChannel};
use nectar::config::{load_config, AppConfig};
use nectar::core::ShutdownManager;
use nectar::cron::{CronJob, CronService, JobCallback};
use nectar::heartbeat::{ExecuteFn, HeartbeatService, NotifyFn};
use nectar::llm::{create_llm_from_config, LlmClient};

const USAGE: &str = "Usage: nectar [-m MESSAGE] [-s SESSION] [-c CONFIG]\n\
\n\
  -m, --message TEXT   run a single turn and print the reply\n\
  -s, --session KEY    session key for -m (default cli:direct)\n\
  -c, --config PATH    extra TOML config file\n\
  -h, --help           show this help";

/// 命令行参数
struct CliArgs {
    message: Option<String>,
    session: String,
    config: Option<PathBuf>,
}

impl CliArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Self>> {
        let mut parsed = CliArgs {
            message: None,
            session: "cli:direct".to_string(),
            config: None,
        };
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .with_context(|| format!("missing value for {}", name))
            };
            match arg.as_str() {
                "-m" | "--message" => parsed.message = Some(value("--message")?),
                "-s" | "--session" => parsed.session = value("--session")?,
                "-c" | "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
                "-h" | "--help" => return Ok(None),
                other => bail!("unknown argument: {}\n\n{}", other, USAGE),
            }
        }
        Ok(Some(parsed))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nectar::observability::init();

    let Some(args) = CliArgs::parse(std::env::args().skip(1))? else {
        println!("{}", USAGE);
        return Ok(());
    };
    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    let workspace = cfg.workspace_path();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let provider = create_llm_from_config(&cfg);
    let bus = Arc::new(MessageBus::new());
    let cron = Arc::new(CronService::new(cfg.cron_store_path()));
    let agent = AgentLoopBuilder::new(Arc::clone(&bus), Arc::clone(&provider), &workspace)
        .with_config(&cfg)
        .with_cron(Arc::clone(&cron))
        .build();

    if let Some(message) = args.message {
        let reply = agent
            .process_direct(&message, &args.session, "cli", "direct")
            .await
            .context("Agent turn failed")?;
        println!("{}", reply);
        return Ok(());
    }

    run_gateway(&cfg, provider, bus, cron, agent).await
}

/// 定时任务回调：在 `cron:{id}` 会话上跑一轮，需要投递时把回答发到目标会话
fn cron_callback(agent: Arc<AgentLoop>, bus: Arc<MessageBus>) -> JobCallback {
    Arc::new(move |job: CronJob| {
        let agent = Arc::clone(&agent);
        let bus = Arc::clone(&bus);
        async move {
            let channel = job.payload.channel.as_deref().unwrap_or("cli");
            let chat_id = job.payload.to.as_deref().unwrap_or("direct");
            let reply = agent
                .process_direct(
                    &job.payload.message,
                    &format!("cron:{}", job.id),
                    channel,
                    chat_id,
                )
                .await
                .map_err(|e| e.to_string())?;
            if job.payload.deliver && job.payload.to.is_some() && !reply.is_empty() {
                bus.publish_outbound(OutboundMessage::new(channel, chat_id, reply.clone()));
            }
            Ok::<_, String>(Some(reply))
        }
        .boxed()
    })
}

async fn run_gateway(
    cfg: &AppConfig,
    provider: Arc<dyn LlmClient>,
    bus: Arc<MessageBus>,
    cron: Arc<CronService>,
    agent: Arc<AgentLoop>,
) -> anyhow::Result<()> {
    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    cron.set_on_job(cron_callback(Arc::clone(&agent), Arc::clone(&bus)));

    let execute: ExecuteFn = {
        let agent = Arc::clone(&agent);
        Arc::new(move |tasks: String| {
            let agent = Arc::clone(&agent);
            async move {
                agent
                    .process_direct(&tasks, "heartbeat", "cli", "direct")
                    .await
                    .map_err(|e| e.to_string())
            }
            .boxed()
        })
    };
    let notify: NotifyFn = {
        let bus = Arc::clone(&bus);
        Arc::new(move |response: String| {
            bus.publish_outbound(OutboundMessage::new("cli", "direct", response));
            async {}.boxed()
        })
    };
    let heartbeat = Arc::new(
        HeartbeatService::new(
            &cfg.workspace_path(),
            provider,
            cfg.agent.model.clone(),
            &cfg.heartbeat,
        )
        .with_on_execute(execute)
        .with_on_notify(notify),
    );

    let mut channels = ChannelManager::new(Arc::clone(&bus), &cfg.channels);
    if cfg.channels.cli.enabled {
        channels.register(Arc::new(
            CliChannel::new(Arc::clone(&bus), &cfg.channels.cli).with_shutdown(shutdown.clone()),
        ));
    }
    let channels = Arc::new(channels);
    if channels.enabled_channels().is_empty() {
        tracing::warn!("No channels enabled");
    }

    let agent_task = tokio::spawn(Arc::clone(&agent).run(shutdown.token()));
    cron.start();
    heartbeat.start();
    channels.start_all().await;
    tracing::info!(
        "Gateway running: channels=[{}], cron jobs={}",
        channels.enabled_channels().join(", "),
        cron.status().jobs
    );

    shutdown.wait().await;
    tracing::info!("Shutting down ({:?})", shutdown.reason());

    heartbeat.stop();
    cron.stop();
    channels.stop_all().await;
    if let Err(e) = agent_task.await {
        tracing::error!("Agent loop task failed: {}", e);
    }
    Ok(())
}
