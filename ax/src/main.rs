//! ax - shared ad executor
//!
//! CLI entry point for running the multi-tab simulator.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use rand::Rng;
use tracing::{debug, info, warn};

use adexec::ads::{AdService, AdspaceInput, InMemoryCollaborator};
use adexec::cli::{Cli, Command, OutputFormat, get_log_path};
use adexec::client::{Connection, Environment, connect};
use adexec::config::Config;
use adexec::events::{AxEvent, EventLogEntry};
use adexec::offer::{Presenter, RenderContent, RenderError, Renderer};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(origin = %config.origin, "adexec loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Simulate {
            tabs,
            slots,
            duration_secs,
            close_tab_after,
            force_compat,
            failure_rate,
            format,
        } => {
            if !(0.0..=1.0).contains(&failure_rate) {
                return Err(eyre!("failure-rate must be between 0.0 and 1.0, got {}", failure_rate));
            }
            config.transport.force_compat |= force_compat;
            config.validate()?;
            let plan = SimulationPlan {
                tabs,
                slots,
                duration: Duration::from_secs(duration_secs),
                close_tab_after: close_tab_after.map(Duration::from_secs),
                failure_rate,
                format,
            };
            cmd_simulate(&config, plan).await
        }
        Command::Config => cmd_config(&config),
    }
}

/// Print the effective configuration as YAML
fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    println!("# logs: {}", get_log_path().display());
    Ok(())
}

struct SimulationPlan {
    tabs: usize,
    slots: usize,
    duration: Duration,
    close_tab_after: Option<Duration>,
    failure_rate: f64,
    format: OutputFormat,
}

/// Renders after a short random delay and fails at a fixed rate
struct SimulatedRenderer {
    failure_rate: f64,
}

#[async_trait]
impl Renderer for SimulatedRenderer {
    async fn render(&self, uid: &str, content: &RenderContent) -> Result<(), RenderError> {
        let (delay_ms, fail) = {
            let mut rng = rand::rng();
            (rng.random_range(50..500u64), rng.random_bool(self.failure_rate))
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if fail {
            return Err(RenderError::Failed(format!("{} could not show {}", uid, content.mime_type)));
        }
        debug!(%uid, action = %content.action_type, image = content.is_image(), "SimulatedRenderer::render: shown");
        Ok(())
    }
}

struct Tab {
    connection: Connection,
    presenter: Presenter,
}

async fn cmd_simulate(config: &Config, plan: SimulationPlan) -> Result<()> {
    debug!(tabs = plan.tabs, slots = plan.slots, "cmd_simulate: called");
    let env = Environment::new(&config.origin);
    let collaborator = InMemoryCollaborator::new();
    let service = AdService::new(
        Arc::new(collaborator.clone()),
        config.liveness.clone(),
        env.events().clone(),
    );

    let mut display = config.display.clone();
    if display.app_key.is_empty() {
        display.app_key = "simulator".to_string();
    }

    let printer = tokio::spawn(print_events(env.events().subscribe(), plan.format));
    let renderer: Arc<dyn Renderer> = Arc::new(SimulatedRenderer {
        failure_rate: plan.failure_rate,
    });

    let mut open_tabs = Vec::with_capacity(plan.tabs);
    for t in 0..plan.tabs {
        let connection = connect(&env, &service, config)
            .await
            .with_context(|| format!("Failed to connect tab {}", t))?;
        let presenter = Presenter::start(
            connection.client().clone(),
            renderer.clone(),
            display.clone(),
            config.backoff.clone(),
            env.events().clone(),
        )
        .await?;
        for s in 0..plan.slots {
            presenter.prepare(AdspaceInput::new(format!("tab{}-slot{}", t, s), 300, 250))?;
        }
        if plan.format == OutputFormat::Text {
            println!("{} tab {} connected ({})", "+".green(), t, connection.mode());
        }
        open_tabs.push(Tab { connection, presenter });
    }

    let started = tokio::time::Instant::now();
    if let Some(after) = plan.close_tab_after
        && !open_tabs.is_empty()
    {
        tokio::time::sleep(after.min(plan.duration)).await;
        let tab = open_tabs.remove(0);
        if plan.format == OutputFormat::Text {
            println!("{} closing tab 0; its slots should be reclaimed", "-".red());
        }
        close_tab(tab).await;
    }
    tokio::time::sleep(plan.duration.saturating_sub(started.elapsed())).await;

    if plan.format == OutputFormat::Text {
        println!();
        println!("{}", "Summary".bold());
        println!("  offers issued: {}", collaborator.issued().await);
        println!("  slots unregistered: {:?}", collaborator.unregistered().await);
        for tab in &open_tabs {
            for slot in tab.presenter.status().await? {
                println!(
                    "  {:<14} {:<10} failures={} offer={}",
                    slot.uid,
                    format!("{:?}", slot.state),
                    slot.failures,
                    slot.offer_id.as_deref().unwrap_or("-")
                );
            }
        }
    }

    for tab in open_tabs {
        close_tab(tab).await;
    }
    printer.abort();
    Ok(())
}

async fn close_tab(tab: Tab) {
    if let Err(e) = tab.presenter.shutdown() {
        warn!(error = %e, "Presenter already stopped");
    }
    if let Err(e) = tab.connection.close().await {
        warn!(error = %e, "Failed to close tab");
    }
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<AxEvent>, format: OutputFormat) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let entry = EventLogEntry {
            timestamp: Utc::now(),
            event,
        };
        match format {
            OutputFormat::Json => match serde_json::to_string(&entry) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            OutputFormat::Text => println!("{}", describe(&entry)),
        }
    }
}

fn describe(entry: &EventLogEntry) -> String {
    let time = entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed();
    let name = entry.event.event_type();
    let label = match &entry.event {
        AxEvent::SlotAbandoned { .. } | AxEvent::MessageRejected { .. } => name.red(),
        AxEvent::RetryScheduled { .. } | AxEvent::OfferInvalidated { .. } => name.yellow(),
        AxEvent::OfferSettled { confirmed: true, .. } | AxEvent::InstanceElected { is_master: true, .. } => name.green(),
        AxEvent::LivenessTick { .. } => name.blue(),
        _ => name.cyan(),
    };
    let detail = match &entry.event {
        AxEvent::InstanceElected { instance_id, is_master } => {
            format!("{} {}", instance_id, if *is_master { "master" } else { "standby" })
        }
        AxEvent::MessageRejected { origin, via } => format!("origin={:?} via={}", origin, via),
        AxEvent::SlotRegistered { uid } | AxEvent::SlotUnregistered { uid } | AxEvent::SlotAbandoned { uid } => {
            uid.clone()
        }
        AxEvent::LivenessTick { slots } => format!("{} slots", slots),
        AxEvent::OfferIssued { uid, offer_id } => format!("{} -> {}", uid, offer_id),
        AxEvent::OfferSettled { offer_id, confirmed } => {
            format!("{} {}", offer_id, if *confirmed { "confirmed" } else { "cancelled" })
        }
        AxEvent::OfferInvalidated { offer_id } => offer_id.clone(),
        AxEvent::RetryScheduled {
            uid,
            failures,
            delay_ms,
        } => format!("{} failures={} retry in {}ms", uid, failures, delay_ms),
    };
    format!("{} {:<16} {}", time, label, detail)
}
