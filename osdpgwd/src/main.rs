//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! osdpgwd - the OSDP gateway daemon. Reads a TOML configuration, brings a
//! [`osdp_gateway::Gateway`] up over LibOSDP-driven serial buses and runs
//! until told to stop.

mod codec;
mod config;
mod serial_channel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use daemonize::Daemonize;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use osdp_gateway::{
    Gateway, GatewayError, MemoryStore, Notification, Notifier,
};

use crate::codec::LibOsdpCodec;
use crate::config::DaemonConfig;

type Result<T> = anyhow::Result<T, anyhow::Error>;

/// Notifier that writes every payload to the log. Deployments with a real
/// consumer replace this with their own collaborator.
#[derive(Debug, Default)]
struct LogNotifier;

impl Notifier for LogNotifier {
    fn broadcast(&self, notification: Notification) -> core::result::Result<(), GatewayError> {
        match &notification {
            Notification::CardEvent { event, outcome } => log::info!(
                "card {} on reader {}: {}",
                event.card_number,
                event.reader_id,
                outcome.message
            ),
            Notification::PinEvent { event, outcome } => log::info!(
                "PIN entry ({} digits) on reader {}: {}",
                event.digits.len(),
                event.reader_id,
                outcome.message
            ),
            Notification::ReaderStatus(status) => log::info!(
                "reader {} {}{}",
                status.reader_name,
                if status.online { "online" } else { "offline" },
                status
                    .message
                    .as_deref()
                    .map(|m| format!(": {m}"))
                    .unwrap_or_default()
            ),
            Notification::ReaderConfigChanged { reader_id, change } => {
                log::info!("reader {reader_id} configuration changed: {change:?}")
            }
            Notification::Statistics(stats) => log::info!(
                "statistics: {} card / {} PIN events, {} failed, {} trace packet(s)",
                stats.card_events,
                stats.pin_events,
                stats.failed_events,
                stats.trace.total_packets
            ),
        }
        Ok(())
    }
}

fn init_logging(level: LevelFilter, file: Option<PathBuf>) -> Result<()> {
    let pattern = "{d(%Y-%m-%d %H:%M:%S %Z)(utc)} [{l}] {t}: {m}{n}";
    let config = match file {
        Some(path) => {
            let appender = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(pattern)))
                .build(path)?;
            Config::builder()
                .appender(Appender::builder().build("main", Box::new(appender)))
                .build(Root::builder().appender("main").build(level))?
        }
        None => {
            let appender = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(pattern)))
                .build();
            Config::builder()
                .appender(Appender::builder().build("main", Box::new(appender)))
                .build(Root::builder().appender("main").build(level))?
        }
    };
    log4rs::init_config(config)?;
    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("osdpgwd")
        .join("osdpgwd.toml")
}

async fn seed_and_build(config: &DaemonConfig) -> Result<Gateway> {
    let store = MemoryStore::new();
    let notifier = Arc::new(LogNotifier);
    let gateway = Gateway::new(
        LibOsdpCodec::new(),
        store,
        notifier,
        config.gateway_options(),
    );
    let readers = config.reader_configs()?;
    log::info!("configured readers:\n{}", config::describe(&readers));
    for reader in readers {
        gateway
            .readers()
            .create(reader)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(gateway)
}

async fn run_gateway(config: DaemonConfig) -> Result<()> {
    let gateway = seed_and_build(&config).await?;
    gateway.start().await.context("gateway start failed")?;

    wait_for_shutdown().await;
    log::info!("shutdown requested");
    gateway.stop().await.context("gateway stop failed")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn cmd_run(config: DaemonConfig, log_to_file: bool) -> Result<()> {
    let runtime_dir = config.runtime_dir();
    std::fs::create_dir_all(&runtime_dir)?;
    let log_file = log_to_file.then(|| runtime_dir.join("osdpgwd.log"));
    init_logging(config.log_level(), log_file)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_gateway(config))
}

fn cmd_start(config: DaemonConfig) -> Result<()> {
    let runtime_dir = config.runtime_dir();
    std::fs::create_dir_all(&runtime_dir)?;
    let daemon = Daemonize::new()
        .pid_file(runtime_dir.join("osdpgwd.pid"))
        .working_directory(&runtime_dir);
    daemon.start().context("daemonize failed")?;
    cmd_run(config, true)
}

fn cmd_stop(config: DaemonConfig) -> Result<()> {
    let pid_file = config.runtime_dir().join("osdpgwd.pid");
    let pid = std::fs::read_to_string(&pid_file)
        .with_context(|| format!("no pid file at {}", pid_file.display()))?;
    let pid: i32 = pid.trim().parse().context("malformed pid file")?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .context("cannot signal daemon")?;
    println!("sent SIGTERM to {pid}");
    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

fn cmd_check(config: DaemonConfig) -> Result<()> {
    let readers = config.reader_configs()?;
    // Cross-reader rules are enforced by the configuration service; run
    // them here so `check` catches what the daemon would reject at boot.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let gateway = seed_and_build(&config).await?;
        drop(gateway);
        Ok::<(), anyhow::Error>(())
    })?;
    println!("configuration OK ({} reader(s))", readers.len());
    print!("{}", config::describe(&readers));
    Ok(())
}

fn cmd_export(config: DaemonConfig) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let json = runtime.block_on(async {
        let gateway = seed_and_build(&config).await?;
        gateway
            .export_config()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
    })?;
    println!("{json}");
    Ok(())
}

fn main() -> Result<()> {
    let matches = Command::new("osdpgwd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OSDP reader gateway daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to osdpgwd.toml")
                .action(ArgAction::Set),
        )
        .subcommand_required(true)
        .subcommand(Command::new("run").about("Run in the foreground"))
        .subcommand(Command::new("start").about("Run as a daemon"))
        .subcommand(Command::new("stop").about("Stop a running daemon"))
        .subcommand(Command::new("check").about("Validate the configuration"))
        .subcommand(Command::new("export").about("Print the configuration as export JSON"))
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = DaemonConfig::load(&config_path)?;

    match matches.subcommand() {
        Some(("run", _)) => cmd_run(config, false),
        Some(("start", _)) => cmd_start(config),
        Some(("stop", _)) => cmd_stop(config),
        Some(("check", _)) => cmd_check(config),
        Some(("export", _)) => cmd_export(config),
        _ => bail!("unknown command"),
    }
}
