use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use plc_link::{DeviceLink, ModbusTcpLink, Register, SimulatedLink};
use plc_supervisor as sup;
use sup::{AuditLog, DeploymentConfig, DeviceRegistry, SupervisorContext, SupervisorMetrics};

#[derive(Parser, Debug)]
#[command(
    name = "plc",
    version,
    about = "PLC supervision CLI",
    disable_help_subcommand = true
)]
struct Cli {
    /// Deployment config (YAML)
    #[arg(
        long,
        env = "PLC_CONFIG",
        default_value = "configs/kum-site.yaml",
        global = true
    )]
    config: String,

    /// Use simulated links whose status register follows the command register
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate the config, list derived device ids
    Validate {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// List devices with address, commands and status labels
    Devices {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Connect everything and print status until Ctrl-C
    Run {
        /// Snapshot print interval
        #[arg(long, default_value_t = 1000u64)]
        status_every_ms: u64,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
        /// Dump prometheus metrics on exit
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Connect one device, write a command, disconnect
    Send {
        #[arg(long)]
        device: String,
        #[arg(long)]
        command: String,
        /// Override the profile's revert delay
        #[arg(long)]
        revert_ms: Option<u64>,
    },
    /// Decode a status byte with a device's labels
    Decode {
        #[arg(long)]
        device: String,
        /// Decimal, 0b... or 0x...
        #[arg(long)]
        status: String,
    },
    /// Recent audit rows from the sqlite trail
    History {
        #[arg(long)]
        device: String,
        #[arg(long, default_value_t = 20usize)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let cfg = sup::load_config_file(&cli.config)?;

    match cli.command {
        Commands::Validate { json } => validate(&cfg, json),
        Commands::Devices { json } => devices(&cfg, json),
        Commands::Run {
            status_every_ms,
            json,
            metrics,
        } => run(&cfg, cli.mock, status_every_ms, json, metrics),
        Commands::Send {
            device,
            command,
            revert_ms,
        } => send(&cfg, cli.mock, &device, &command, revert_ms),
        Commands::Decode { device, status } => decode(&cfg, &device, &status),
        Commands::History { device, limit } => history(&cfg, &device, limit),
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn validate(cfg: &DeploymentConfig, json: bool) -> Result<()> {
    cfg.validate()?;
    let planned = cfg.planned_devices();
    println!(
        "ok: {} profiles, {} devices",
        cfg.profiles.len(),
        planned.len()
    );
    for p in &planned {
        println!("{}\t{}\tprofile={}", p.id, p.address, p.profile);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(cfg)?);
    }
    Ok(())
}

fn devices(cfg: &DeploymentConfig, json: bool) -> Result<()> {
    cfg.validate()?;
    let mut rows = Vec::new();
    for p in cfg.planned_devices() {
        let profile = profile_of(cfg, &p.id)?;
        if json {
            rows.push(serde_json::json!({
                "id": p.id,
                "address": p.address,
                "profile": p.profile,
                "commands": profile.commands,
                "status_bits": profile.status_bits,
            }));
        } else {
            let commands: Vec<String> = profile
                .commands
                .iter()
                .map(|(name, pattern)| format!("{name}={pattern}"))
                .collect();
            let labels: Vec<String> = profile
                .status_bits
                .iter()
                .map(|(bit, label)| format!("{bit}:{label}"))
                .collect();
            println!(
                "{}\t{}\tcommands=[{}]\tstatus=[{}]",
                p.id,
                p.address,
                commands.join(", "),
                labels.join(", ")
            );
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

fn run(
    cfg: &DeploymentConfig,
    mock: bool,
    status_every_ms: u64,
    json: bool,
    metrics: bool,
) -> Result<()> {
    let hub = SupervisorMetrics::new().map_err(anyhow::Error::msg)?;
    let ctx = context(cfg)?.with_metrics(hub.clone());
    let reg = DeviceRegistry::from_config(cfg, &link_factory(cfg, mock), &ctx)?;

    let report = reg.connect_all();
    for (id, err) in &report.failed {
        warn!(device = %id, error = %err, "not connected");
    }
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "supervising; Ctrl-C to stop"
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    rt.block_on(async {
        let mut tick = tokio::time::interval(Duration::from_millis(status_every_ms.max(1)));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tick.tick() => print_snapshots(&reg, json)?,
            }
        }
        Ok::<_, anyhow::Error>(())
    })?;

    info!("shutting down");
    reg.disconnect_all();
    if metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}

fn print_snapshots(reg: &DeviceRegistry, json: bool) -> Result<()> {
    let snaps = reg.snapshots();
    if json {
        println!("{}", serde_json::to_string(&snaps)?);
        return Ok(());
    }
    for s in &snaps {
        let lit: Vec<&str> = s
            .indicators
            .iter()
            .filter(|i| i.active)
            .map(|i| i.label.as_str())
            .collect();
        println!(
            "{}\t{}\t0b{:08b}\t[{}]",
            s.id,
            s.connection,
            s.status,
            lit.join(", ")
        );
    }
    Ok(())
}

fn send(
    cfg: &DeploymentConfig,
    mock: bool,
    device: &str,
    command: &str,
    revert_ms: Option<u64>,
) -> Result<()> {
    let ctx = context(cfg)?;
    let reg = DeviceRegistry::from_config(cfg, &link_factory(cfg, mock), &ctx)?;
    let dev = reg
        .get(device)
        .ok_or_else(|| anyhow::anyhow!("unknown device: {device}"))?;
    let delay = revert_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| dev.profile().revert_delay());

    dev.connect()?;
    let sent = dev.write_command(command, delay);
    if sent.is_ok() && dev.profile().is_momentary(command) {
        // let the revert land before closing the link
        thread::sleep(delay + Duration::from_millis(50));
    }
    dev.disconnect();
    sent?;
    println!("ok: {device} <- {command}");
    Ok(())
}

fn decode(cfg: &DeploymentConfig, device: &str, status: &str) -> Result<()> {
    let profile = profile_of(cfg, device)?;
    let value = parse_status(status)?;
    for ind in sup::decode(value, &profile.status_bits) {
        println!("{}\t{}", if ind.active { "on" } else { "off" }, ind.label);
    }
    Ok(())
}

fn history(cfg: &DeploymentConfig, device: &str, limit: usize) -> Result<()> {
    let path = cfg
        .audit
        .sqlite_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("config has no audit.sqlite_path"))?;
    let log = sup::SqliteAuditLog::open(path).with_context(|| format!("opening {path}"))?;
    for rec in log.recent_lifecycle_events(device, limit)? {
        if let sup::AuditEntry::Lifecycle { event } = rec.entry {
            println!("{}\tlifecycle\t{event}", rec.ts);
        }
    }
    for rec in log.recent_status_changes(device, limit)? {
        if let sup::AuditEntry::StatusChange { status } = rec.entry {
            println!("{}\tstatus\t0b{status:08b}", rec.ts);
        }
    }
    Ok(())
}

fn context(cfg: &DeploymentConfig) -> Result<SupervisorContext> {
    let audit: Arc<dyn AuditLog> = match cfg.audit.sqlite_path.as_deref() {
        Some(path) => Arc::new(
            sup::SqliteAuditLog::open(path).with_context(|| format!("opening audit db {path}"))?,
        ),
        None => Arc::new(sup::TracingAuditLog),
    };
    Ok(SupervisorContext::new(audit).with_timing(cfg.supervisor.timing()))
}

/// Simulated links mirror each device's command register into its status
/// register; real links speak Modbus TCP.
fn link_factory(cfg: &DeploymentConfig, mock: bool) -> impl Fn(&str, &str) -> Box<dyn DeviceLink> {
    let registers: HashMap<String, (Register, Register)> = cfg
        .planned_devices()
        .into_iter()
        .filter_map(|p| {
            cfg.profiles
                .get(&p.profile)
                .map(|prof| (p.id, (prof.command_register, prof.status_register)))
        })
        .collect();
    move |id: &str, _address: &str| -> Box<dyn DeviceLink> {
        if mock {
            let (command, status) = registers
                .get(id)
                .copied()
                .unwrap_or((Register::COMMAND, Register::STATUS));
            Box::new(SimulatedLink::new().with_mirror(command, status))
        } else {
            Box::new(ModbusTcpLink::new())
        }
    }
}

fn profile_of<'a>(cfg: &'a DeploymentConfig, device: &str) -> Result<&'a sup::DeviceProfile> {
    let planned = cfg
        .planned_devices()
        .into_iter()
        .find(|p| p.id == device)
        .ok_or_else(|| anyhow::anyhow!("unknown device: {device}"))?;
    cfg.profiles
        .get(&planned.profile)
        .ok_or_else(|| anyhow::anyhow!("{device}: unknown profile {}", planned.profile))
}

fn parse_status(s: &str) -> Result<u8> {
    let t = s.trim().replace('_', "");
    let parsed = if let Some(bin) = t.strip_prefix("0b") {
        u8::from_str_radix(bin, 2)
    } else if let Some(hex) = t.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        t.parse::<u8>()
    };
    parsed.with_context(|| format!("invalid status byte: {s}"))
}
