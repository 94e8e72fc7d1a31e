/*!
Command-line front end for the reconnaissance scan engine
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command, crate_version};
use tracing::info;
use tracing_subscriber::EnvFilter;

use recon_engine::{
    EngineConfig, ModuleRegistry, ScanController, ScanRequest, ScanStatus, ScanStore, SqliteStore,
    TargetKind,
};

mod modules;

fn comma_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn print_module_table(registry: &ModuleRegistry) {
    println!("{:<18} {:<8} {:<28} {}", "MODULE", "VERSION", "USE CASES", "CONSUMES");
    for descriptor in registry.all() {
        println!(
            "{:<18} {:<8} {:<28} {}",
            descriptor.name,
            descriptor.version,
            descriptor.use_cases.join(","),
            descriptor.consumes.join(","),
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("recon-scan")
        .version(crate_version!())
        .about("Event-driven OSINT reconnaissance scanner")
        .arg(
            Arg::new("target")
                .help("Seed target: domain, IP address, netblock, email address, ...")
                .value_name("TARGET"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .help("Scan name (defaults to the target)")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("kind")
                .short('k')
                .long("kind")
                .help("Pin the target kind (e.g. DOMAIN_NAME, NETBLOCK) instead of detecting it")
                .value_name("KIND"),
        )
        .arg(
            Arg::new("use-case")
                .short('u')
                .long("use-case")
                .help("Module use case: ALL, FOOTPRINT, INVESTIGATE or PASSIVE")
                .value_name("TAG")
                .default_value("ALL"),
        )
        .arg(
            Arg::new("enable")
                .short('m')
                .long("enable")
                .help("Comma-separated modules to run regardless of use case")
                .value_name("MODULES"),
        )
        .arg(
            Arg::new("disable")
                .short('x')
                .long("disable")
                .help("Comma-separated modules to exclude")
                .value_name("MODULES"),
        )
        .arg(
            Arg::new("db")
                .short('d')
                .long("db")
                .help("Path to the scan database")
                .value_name("PATH")
                .default_value("./recon.db"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Engine configuration file (TOML)")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .help("Abort the scan after this many seconds")
                .value_name("SECONDS"),
        )
        .arg(
            Arg::new("scan-id")
                .long("scan-id")
                .help("Relaunch an existing scan id against its persisted log")
                .value_name("ID"),
        )
        .arg(
            Arg::new("list-modules")
                .short('M')
                .long("list-modules")
                .help("List installed modules and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut registry = ModuleRegistry::new();
    modules::register_builtins(&mut registry)?;

    if matches.get_flag("list-modules") {
        print_module_table(&registry);
        return Ok(());
    }

    let target = matches
        .get_one::<String>("target")
        .ok_or("a target is required (or use --list-modules)")?
        .clone();
    let kind = matches
        .get_one::<String>("kind")
        .map(|k| k.parse::<TargetKind>())
        .transpose()?;

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::from_file(path).await?,
        None => EngineConfig::default(),
    };
    if let Some(seconds) = matches.get_one::<String>("timeout") {
        config.scan_timeout_ms = Some(seconds.parse::<u64>()? * 1000);
    }

    let store: Arc<dyn ScanStore> = Arc::new(SqliteStore::open(
        matches
            .get_one::<String>("db")
            .map(String::as_str)
            .unwrap_or("./recon.db"),
    )?);

    let request = ScanRequest {
        name: matches
            .get_one::<String>("name")
            .cloned()
            .unwrap_or_else(|| target.clone()),
        target,
        target_kind: kind,
        use_case: matches
            .get_one::<String>("use-case")
            .cloned()
            .unwrap_or_else(|| "ALL".to_string()),
        enable: comma_list(matches.get_one::<String>("enable")),
        disable: comma_list(matches.get_one::<String>("disable")),
        scan_id: matches.get_one::<String>("scan-id").cloned(),
        module_options: HashMap::new(),
    };

    let controller = ScanController::start(&registry, store, config, request).await?;
    info!(scan = %controller.scan_id(), "scan launched");

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.tick().await;
    let status = loop {
        tokio::select! {
            status = controller.wait() => break status?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; cancelling scan");
                controller.cancel();
            }
            _ = ticker.tick() => {
                let progress = controller.progress()?;
                info!(
                    events = progress.events_total,
                    in_flight = progress.in_flight,
                    elapsed_ms = progress.elapsed_ms,
                    "scan progress"
                );
            }
        }
    };

    let progress = controller.progress()?;
    info!(status = %status, events = progress.events_total, "scan ended");
    if status != ScanStatus::Finished {
        if let Some(reason) = controller.fatal_error() {
            eprintln!("scan failed: {reason}");
        }
        std::process::exit(1);
    }
    Ok(())
}
