use anyhow::Context;
use log::info;

use legacy_bridge::canonical::{CanonicalStore, SyncEngine};
use legacy_bridge::config::{RunConfig, SourceConfig};
use legacy_bridge::parity::ParityChecker;
use legacy_bridge::report::summarize_run;
use legacy_bridge::source::LegacySource;

const USAGE: &str = "usage: legacy-bridge <sync [--bootstrap] | dry-run | parity <code>...>
environment: LEGACY_DB (legacy source path), BRIDGE_DB (canonical store path),
             SOURCE_SYSTEM (optional, default legacy_pms)";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let source_config = SourceConfig {
        database: std::env::var("LEGACY_DB").context("LEGACY_DB is not set")?,
        source_system: std::env::var("SOURCE_SYSTEM").unwrap_or_else(|_| "legacy_pms".to_string()),
        ..SourceConfig::default()
    };
    let store_path = std::env::var("BRIDGE_DB").context("BRIDGE_DB is not set")?;

    let run_config = RunConfig {
        bootstrap: args.iter().any(|a| a == "--bootstrap"),
        ..RunConfig::default()
    };

    let src = LegacySource::open(&source_config, run_config.retry)?;
    let store = CanonicalStore::open(&store_path)?;
    info!(
        "connected: source {} -> store {store_path}",
        source_config.database
    );

    match command {
        "sync" => {
            let engine = SyncEngine::new(&src, &store, &run_config, &source_config.source_system);
            let summary = summarize_run(engine.sync_all());
            println!("{}", serde_json::to_string_pretty(&summary)?);
            std::process::exit(summary.status.exit_code());
        }
        "dry-run" => {
            let engine = SyncEngine::new(&src, &store, &run_config, &source_config.source_system);
            let report = engine.dry_run()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "parity" => {
            let codes: Vec<i64> = args[1..]
                .iter()
                .map(|raw| raw.parse().with_context(|| format!("bad code '{raw}'")))
                .collect::<anyhow::Result<_>>()?;
            if codes.is_empty() {
                anyhow::bail!("parity needs at least one patient code");
            }
            let checker =
                ParityChecker::new(&src, &store, &run_config, &source_config.source_system);
            let report = checker.check_codes(&codes)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            std::process::exit(i32::from(!report.passed()));
        }
        other => {
            eprintln!("unknown command '{other}'\n{USAGE}");
            std::process::exit(2);
        }
    }
}
