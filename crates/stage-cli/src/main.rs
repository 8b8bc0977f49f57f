use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use stage_core::StageConfig;
use stage_overlay::{fetcher_for_root, OverlayFs, PathResolver};
use stage_session::{export_file, load_params, LaunchPlan};
use stage_vfs::{create_dir_all, FileKind, LocalFs, MemFs};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod serve;

const LOG_ENV: &str = "STAGE_LOG";

#[derive(Parser)]
#[command(name = "stage", version = "0.3.0", about = "Lazy content-root overlay tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory as a content root.
    Serve {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },
    /// Materialize paths from a content root and copy them out.
    Mirror {
        #[arg(long)]
        root: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration and launch plan.
    Describe {
        #[arg(long)]
        params: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Serve { dir, port, bind } => {
            serve_until_interrupted(&bind, port, dir)?;
            Ok(None)
        }
        Commands::Mirror {
            root,
            out,
            paths,
            json,
        } => {
            let config = StageConfig::from_env()?.with_content_root(root);
            config.validate()?;
            let report = mirror(&config, &out, &paths)?;
            if json {
                return Ok(Some(report));
            }
            print_mirror_report(&report);
            Ok(None)
        }
        Commands::Describe { params, json } => {
            let payload = describe(params.as_deref())?;
            if json {
                return Ok(Some(payload));
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("serialize description")?
            );
            Ok(None)
        }
    }
}

fn serve_until_interrupted(bind: &str, port: u16, dir: PathBuf) -> Result<()> {
    let server = serve::ContentServer::start(bind, port, dir.clone())?;
    println!("serving {} at {}", dir.display(), server.endpoint);

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("install ctrl-c handler")?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    info!("shutting down content server");
    server.stop();
    Ok(())
}

/// Stats every path through a fresh overlay, then writes each materialized
/// entry below `out`. Entry paths are relative to the working root, which is
/// also the overlay's cwd.
fn mirror(config: &StageConfig, out: &Path, paths: &[String]) -> Result<Value> {
    let overlay = OverlayFs::new(
        MemFs::new(),
        PathResolver::new(&config.working_root, &config.content_root),
        fetcher_for_root(config)?,
    );
    create_dir_all(overlay.inner(), &config.working_root)?;
    overlay.chdir(&config.working_root)?;

    let mut missing = Vec::new();
    for path in paths {
        if let Err(err) = overlay.stat(path) {
            info!(path = %path, error = %err, "path not available");
            missing.push(path.clone());
        }
    }

    fs::create_dir_all(out).with_context(|| format!("create {}", out.display()))?;
    let entries = overlay.entries();
    for entry in &entries {
        let target = out.join(&entry.path);
        match entry.kind {
            FileKind::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("create {}", target.display()))?;
            }
            FileKind::File => {
                let exported = export_file(&overlay, &entry.path)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                fs::write(&target, &exported.bytes)
                    .with_context(|| format!("write {}", target.display()))?;
            }
        }
    }

    Ok(json!({
        "ok": true,
        "content_root": config.content_root,
        "out": out.display().to_string(),
        "fetch_count": overlay.fetch_count(),
        "entries": entries,
        "missing": missing,
    }))
}

fn describe(params_path: Option<&Path>) -> Result<Value> {
    let mut config = StageConfig::from_env()?;
    let plan = match params_path {
        Some(path) => {
            let params = load_params(path)?;
            if params.root.is_some() {
                config = config.with_content_root(params.content_root());
                config.validate()?;
            }
            Some(LaunchPlan::from_params(&params)?)
        }
        None => None,
    };
    Ok(json!({
        "ok": true,
        "config": config,
        "plan": plan,
    }))
}

fn print_mirror_report(report: &Value) {
    let entries = report["entries"].as_array().cloned().unwrap_or_default();
    for entry in &entries {
        println!(
            "{:<9} {:>8}  {}",
            entry["kind"].as_str().unwrap_or("?"),
            entry["size"].as_u64().unwrap_or(0),
            entry["path"].as_str().unwrap_or("")
        );
    }
    if let Some(missing) = report["missing"].as_array() {
        for path in missing {
            println!("missing            {}", path.as_str().unwrap_or(""));
        }
    }
    println!(
        "{} entries, {} fetches -> {}",
        entries.len(),
        report["fetch_count"].as_u64().unwrap_or(0),
        report["out"].as_str().unwrap_or("")
    );
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Serve { .. } => false,
        Commands::Mirror { json, .. } | Commands::Describe { json, .. } => *json,
    }
}
