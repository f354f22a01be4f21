//! `flm` entry point: command dispatch and process-level setup.

mod args;
mod bench;
mod repl;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flm_engine::catalog::ModelCatalog;
use flm_engine::{EngineRuntime, ModelDownloader, FLM_VERSION};
use flm_npu::{DeviceManager, NpuGeneration, PowerMode};
use flm_server::{Server, ServerConfig, ServerState};

use args::{Cli, Command};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    std::process::exit(match run(cli) {
        Ok(()) => 0,
        Err(message) => {
            eprintln!("[ERROR] {message}");
            1
        }
    });
}

fn open_catalog() -> Result<Arc<ModelCatalog>, String> {
    let list_path = ModelCatalog::locate_config()
        .ok_or_else(|| "model_list.json not found (set FLM_CONFIG_PATH)".to_string())?;
    let root = ModelCatalog::default_model_root();
    std::fs::create_dir_all(&root)
        .map_err(|e| format!("cannot create model directory {}: {e}", root.display()))?;
    let catalog = ModelCatalog::load(&list_path, root).map_err(|e| e.to_string())?;
    Ok(Arc::new(catalog))
}

fn open_device(pmode: &str, preemption: bool) -> Result<Arc<DeviceManager>, String> {
    let power_mode: PowerMode = pmode.parse()?;
    info!("configuring NPU power mode: {}", power_mode.as_str());
    if preemption {
        info!("allowing high priority tasks to preempt flm");
    }
    DeviceManager::new(0, NpuGeneration::Npu2, power_mode, preemption)
        .map(Arc::new)
        .map_err(|e| format!("cannot open the NPU device: {e}"))
}

fn check_tag(catalog: &ModelCatalog, tag: &str) -> Result<(), String> {
    if !catalog.is_supported(tag) {
        return Err(format!(
            "Model not found: {tag}; Please check with `flm list` and try again."
        ));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Run {
            tag,
            ctx_len,
            preemption,
            asr,
            pmode,
        } => {
            let catalog = open_catalog()?;
            check_tag(&catalog, &tag)?;
            let device = open_device(&pmode, preemption)?;
            repl::run(catalog, device, &tag, ctx_len, asr)
        }

        Command::Serve {
            tag,
            host,
            port,
            max_connections,
            max_npu_queue,
            cors,
            ctx_len,
            preemption,
            pmode,
        } => {
            let catalog = open_catalog()?;
            if let Some(tag) = tag.as_deref() {
                check_tag(&catalog, tag)?;
            }
            let power_mode: PowerMode = pmode.parse()?;
            info!("configuring NPU power mode: {}", power_mode.as_str());
            if preemption {
                info!("allowing high priority tasks to preempt flm");
            }
            // The device opens on the first model load, not at bind time.
            let engine = EngineRuntime::deferred(power_mode, preemption, catalog.clone(), ctx_len);
            let config = ServerConfig {
                host,
                port: ModelCatalog::serve_port(port),
                cors,
                max_connections,
                max_npu_queue,
                default_model: tag.unwrap_or_default(),
                ..Default::default()
            };
            let io_threads = config.io_threads;
            let port = config.port;
            let state = ServerState::new(config, catalog, engine);
            let server = Server::new(state);

            info!("starting server on port {port}...");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(io_threads)
                .enable_all()
                .build()
                .map_err(|e| format!("cannot start the I/O runtime: {e}"))?;
            runtime
                .block_on(server.run())
                .map_err(|e| format!("server failed: {e}"))
        }

        Command::Pull { tag, force } => {
            let catalog = open_catalog()?;
            check_tag(&catalog, &tag)?;
            let downloader = ModelDownloader::new(catalog.clone());
            if !force && downloader.is_downloaded(&tag) {
                println!("Model is already downloaded.");
                return Ok(());
            }
            downloader.pull(&tag, force).map_err(|e| e.to_string())
        }

        Command::Remove { tag } => {
            let catalog = open_catalog()?;
            check_tag(&catalog, &tag)?;
            ModelDownloader::new(catalog.clone())
                .remove(&tag)
                .map_err(|e| e.to_string())
        }

        Command::List { filter, quiet, json } => {
            if !matches!(filter.as_str(), "all" | "installed" | "not-installed") {
                return Err("Invalid filter: please use 'all', 'installed', or 'not-installed'".into());
            }
            let catalog = open_catalog()?;
            let downloader = ModelDownloader::new(catalog.clone());
            let mut rows = Vec::new();
            for tag in catalog.all_model_tags() {
                let installed = downloader.is_downloaded(&tag);
                let visible = match filter.as_str() {
                    "installed" => installed,
                    "not-installed" => !installed,
                    _ => true,
                };
                if visible {
                    rows.push((tag, installed));
                }
            }
            if json {
                let body: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|(tag, installed)| {
                        serde_json::json!({ "name": tag, "installed": installed })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(body));
            } else {
                println!("Models:");
                for (tag, installed) in rows {
                    if quiet {
                        println!("  - {tag}");
                    } else {
                        println!("  - {tag} {}", if installed { "✅" } else { "⏬" });
                    }
                }
            }
            Ok(())
        }

        Command::Bench { tag, prompt } => {
            let catalog = open_catalog()?;
            check_tag(&catalog, &tag)?;
            bench::run(catalog, &tag, prompt.as_deref())
        }

        Command::Version { json } => {
            if json {
                println!("{}", serde_json::json!({ "version": FLM_VERSION }));
            } else {
                println!("FLM v{FLM_VERSION}");
            }
            Ok(())
        }

        Command::Port => {
            println!("Default server port: {}", ModelCatalog::serve_port(None));
            Ok(())
        }
    }
}
