//! tenthd - P10 mesh IRC daemon.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use tenthd::config::{Config, ConfigError};
use tenthd::engine::{self, Context};
use tenthd::error::FatalError;
use tenthd::net::{self, NetHandle};
use tenthd::stats::ServerStats;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `tenthd.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "tenthd.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

/// Holds the PID file for the process lifetime; removed on drop.
struct PidFile {
    path: String,
}

impl PidFile {
    /// Claim the PID file. A live claim by another process is a
    /// startup failure; a stale file (dead pid) is reclaimed.
    fn claim(path: &str) -> Result<PidFile, FatalError> {
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(PidFile {
                        path: path.to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if Path::new(&format!("/proc/{}", pid)).exists() => {
                            return Err(FatalError::PidFile {
                                path: path.to_string(),
                                detail: format!("held by running pid {}", pid),
                            });
                        }
                        _ => {
                            // Stale claim from a dead process.
                            if std::fs::remove_file(path).is_err() {
                                return Err(FatalError::PidFile {
                                    path: path.to_string(),
                                    detail: "stale file could not be removed".to_string(),
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    return Err(FatalError::PidFile {
                        path: path.to_string(),
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn run() -> Result<(), FatalError> {
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| match e {
        ConfigError::Io(source) => FatalError::ConfigUnreadable {
            path: config_path.clone(),
            source,
        },
        other => FatalError::ConfigParse(other),
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.server.log_format {
        tenthd::config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        tenthd::config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    let stats = Arc::new(ServerStats::new());
    let mut ctx = Context::new(config, stats);

    if ctx.features.maxclients > ctx.features.maxconnections {
        return Err(FatalError::Limits(format!(
            "MAXCLIENTS {} exceeds MAXCONNECTIONS {}",
            ctx.features.maxclients, ctx.features.maxconnections
        )));
    }

    let _pid_file = PidFile::claim(&ctx.config.server.pidfile.clone())?;

    let tls = match &ctx.config.tls {
        Some(tls_config) => Some(net::listener::load_tls(tls_config).map_err(|e| {
            FatalError::ConfigParse(ConfigError::Invalid(format!("tls: {}", e)))
        })?),
        None => None,
    };

    info!(
        server = %ctx.config.server.name,
        numeric = ctx.config.server.numeric,
        "starting tenthd"
    );

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(1024);
    let handle = NetHandle::new(event_tx, tls);
    ctx.net = Some(handle.clone());

    net::start_listeners(&ctx.config, handle)
        .await
        .map_err(|e| FatalError::Limits(format!("cannot bind listeners: {}", e)))?;

    engine::run(ctx, event_rx).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(fatal) = run().await {
        error!(error = %fatal, "fatal startup error");
        eprintln!("tenthd: {}", fatal);
        std::process::exit(fatal.exit_code());
    }
}
