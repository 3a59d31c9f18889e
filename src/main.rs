use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use tailcast::server::{self, AppState};
use tailcast::{BroadcastHub, HubConfig, NotifyWatcher, TailMonitor, DEFAULT_QUEUE_CAPACITY};

/// Stream lines appended to files to websocket viewers.
#[derive(Debug, Parser)]
#[command(name = "tailcast", version)]
struct Args {
    /// Files to tail
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Address to accept viewers on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Lines of each file sent to a viewer when it connects
    #[arg(long, default_value_t = 10)]
    lines: usize,

    /// Frames a viewer may fall behind by before it is disconnected
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, value_parser = parse_capacity)]
    queue_capacity: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_capacity(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl Args {
    /// Every path has to be an existing regular file.
    fn validate(&self) -> Result<()> {
        for path in &self.paths {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("cannot tail {}", path.display()))?;
            if !meta.is_file() {
                bail!("cannot tail {}: not a regular file", path.display());
            }
        }
        Ok(())
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "tailcast=debug,info"
    } else {
        "tailcast=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;

    init_logging(args.debug);

    let hub = BroadcastHub::spawn(HubConfig {
        queue_capacity: args.queue_capacity,
        ..HubConfig::default()
    });

    for path in &args.paths {
        let watcher = NotifyWatcher::new().context("failed to create file watcher")?;
        let mut monitor = TailMonitor::new(path.clone(), watcher);

        // A file that cannot be watched is dropped; the others carry on.
        if let Err(e) = monitor.start().await {
            error!(path = %path.display(), "cannot monitor file: {}", e);
            continue;
        }
        monitor.spawn(hub.clone());
    }

    let state = AppState {
        hub,
        paths: Arc::new(args.paths.clone()),
        snapshot_lines: args.lines,
    };

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Listening for viewers on ws://{}/ws", args.listen);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["tailcast", "a.log", "b.log"]).unwrap();
        assert_eq!(args.paths, vec![PathBuf::from("a.log"), PathBuf::from("b.log")]);
        assert_eq!(args.listen, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(args.lines, 10);
        assert_eq!(args.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(!args.debug);
    }

    #[test]
    fn test_args_rejects_bad_input() {
        assert!(Args::try_parse_from(["tailcast"]).is_err());
        assert!(Args::try_parse_from(["tailcast", "--queue-capacity", "0", "a.log"]).is_err());
        assert!(Args::try_parse_from(["tailcast", "--listen", "nope", "a.log"]).is_err());
    }

    #[test]
    fn test_validate_paths() {
        let tmp_dir = tempdir().unwrap();
        let file = tmp_dir.path().join("app.log");
        std::fs::write(&file, b"").unwrap();

        let ok = Args::try_parse_from(["tailcast", file.to_str().unwrap()]).unwrap();
        assert!(ok.validate().is_ok());

        let dir = Args::try_parse_from(["tailcast", tmp_dir.path().to_str().unwrap()]).unwrap();
        assert!(dir.validate().is_err());

        let missing = tmp_dir.path().join("missing.log");
        let missing = Args::try_parse_from(["tailcast", missing.to_str().unwrap()]).unwrap();
        assert!(missing.validate().is_err());
    }
}
