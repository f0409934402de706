use log::{info, warn};
use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use sgpio::{AppConfig, Edge, Epoll, EventBus, Line, Sysfs};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SGPIO_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let sysfs = config
        .sysfs_root
        .as_deref()
        .map(Sysfs::new)
        .unwrap_or_default();
    let epoll = Epoll::global().unwrap_or_else(|e| panic!("Failed to start reactor: {e}"));
    let bus = Arc::new(EventBus::new(
        config.lines.iter().map(|l| l.id),
        config.broadcast_capacity,
        config.event_history_capacity,
    ));

    let mut events = BroadcastStream::new(bus.subscribe());
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(text) => info!("{text}"),
                    Err(e) => warn!("Failed to encode event: {e}"),
                },
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("Event stream lagged by {n} messages")
                }
            }
        }
    });

    let mut lines = Vec::with_capacity(config.lines.len());
    for line_cfg in &config.lines {
        let line = Line::open(&sysfs, epoll.clone(), epoll.clone(), line_cfg.clone())
            .map(Arc::new)
            .unwrap_or_else(|e| panic!("Failed to open gpio{}: {e}", line_cfg.id));

        if line_cfg.edge.is_some_and(|edge| edge != Edge::None) {
            bus.watch(&line)
                .unwrap_or_else(|e| panic!("Failed to watch gpio{}: {e}", line.id()));
            info!("Watching gpio{} ({:?})", line.id(), line.policy());
        }
        lines.push(line);
    }

    info!("Monitoring {} lines under {}...", lines.len(), sysfs.root().display());
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    bus.close();
    for line in lines {
        let id = line.id();
        if let Err(e) = line.unwatch_all() {
            warn!("Failed to unwatch gpio{id}: {e}");
        }
        if config.unexport_on_exit {
            match Arc::try_unwrap(line) {
                Ok(line) => {
                    if let Err(e) = line.unexport() {
                        warn!("Failed to unexport gpio{id}: {e}");
                    }
                }
                Err(_) => warn!("gpio{id} still in use, leaving it exported"),
            }
        }
    }
    reporter.abort();

    Ok(())
}
