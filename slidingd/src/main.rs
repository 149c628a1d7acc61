mod command;
mod config;
mod connection;
mod error;
mod resp;
mod settings;

use config::Config;
use slidingd_store::SetManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().map_err(anyhow::Error::msg)?;

    let config = Config::from_args()?;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.worker_threads.get())
        .build()?
        .block_on(async { tokio::spawn(serve(config)).await })?
        .map_err(Into::into)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let manager = SetManager::new(config.store_config()?, true)?;
    let listener = TcpListener::bind((config.bind, config.port)).await?;
    tracing::info!("bound to {}", listener.local_addr()?);

    let shared = Arc::new(Shared {
        manager: manager.clone(),
        conn_limit: Arc::new(Semaphore::new(config.max_clients)),
    });

    spawn_flusher(manager.clone(), Duration::from_secs(config.flush_interval.max(1)));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, addr) = accepted?;
                tracing::trace!("accepting connection: {}", addr);
                let shared = shared.clone();
                tokio::spawn(async move {
                    let _ = connection::serve(shared, conn).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                let manager = manager.clone();
                tokio::task::spawn_blocking(move || manager.shutdown()).await?;
                return Ok(());
            }
        }
    }
}

fn spawn_flusher(manager: Arc<SetManager>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let manager = manager.clone();
            if tokio::task::spawn_blocking(move || manager.flush_all())
                .await
                .is_err()
            {
                tracing::error!("background flush panicked");
            }
        }
    });
}

pub struct Shared {
    pub manager: Arc<SetManager>,
    pub conn_limit: Arc<Semaphore>,
}
