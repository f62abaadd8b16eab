//! RESP TCP front end.
//!
//! One accept loop, one task per connection. Each connection accumulates
//! bytes, parses complete requests (inline or array-framed), dispatches them
//! through the [`CommandHandler`] and writes exactly one reply per request,
//! in arrival order.
//!
//! `run` owns the whole server lifecycle: it wires the background tasks
//! (LSM maintenance, write-back worker, metrics, Raft ticker/applier) onto a
//! scheduler, serves until the shutdown trigger fires, then drains — tasks
//! first, then the cache manager (final dirty flush), then the engine.

pub mod handler;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::lsm::{LsmEngine, LsmMaintenanceTask};
use crate::manager::worker::WriteBackTask;
use crate::manager::{CacheManager, WriteMode};
use crate::metrics::{LogObserver, MetricsObserver, MetricsTask};
use crate::raft::node::{RaftApplierTask, RaftNode, RaftTickerTask};
use crate::resp;
use crate::tasks::Scheduler;
use handler::CommandHandler;

pub struct Server {
    config: Config,
    engine: Arc<LsmEngine>,
    manager: Arc<CacheManager>,
    raft: Option<Arc<RaftNode>>,
    observer: Arc<dyn MetricsObserver>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Builds the storage engine and cache manager from the configuration.
    pub fn new(config: Config) -> crate::error::Result<Self> {
        let engine = Arc::new(LsmEngine::open(config.lsm())?);
        let manager = CacheManager::new(
            config.cache_capacity,
            config.segments,
            config.write_mode,
            engine.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            engine,
            manager,
            raft: None,
            observer: Arc::new(LogObserver),
            shutdown_tx,
        })
    }

    /// Attaches a Raft node: writes go through proposals and committed
    /// entries are applied to the cache manager.
    pub fn raft(mut self, node: Arc<RaftNode>) -> Self {
        let manager = self.manager.clone();
        node.set_apply(Box::new(move |_, command| {
            handler::apply_command(&manager, command);
        }));
        self.raft = Some(node);
        self
    }

    pub fn metrics_observer(mut self, observer: Arc<dyn MetricsObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Cloneable trigger; sending on it starts a graceful shutdown.
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Serves until the shutdown trigger fires, then drains everything.
    pub async fn run(self) -> crate::error::Result<()> {
        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(LsmMaintenanceTask::new(self.engine.clone())));
        if self.config.write_mode == WriteMode::WriteBack {
            scheduler.register(Arc::new(WriteBackTask::new(
                self.manager.clone(),
                self.config.flush_interval,
            )));
        }
        scheduler.register(Arc::new(MetricsTask::new(
            self.manager.clone(),
            Some(self.engine.clone()),
            self.observer.clone(),
            self.config.metrics_interval,
        )));
        if let Some(node) = &self.raft {
            scheduler.register(Arc::new(RaftTickerTask::new(node.clone())));
            scheduler.register(Arc::new(RaftApplierTask::new(node.clone())));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        tracing::info!(
            port = self.config.listen_port,
            write_mode = self.config.write_mode.as_str(),
            capacity = self.config.cache_capacity,
            segments = self.config.segments,
            "Cache server listening"
        );

        let handler = Arc::new(CommandHandler::new(
            self.manager.clone(),
            Some(self.engine.clone()),
            self.raft.clone(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Client connected");
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, handler).await;
                            tracing::debug!(%peer, "Client disconnected");
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept() failed");
                    }
                },

                _ = shutdown_rx.recv() => break,
            }
        }
        drop(listener);

        tracing::info!("Shutting down: draining background tasks");
        scheduler.shutdown().await?;
        self.manager.shutdown();
        self.engine.close()?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, handler: Arc<CommandHandler>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buffer.extend_from_slice(&chunk[..n]);

        // Drain every complete request in the buffer, in order.
        loop {
            match resp::parse(&buffer) {
                Ok(Some((tokens, consumed))) => {
                    buffer.drain(..consumed);
                    if tokens.is_empty() {
                        continue; // blank inline line
                    }
                    let reply = handler.execute(&tokens);
                    if stream.write_all(&reply.data).await.is_err() {
                        return;
                    }
                    if reply.close {
                        let _ = stream.shutdown().await;
                        return;
                    }
                }
                Ok(None) => break, // need more bytes
                Err(e) => {
                    // Unrecoverable framing: report and drop the connection.
                    let _ = stream.write_all(&resp::error(&e.to_string())).await;
                    let _ = stream.shutdown().await;
                    return;
                }
            }
        }
    }
}
