use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Event, Response};
use crate::scheduler::Scheduler;

const REQUEST_CHANNEL_CAPACITY: usize = 1024;

/// An inbound event together with the slot its response goes to.
pub struct Request {
    pub event: Event,
    pub reply: oneshot::Sender<Response>,
}

/// Sending side handed to the transport layer.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<Request>,
}

impl ServerHandle {
    /// Submit an event and wait for its response. `None` once the server stopped.
    pub async fn call(&self, event: Event) -> Option<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Request { event, reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Event loop around a [`Scheduler`].
pub struct Server {
    scheduler: Arc<Scheduler>,
    requests: mpsc::Receiver<Request>,
}

impl Server {
    pub fn new(scheduler: Arc<Scheduler>) -> (Self, ServerHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        (
            Self {
                scheduler,
                requests,
            },
            ServerHandle { tx },
        )
    }

    /// Run until `shutdown` is cancelled or every handle is dropped.
    ///
    /// 1. Each request is handled on its own task, so reports for different
    ///    jobs are folded concurrently.
    /// 2. On every refresh tick, renders past their heartbeat window are
    ///    failed over and the refresh sweep runs.
    /// 3. On shutdown, requests still in flight are allowed to finish.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let refresh_ms = self.scheduler.config().refresh_interval_ms.max(1);
        let mut refresh_interval = tokio::time::interval(Duration::from_millis(refresh_ms));
        let mut in_flight = tokio::task::JoinSet::new();
        tracing::info!(refresh_ms, "Scheduler server started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping event loop");
                    break;
                }

                request = self.requests.recv() => {
                    let Some(Request { event, reply }) = request else {
                        tracing::info!("All handles dropped, stopping event loop");
                        break;
                    };
                    let scheduler = self.scheduler.clone();
                    in_flight.spawn(async move {
                        let response = scheduler.handle(event, Utc::now()).await;
                        // The caller may have given up waiting.
                        let _ = reply.send(response);
                    });
                }

                _ = refresh_interval.tick() => {
                    let now = Utc::now();
                    let offline = self.scheduler.check_renders(now).await;
                    if !offline.is_empty() {
                        tracing::warn!(renders = ?offline, "Renders marked offline");
                    }
                    self.scheduler.refresh(now).await;
                }

                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Request task failed");
                    }
                }
            }
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Request task failed");
            }
        }
        tracing::info!("Scheduler server stopped");
    }
}
