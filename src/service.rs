//! Long-running distribution service.
//!
//! [`Fs5000Service`] moves a session into a background task that keeps the
//! meter in continuous read and publishes every sample through a
//! [`StreamBroadcaster`]. Whatever goes wrong on the link, the task stops
//! continuous read, waits `retry_delay` and starts again; only
//! [`Fs5000Service::shutdown`] or dropping the service ends it. Either way
//! the task runs the stop handshake before exiting.

use crate::broadcast::{DEFAULT_SUBSCRIBER_BUFFER, StreamBroadcaster, SubscriberId, Subscription};
use crate::device::Fs5000;
use crate::error::{Error, Result};
use crate::sample::Sample;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Pause between a link failure and the next start attempt.
    pub retry_delay: Duration,
    /// Queue depth of each subscriber.
    pub subscriber_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Starting continuous read.
    Connecting,
    Streaming,
    /// Waiting out the retry delay after a failure.
    Recovering,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub link: LinkState,
    pub samples: u64,
    pub recoveries: u64,
    pub subscribers: usize,
    pub last_error: Option<String>,
}

impl ServiceStatus {
    /// A first sample has been relayed.
    pub fn is_ready(&self) -> bool {
        self.samples > 0
    }
}

pub struct Fs5000Service<T: Transport = Box<dyn Transport>> {
    broadcaster: Arc<StreamBroadcaster>,
    status: Arc<watch::Sender<ServiceStatus>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Fs5000<T>>>,
}

impl<T: Transport + 'static> Fs5000Service<T> {
    /// Take ownership of `device` and start relaying.
    pub fn spawn(device: Fs5000<T>, config: ServiceConfig) -> Self {
        let broadcaster = Arc::new(StreamBroadcaster::new(config.subscriber_buffer));
        let (status, _) = watch::channel(ServiceStatus {
            link: LinkState::Connecting,
            samples: 0,
            recoveries: 0,
            subscribers: 0,
            last_error: None,
        });
        let status = Arc::new(status);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            device,
            Arc::clone(&broadcaster),
            Arc::clone(&status),
            config,
            cancel.clone(),
        ));
        Self {
            broadcaster,
            status,
            cancel,
            task: Some(task),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.refresh_subscribers();
        self.status.borrow().clone()
    }

    /// Watch status changes: link transitions, relayed samples and
    /// subscriber churn.
    pub fn status_changes(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    fn refresh_subscribers(&self) {
        refresh_subscribers(&self.status, &self.broadcaster);
    }

    /// Last relayed sample. It survives reconnects; `None` means not ready yet.
    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.broadcaster.latest()
    }

    pub fn subscribe(&self) -> Subscription {
        let subscription = self.broadcaster.subscribe();
        self.refresh_subscribers();
        subscription
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.broadcaster.unsubscribe(id);
        self.refresh_subscribers();
        removed
    }

    pub fn broadcaster(&self) -> &Arc<StreamBroadcaster> {
        &self.broadcaster
    }

    /// Stop relaying, leave continuous read and hand the session back.
    pub async fn shutdown(mut self) -> Result<Fs5000<T>> {
        info!("Shutting down FS5000 service");
        self.cancel.cancel();
        let task = self.task.take().ok_or(Error::StreamClosed)?;
        task.await
            .map_err(|e| Error::Transport(format!("service task failed: {e}")))
    }
}

impl<T: Transport> Drop for Fs5000Service<T> {
    fn drop(&mut self) {
        if self.task.is_some() {
            debug!("FS5000 service dropped, stopping continuous read in the background");
        }
        self.cancel.cancel();
    }
}

fn refresh_subscribers(status: &watch::Sender<ServiceStatus>, broadcaster: &StreamBroadcaster) {
    let count = broadcaster.subscriber_count();
    status.send_if_modified(|s| {
        let changed = s.subscribers != count;
        s.subscribers = count;
        changed
    });
}

async fn pump<T: Transport>(
    mut device: Fs5000<T>,
    broadcaster: Arc<StreamBroadcaster>,
    status: Arc<watch::Sender<ServiceStatus>>,
    config: ServiceConfig,
    cancel: CancellationToken,
) -> Fs5000<T> {
    while !cancel.is_cancelled() {
        status.send_modify(|s| s.link = LinkState::Connecting);
        match relay(&mut device, &broadcaster, &status, &cancel).await {
            Ok(()) => break,
            Err(e) => {
                error!(error = %e, retry_in = ?config.retry_delay, "Sample relay failed");
                status.send_modify(|s| {
                    s.link = LinkState::Recovering;
                    s.recoveries += 1;
                    s.last_error = Some(e.to_string());
                });
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }
    status.send_modify(|s| s.link = LinkState::Stopped);
    device
}

/// One continuous-read cycle. Always ends with a stop attempt.
async fn relay<T: Transport>(
    device: &mut Fs5000<T>,
    broadcaster: &StreamBroadcaster,
    status: &watch::Sender<ServiceStatus>,
    cancel: &CancellationToken,
) -> Result<()> {
    device.start_read().await?;
    status.send_modify(|s| s.link = LinkState::Streaming);

    let outcome = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        match device.read_sample().await {
            Ok(Some(sample)) => {
                broadcaster.publish(sample);
                status.send_modify(|s| {
                    s.samples += 1;
                    s.subscribers = broadcaster.subscriber_count();
                });
            }
            Ok(None) => {}
            Err(e) => break Err(e),
        }
    };

    let stopped = device.stop_read().await;
    match outcome {
        Err(e) => {
            if let Err(stop) = stopped {
                warn!(error = %stop, "Stop after relay failure also failed");
            }
            Err(e)
        }
        Ok(()) => stopped,
    }
}
