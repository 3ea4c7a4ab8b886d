//! Reconnecting WebSocket subscriber.
//!
//! Connects to a remote hub and re-raises every signal it hears on a local
//! [`RefreshHub`], so in-process consumers never see the transport. Drops
//! are retried with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::server::is_signal_frame;
use super::RefreshHub;
use crate::config::NotifyConfig;
use crate::error::NotifyError;

/// Doubling delay between `min` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// Delay to wait now; the following call waits twice as long, up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

pub struct RemoteSubscriber {
    url: String,
    event_name: String,
    hub: Arc<RefreshHub>,
    backoff: Backoff,
}

impl RemoteSubscriber {
    pub fn new(url: impl Into<String>, hub: Arc<RefreshHub>, config: &NotifyConfig) -> Self {
        Self {
            url: url.into(),
            event_name: config.event_name.clone(),
            hub,
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_min_ms),
                Duration::from_millis(config.reconnect_max_ms),
            ),
        }
    }

    /// Stay connected until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut connections = 0u64;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((stream, _)) => {
                    connections += 1;
                    self.backoff.reset();
                    info!(target: "cachescope::notify", url = %self.url, connections, "Subscribed to refresh hub");

                    let (mut write, mut read) = stream.split();
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = write.close().await;
                                debug!(target: "cachescope::notify", url = %self.url, "Subscriber stopped");
                                return;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if is_signal_frame(&text, &self.event_name) {
                                        self.hub.signal();
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(target: "cachescope::notify", url = %self.url, error = %e, "Refresh hub connection error");
                                    break;
                                }
                            }
                        }
                    }
                    warn!(target: "cachescope::notify", url = %self.url, "Refresh hub connection dropped");
                }
                Err(e) => {
                    let err = NotifyError::ConnectFailed {
                        url: self.url.clone(),
                        message: e.to_string(),
                    };
                    warn!(target: "cachescope::notify", error = %err, "Refresh hub unreachable");
                }
            }

            let delay = self.backoff.next_delay();
            debug!(target: "cachescope::notify", delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(target: "cachescope::notify", url = %self.url, connections, "Subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::router;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(3_000));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_forwards_remote_signals() {
        let config = NotifyConfig::default();
        let remote = Arc::new(RefreshHub::new(16));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(remote.clone(), &config);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let local = Arc::new(RefreshHub::new(16));
        let mut rx = local.subscribe();
        let cancel = CancellationToken::new();
        let subscriber = RemoteSubscriber::new(
            format!("ws://{addr}{}", config.hub_path),
            local.clone(),
            &config,
        );
        let handle = tokio::spawn(subscriber.run(cancel.clone()));

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                remote.signal();
                if tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_ok() {
                    break;
                }
            }
        })
        .await;
        assert!(received.is_ok());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_hub_stops_on_cancel() {
        let config = NotifyConfig {
            reconnect_min_ms: 10,
            reconnect_max_ms: 20,
            ..NotifyConfig::default()
        };
        let cancel = CancellationToken::new();
        let subscriber = RemoteSubscriber::new(
            "ws://127.0.0.1:9/uirefreshhub",
            Arc::new(RefreshHub::new(4)),
            &config,
        );
        let handle = tokio::spawn(subscriber.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(5), handle).await.is_ok());
    }
}
