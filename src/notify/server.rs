//! WebSocket transport for the refresh hub.
//!
//! Each connected client gets `{"event":"<name>"}` per signal. A client that
//! sends the bare event name (or the same JSON frame) raises a signal for
//! everyone, which is how external producers poke the hub.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RefreshHub;
use crate::config::NotifyConfig;
use crate::error::{NotifyError, NotifyResult};

#[derive(Clone)]
struct HubState {
    hub: Arc<RefreshHub>,
    event_name: Arc<str>,
}

/// Whether an inbound text frame asks for a broadcast.
pub(crate) fn is_signal_frame(text: &str, event_name: &str) -> bool {
    let text = text.trim();
    if text == event_name {
        return true;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("event").and_then(Value::as_str).map(|e| e == event_name))
        .unwrap_or(false)
}

pub(crate) fn signal_frame(event_name: &str) -> String {
    serde_json::json!({ "event": event_name }).to_string()
}

pub fn router(hub: Arc<RefreshHub>, config: &NotifyConfig) -> Router {
    let state = HubState {
        hub,
        event_name: Arc::from(config.event_name.as_str()),
    };

    Router::new()
        .route(&config.hub_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the hub until `cancel` fires.
pub async fn serve(
    hub: Arc<RefreshHub>,
    config: &NotifyConfig,
    cancel: CancellationToken,
) -> NotifyResult<()> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e: std::net::AddrParseError| NotifyError::BindFailed {
            address: config.bind_address.clone(),
            message: e.to_string(),
        })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| NotifyError::BindFailed {
            address: config.bind_address.clone(),
            message: e.to_string(),
        })?;

    info!(target: "cachescope::notify", address = %addr, path = %config.hub_path, "Refresh hub listening");

    axum::serve(listener, router(hub, config))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| NotifyError::BindFailed {
            address: config.bind_address.clone(),
            message: e.to_string(),
        })?;

    info!(target: "cachescope::notify", "Refresh hub stopped");
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: HubState) {
    let (mut sender, mut receiver) = socket.split();
    let mut signals = state.hub.subscribe();
    let frame = signal_frame(&state.event_name);

    debug!(target: "cachescope::notify", subscribers = state.hub.subscriber_count(), "Subscriber connected");

    let mut send_task = tokio::spawn(async move {
        while signals.recv().await.is_some() {
            if sender.send(Message::Text(frame.clone().into())).await.is_err() {
                break;
            }
        }
    });

    let hub = state.hub.clone();
    let event_name = state.event_name.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if is_signal_frame(&text, &event_name) {
                        hub.signal();
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "cachescope::notify", error = %e, "Subscriber socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    debug!(target: "cachescope::notify", "Subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("RefreshUI", true)]
    #[case("  RefreshUI\n", true)]
    #[case(r#"{"event":"RefreshUI"}"#, true)]
    #[case(r#"{"event":"Other"}"#, false)]
    #[case("refreshui", false)]
    #[case("", false)]
    fn test_signal_frames(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(is_signal_frame(text, "RefreshUI"), expected);
    }

    #[test]
    fn test_outbound_frame() {
        assert_eq!(signal_frame("RefreshUI"), r#"{"event":"RefreshUI"}"#);
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let config = NotifyConfig {
            bind_address: "not-an-address".into(),
            ..NotifyConfig::default()
        };
        let err = serve(Arc::new(RefreshHub::new(4)), &config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::BindFailed { .. }));
    }

    #[tokio::test]
    async fn test_health_route() {
        assert_eq!(health_handler().await, "OK");
    }
}
