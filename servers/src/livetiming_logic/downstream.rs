//! Subscriber-facing listener: `/health` for operators, and a websocket upgrade
//! on every other path (`ws://host:port`, `ws://host:port/ws`, ...) for the
//! broadcast stream.
//!
//! Every accepted socket is registered with the [`Dispatcher`] and then only
//! forwards what the scheduler hands it. Anything a subscriber sends is ignored
//! apart from close frames.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use lib_common::core::{Dispatcher, LinkState, StateReader};

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub reader: StateReader,
    /// Lets open sockets close cleanly on shutdown.
    pub shutdown: broadcast::Sender<()>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    link: LinkState,
    updates: u64,
    topics: usize,
    subscribers: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback(ws_handler)
        .layer(cors)
        .with_state(state)
}

pub async fn run(listener: TcpListener, state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = listener.local_addr()?;
    log::info!("Downstream server listening on ws://{}", addr);

    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    let snapshot = state.reader.current();
    Json(Health {
        status: "ok",
        link: snapshot.link,
        updates: snapshot.updates,
        topics: snapshot.tree.len(),
        subscribers: state.dispatcher.open_count(),
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let mut link = state.dispatcher.register(&addr.to_string());
    let client_id = link.id;
    let mut shutdown = state.shutdown.subscribe();
    let (mut sink, mut stream) = socket.split();
    log::info!("Client {} connected from {}", client_id, addr);

    loop {
        tokio::select! {
            payload = link.recv() => {
                let Some(payload) = payload else { break };
                if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break; // client disconnected
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) => {
                        link.mark_closing();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Client {} read error: {}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = shutdown.recv() => {
                link.mark_closing();
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.dispatcher.remove(client_id);
    log::info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::core::{Payload, UpdateEvent, state_store};
    use serde_json::{Value, json};
    use std::time::Duration;

    async fn spawn_server() -> (SocketAddr, Arc<AppState>, broadcast::Sender<()>) {
        let (writer, reader) = state_store();
        writer.apply(vec![UpdateEvent::Feed {
            topic: "LapCount".into(),
            value: json!({"CurrentLap": 3}),
        }]);

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(AppState {
            dispatcher: Arc::new(Dispatcher::new()),
            reader,
            shutdown: shutdown_tx.clone(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener, state.clone(), shutdown_tx.subscribe()));
        (addr, state, shutdown_tx)
    }

    async fn wait_for_subscribers(state: &AppState, n: usize) {
        for _ in 0..200 {
            if state.dispatcher.open_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} subscribers, have {}", state.dispatcher.open_count());
    }

    #[tokio::test]
    async fn health_reports_state_and_subscribers() {
        let (addr, _state, shutdown) = spawn_server().await;

        let body: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            body,
            json!({"status": "ok", "link": "disconnected", "updates": 1, "topics": 1, "subscribers": 0})
        );
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn subscribers_receive_broadcast_payloads() {
        let (addr, state, shutdown) = spawn_server().await;
        let url = format!("ws://{}/ws", addr);

        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&state, 2).await;

        let payload: Payload = Arc::from(r#"{"LapCount":{"CurrentLap":3}}"#);
        let report = state.dispatcher.broadcast(&payload);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);

        for client in [&mut first, &mut second] {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(msg.is_text());
            assert_eq!(msg.to_text().unwrap(), r#"{"LapCount":{"CurrentLap":3}}"#);
        }

        first.close(None).await.unwrap();
        wait_for_subscribers(&state, 1).await;
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn root_path_upgrades_like_ws_path() {
        let (addr, state, shutdown) = spawn_server().await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscribers(&state, 1).await;

        let payload: Payload = Arc::from("{}");
        assert_eq!(state.dispatcher.broadcast(&payload).delivered, 1);

        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.to_text().unwrap(), "{}");
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn plain_http_on_stream_path_is_rejected() {
        let (addr, _state, shutdown) = spawn_server().await;

        let status = reqwest::get(format!("http://{}/", addr)).await.unwrap().status();
        assert!(status.is_client_error(), "got {status}");
        let _ = shutdown.send(());
    }
}
