//! Websocket viewers over axum.
//!
//! Each connection to `/ws` becomes a subscriber. The viewer first gets a
//! snapshot of every monitored file (one frame per file), then every batch as
//! it is published.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::sync::{watch, Mutex};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hub::HubHandle;
use crate::reader::snapshot_tail;
use crate::subscriber::{self, Frame, Transport};

/// How long a close waits to flush the close frame before the socket is
/// simply dropped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// [`Transport`] over an axum websocket, split so that the drain and read
/// loops never contend for the same half.
///
/// Closing never waits on the sink lock while a write is pending: a peer that
/// stopped reading can hold a write open forever. `close` flips `shutdown`
/// first, which aborts any pending `send` or `receive`, and only then closes
/// the sink.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    shutdown: watch::Sender<bool>,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let (shutdown, _) = watch::channel(false);

        WsTransport {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            shutdown,
        }
    }

    /// Resolves once `close` has been called.
    async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        async move {
            let write = async {
                self.sink
                    .lock()
                    .await
                    .send(Message::Text(frame.to_string().into()))
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))
            };

            tokio::select! {
                biased;
                _ = self.closed() => Err(Error::Transport("connection closed".to_string())),
                res = write => res,
            }
        }
        .boxed()
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<String>>> {
        async move {
            let read = async {
                let mut stream = self.stream.lock().await;
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                        Some(Ok(Message::Close(_))) | None => return Ok(None),
                        // Pings are answered by axum; binary frames mean nothing here.
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                    }
                }
            };

            tokio::select! {
                biased;
                _ = self.closed() => Ok(None),
                res = read => res,
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.shutdown.send_replace(true) {
                return;
            }

            let mut sink = self.sink.lock().await;
            match time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("websocket close failed: {}", e),
                Err(_) => debug!("websocket close timed out, dropping the connection"),
            }
        }
        .boxed()
    }
}

/// Shared state for the viewer routes.
#[derive(Clone, Debug)]
pub struct AppState {
    pub hub: HubHandle,
    pub paths: Arc<Vec<PathBuf>>,
    pub snapshot_lines: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket));
    let preamble = snapshot_frames(&state.paths, state.snapshot_lines).await;

    if let Err(e) = subscriber::serve(&state.hub, transport, preamble).await {
        warn!("viewer session failed: {}", e);
    }
}

/// Builds one frame per file holding its last `lines` lines. Files that cannot
/// be read right now, or have nothing to show, are skipped.
pub async fn snapshot_frames(paths: &[PathBuf], lines: usize) -> Vec<Frame> {
    let mut frames = Vec::new();

    for path in paths {
        match snapshot_tail(path, lines).await {
            Ok(tail) if tail.is_empty() => {}
            Ok(tail) => frames.push(Frame::from(tail.join("\n"))),
            Err(e) => warn!(path = %path.display(), "snapshot failed: {}", e),
        }
    }

    frames
}
