//! WebSocket RPC server: the persistent duplex socket carrying JSON frames.
//!
//! One runtime task per connection plus a writer task owning the sink, so
//! RPC responses and server-push callback frames share a single ordered
//! outbound queue. Connections are admitted through a per-IP rate limit
//! before the WebSocket handshake is attempted.

pub mod callback;
pub mod dispatch;
pub mod handlers;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message as WsMessage},
};
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::broker::{StreamingTaskHandle, SubscriptionHandle};
use crate::AppContext;

// ─── Connection admission ─────────────────────────────────────────────────────

/// Max new WebSocket connections per IP per minute.
const MAX_CONNECTIONS_PER_MIN: usize = 30;

/// Per-IP connection rate tracker.
struct ConnectionRateLimiter {
    /// Map of IP → connection timestamps within the last minute.
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Returns `true` if the connection should be allowed.
    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);

        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

// ─── Connection state ─────────────────────────────────────────────────────────

/// Session bound to a connection by `authenticate`.
#[derive(Clone)]
pub struct BoundSession {
    pub session_id: String,
    pub principal: Principal,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state shared with the dispatcher and handlers.
pub struct ConnectionCtx {
    pub id: u64,
    /// Queue to the writer task; push frames and responses interleave here.
    pub outbound: mpsc::Sender<WsMessage>,
    pub session: Mutex<Option<BoundSession>>,
    /// Streaming handles created on this connection, disposed with it.
    handles: Mutex<Vec<StreamingTaskHandle>>,
    /// Push subscriptions registered on this connection.
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl ConnectionCtx {
    pub fn new(outbound: mpsc::Sender<WsMessage>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            session: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn track_handle(&self, handle: StreamingTaskHandle) {
        self.handles.lock().expect("connection handles lock").push(handle);
    }

    pub fn track_subscription(&self, handle: SubscriptionHandle) {
        self.subscriptions
            .lock()
            .expect("connection subscriptions lock")
            .push(handle);
    }

    /// Tear down everything owned by this connection.
    fn dispose(&self, ctx: &AppContext) {
        for handle in self
            .handles
            .lock()
            .expect("connection handles lock")
            .drain(..)
        {
            handle.dispose();
        }
        for sub in self
            .subscriptions
            .lock()
            .expect("connection subscriptions lock")
            .drain(..)
        {
            ctx.broker.unsubscribe(&sub);
        }
        self.session.lock().expect("connection session lock").take();
    }
}

// ─── Server ───────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "RPC server listening");

    // Per-IP connection limiter shared across all accept iterations.
    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping RPC server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().expect("connection limiter lock");
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("RPC server stopped");
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C; elsewhere Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024), // 16 MB
        max_frame_size: Some(4 * 1024 * 1024),    // 4 MB per frame
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    // Writer task: single owner of the sink, fed by responses and pushes.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let conn = ConnectionCtx::new(outbound_tx.clone());
    debug!(connection = conn.id, "connection open");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if let Some(response) = dispatch::dispatch_text(&text, &ctx, &conn).await {
                    if outbound_tx.send(WsMessage::Text(response)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(WsMessage::Ping(data)) => {
                let _ = outbound_tx.send(WsMessage::Pong(data)).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = conn.id, err = %e, "ws error");
                break;
            }
        }
    }

    let connection_id = conn.id;
    conn.dispose(&ctx);
    // Both sender halves must drop before the writer can finish.
    drop(conn);
    drop(outbound_tx);
    let _ = writer.await;
    debug!(connection = connection_id, "connection closed");
    Ok(())
}
