use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use boardsync_core::PresenceStore;

use crate::handlers;
use crate::notify::Notifier;
use crate::registry::ConnectionRegistry;
use crate::scheduler::{self, SchedulerConfig, SchedulerHandle};
use crate::session::SessionLookup;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Frames buffered per connection before new ones are dropped.
    pub send_queue_depth: usize,
    pub max_connections_per_user: usize,
    pub scheduler: SchedulerConfig,
    pub presence_timeout: Duration,
    /// Sent as `retry:` on the first frame and as `Retry-After` on a 429.
    pub retry_hint_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9292,
            send_queue_depth: 256,
            max_connections_per_user: 10,
            scheduler: SchedulerConfig::default(),
            presence_timeout: Duration::from_secs(30),
            retry_hint_ms: 3000,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub notifier: Notifier,
    pub sessions: Arc<dyn SessionLookup>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        presence: Arc<dyn PresenceStore>,
        sessions: Arc<dyn SessionLookup>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections_per_user));
        let notifier = Notifier::new(registry.clone(), presence);
        Self {
            config: Arc::new(config),
            registry,
            notifier,
            sessions,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sse", get(handlers::stream_get).post(handlers::stream_post))
        .route(
            "/api/admin/connections",
            get(handlers::admin_connections).post(handlers::admin_action),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start the background loops and serve. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    presence: Arc<dyn PresenceStore>,
    sessions: Arc<dyn SessionLookup>,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(config, presence, sessions);
    let shutdown = CancellationToken::new();
    let scheduler = scheduler::start(
        state.notifier.clone(),
        state.config.scheduler.clone(),
        &shutdown,
    );

    let registry = state.registry.clone();
    let notifier = state.notifier.clone();
    let router = build_router(state);

    tracing::info!(addr = %local_addr, "boardsync server started");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        registry,
        notifier,
        scheduler,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. The registry is the dispatcher the rest of
/// the application publishes board events through.
pub struct ServerHandle {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    notifier: Notifier,
    scheduler: SchedulerHandle,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Stop accepting, end every open stream, stop the loops and wait.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let closed = self.registry.drain().len();
        tracing::info!(closed, "closing open streams");
        self.scheduler.shutdown().await;
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticSessions;
    use boardsync_core::{BoardEvent, BoardId, Decoded, StreamDecoder, StreamEvent, UserId};
    use boardsync_store::{Database, SqlitePresenceStore};
    use serde_json::json;

    struct Harness {
        handle: ServerHandle,
        http: reqwest::Client,
    }

    impl Harness {
        async fn start(config: ServerConfig) -> Self {
            let presence = Arc::new(SqlitePresenceStore::new(
                Database::in_memory().unwrap(),
                config.presence_timeout,
            ));
            let sessions = Arc::new(StaticSessions::new());
            sessions.insert("alice-token", UserId::from_raw("alice"), false);
            sessions.insert("bob-token", UserId::from_raw("bob"), false);
            sessions.insert("admin-token", UserId::from_raw("root"), true);
            let config = ServerConfig {
                bind: "127.0.0.1".into(),
                port: 0,
                ..config
            };
            let handle = start(config, presence, sessions).await.unwrap();
            Self {
                handle,
                http: reqwest::Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{}", self.handle.port(), path)
        }

        async fn open(&self, token: &str, board: &str) -> Reader {
            let resp = self
                .http
                .get(self.url(&format!("/api/sse?boardId={board}")))
                .header("cookie", format!("session={token}"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            let mut reader = Reader {
                resp,
                decoder: StreamDecoder::new(),
                pending: Vec::new(),
            };
            let connected = reader.next_event().await.unwrap();
            assert_eq!(connected.event_type, "connected");
            reader
        }

        async fn control(&self, token: Option<&str>, body: serde_json::Value) -> reqwest::Response {
            let mut req = self.http.post(self.url("/api/sse")).json(&body);
            if let Some(token) = token {
                req = req.header("cookie", format!("session={token}"));
            }
            req.send().await.unwrap()
        }
    }

    struct Reader {
        resp: reqwest::Response,
        decoder: StreamDecoder,
        pending: Vec<StreamEvent>,
    }

    impl Reader {
        async fn next_event(&mut self) -> Option<StreamEvent> {
            loop {
                if !self.pending.is_empty() {
                    return Some(self.pending.remove(0));
                }
                let chunk = tokio::time::timeout(Duration::from_secs(5), self.resp.chunk())
                    .await
                    .ok()?
                    .ok()??;
                for decoded in self.decoder.feed(&chunk) {
                    if let Decoded::Event(event) = decoded {
                        self.pending.push(event);
                    }
                }
            }
        }

        fn client_id(event: &StreamEvent) -> String {
            let value: serde_json::Value = serde_json::from_str(&event.data).unwrap();
            value["clientId"].as_str().unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let h = Harness::start(ServerConfig::default()).await;
        let body: serde_json::Value = h.http.get(h.url("/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_starts_with_connected_frame_and_retry_hint() {
        let h = Harness::start(ServerConfig::default()).await;
        let resp = h
            .http
            .get(h.url("/api/sse?boardId=b1"))
            .header("cookie", "session=alice-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["cache-control"], "no-cache");

        let mut reader = Reader {
            resp,
            decoder: StreamDecoder::new(),
            pending: Vec::new(),
        };
        let connected = reader.next_event().await.unwrap();
        assert_eq!(connected.event_type, "connected");
        assert_eq!(connected.retry, Some(3000));
        assert!(Reader::client_id(&connected).starts_with("conn_"));

        // Known user and board: the join is announced to the board, including the joiner.
        let joined = reader.next_event().await.unwrap();
        assert_eq!(joined.event_type, "user_joined");
        assert_eq!(h.handle.registry().active_user_count(&BoardId::from_raw("b1")), 1);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn post_connect_intent_opens_stream() {
        let h = Harness::start(ServerConfig::default()).await;
        let resp = h
            .control(Some("bob-token"), json!({"type": "sse_connect", "boardId": "b7"}))
            .await;
        assert_eq!(resp.status(), 200);
        let mut reader = Reader {
            resp,
            decoder: StreamDecoder::new(),
            pending: Vec::new(),
        };
        assert_eq!(reader.next_event().await.unwrap().event_type, "connected");
        assert_eq!(h.handle.registry().board_connections(&BoardId::from_raw("b7")).len(), 1);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn cap_exceeded_returns_429() {
        let h = Harness::start(ServerConfig {
            max_connections_per_user: 1,
            ..Default::default()
        })
        .await;
        let _first = h.open("alice-token", "b1").await;

        let resp = h
            .http
            .get(h.url("/api/sse?boardId=b1"))
            .header("cookie", "session=alice-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers()["retry-after"], "3");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Connection limit exceeded");
        assert_eq!(h.handle.registry().connection_count(), 1);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn claiming_anonymous_stream_counts_against_cap() {
        let h = Harness::start(ServerConfig {
            max_connections_per_user: 1,
            ..Default::default()
        })
        .await;
        let _first = h.open("alice-token", "b1").await;

        let resp = h.http.get(h.url("/api/sse?boardId=b1")).send().await.unwrap();
        let mut anon = Reader {
            resp,
            decoder: StreamDecoder::new(),
            pending: Vec::new(),
        };
        let client_id = Reader::client_id(&anon.next_event().await.unwrap());

        let join = json!({"action": "join_board", "clientId": client_id, "boardId": "b2"});
        let resp = h.control(Some("alice-token"), join).await;
        assert_eq!(resp.status(), 429);
        assert_eq!(h.handle.registry().user_connection_count(&UserId::from_raw("alice")), 1);
        assert!(h.handle.registry().board_connections(&BoardId::from_raw("b2")).is_empty());
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn control_channel_status_codes() {
        let h = Harness::start(ServerConfig::default()).await;
        let mut reader = h.open("alice-token", "b1").await;
        let _ = reader.next_event().await; // own user_joined
        let client_id = {
            let snapshot = h.handle.registry().snapshot();
            snapshot[0].client_id.to_string()
        };

        let join = json!({"action": "join_board", "clientId": client_id, "boardId": "b2"});
        assert_eq!(h.control(None, join.clone()).await.status(), 401);
        assert_eq!(h.control(Some("bogus"), join.clone()).await.status(), 401);
        assert_eq!(h.control(Some("bob-token"), join.clone()).await.status(), 403);

        let unknown = json!({"action": "join_board", "clientId": "conn_nope", "boardId": "b2"});
        assert_eq!(h.control(Some("alice-token"), unknown).await.status(), 404);

        let bad = json!({"action": "dance", "clientId": client_id});
        assert_eq!(h.control(Some("alice-token"), bad).await.status(), 400);

        let resp = h.control(Some("alice-token"), join).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<serde_json::Value>().await.unwrap(), json!({"success": true}));
        assert_eq!(h.handle.registry().board_connections(&BoardId::from_raw("b2")).len(), 1);
        assert_eq!(h.handle.registry().board_count(), 1);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_control_body_is_400() {
        let h = Harness::start(ServerConfig::default()).await;
        let resp = h
            .http
            .post(h.url("/api/sse"))
            .header("cookie", "session=alice-token")
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn presence_update_reaches_board() {
        let h = Harness::start(ServerConfig::default()).await;
        let mut alice = h.open("alice-token", "b1").await;
        let _ = alice.next_event().await;
        let mut bob = h.open("bob-token", "b1").await;
        let _ = bob.next_event().await;
        let _ = alice.next_event().await; // bob joined

        let alice_id = h
            .handle
            .registry()
            .user_connections(&UserId::from_raw("alice"))[0]
            .to_string();
        let resp = h
            .control(
                Some("alice-token"),
                json!({"action": "presence_update", "clientId": alice_id, "data": {"editing": "c1"}}),
            )
            .await;
        assert_eq!(resp.status(), 200);

        let event = bob.next_event().await.unwrap();
        assert_eq!(event.event_type, "presence_update");
        let value: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(value["user_id"], "alice");
        assert_eq!(value["activity"]["editing"], "c1");
        assert_eq!(value["presence_data"]["connected_users_count"], 2);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn admin_requires_admin_session() {
        let h = Harness::start(ServerConfig::default()).await;
        let resp = h
            .http
            .get(h.url("/api/admin/connections"))
            .header("cookie", "session=alice-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);

        let resp = h
            .http
            .get(h.url("/api/admin/connections"))
            .header("cookie", "session=admin-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["totalConnections"], 0);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn admin_kick_ends_stream_with_notice() {
        let h = Harness::start(ServerConfig::default()).await;
        let mut alice = h.open("alice-token", "b1").await;
        let _ = alice.next_event().await;

        let resp = h
            .http
            .post(h.url("/api/admin/connections"))
            .header("cookie", "session=admin-token")
            .json(&json!({"action": "kickUser", "userId": "alice"}))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["kicked"], 1);

        let notice = alice.next_event().await.unwrap();
        assert_eq!(notice.event_type, "kicked");
        assert!(notice.data.contains("\"redirectTo\":\"/dashboard\""));
        assert!(alice.next_event().await.is_none(), "stream ends after kick");
        assert_eq!(h.handle.registry().connection_count(), 0);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn dispatcher_broadcast_reaches_http_clients() {
        let h = Harness::start(ServerConfig::default()).await;
        let mut alice = h.open("alice-token", "b1").await;
        let _ = alice.next_event().await;

        let event = BoardEvent::card_deleted(BoardId::from_raw("b1"), "c42");
        assert_eq!(h.handle.notifier().broadcast(&BoardId::from_raw("b1"), &event, None).await, 1);
        let got = alice.next_event().await.unwrap();
        assert_eq!(got.event_type, "card_deleted");
        assert!(got.data.contains("\"card_id\":\"c42\""));
        h.handle.shutdown().await;
    }
}
