use std::{
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    axum::{
        Extension, Router,
        extract::{ConnectInfo, State, WebSocketUpgrade, ws::close_code},
        http::{HeaderValue, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
    },
    naclgate_auth::{AuthGate, AuthenticatedRequest, ChannelCache, ServerKeys},
    naclgate_config::{AuthConfig, ConfigError, NaclgateConfig, TlsConfig},
    serde_json::Value,
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tower_http::{
        cors::{AllowOrigin, Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info, warn},
};

use crate::{
    manager::ServerError,
    observable::Observable,
    registry::{BroadcastReport, ConnectionHandle, ConnectionRegistry, InboundMessage},
    routes::GuardedRouter,
    runtime::{LifecycleError, RuntimeContext, ServerBackend, ServerStatus},
    ws::{SHUTDOWN_REASON, handle_connection},
};

/// How long connections get to flush their close frames on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Served without authentication regardless of `auth.exclude_routes`.
pub const PUBLIC_KEY_ROUTE: &str = "/getpublickey";

// ── Settings ─────────────────────────────────────────────────────────────────

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub tls: Option<TlsConfig>,
    pub auth: AuthConfig,
}

impl ServerSettings {
    pub fn from_config(config: &NaclgateConfig) -> Result<Self, ConfigError> {
        let server = &config.server;
        let target = format!("{}:{}", server.host, server.port);
        let addr = (server.host.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::InvalidAddress(format!("{target}: {e}")))?
            .next()
            .ok_or_else(|| ConfigError::InvalidAddress(target))?;

        Ok(Self {
            addr,
            allowed_origins: server.allowed_origins.clone(),
            tls: server.tls.clone(),
            auth: config.auth.clone(),
        })
    }

    /// Transport scheme clients should use for `/websocket`.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "wss://"
        } else {
            "ws://"
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// HTTP + WebSocket backend with NaCl-box authentication on every route.
pub struct WebSocketServer {
    settings: ServerSettings,
    keys: ServerKeys,
    gate: Arc<AuthGate>,
    registry: Arc<ConnectionRegistry>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WebSocketServer {
    /// Build the gate and check the route table, so a bad exclusion list
    /// fails here rather than on the event-loop thread.
    pub fn new(settings: ServerSettings, keys: ServerKeys) -> Result<Self, ServerError> {
        let cache = ChannelCache::new(
            keys.secret().clone(),
            settings.auth.channel_cache_capacity,
            settings.auth.channel_ttl(),
        );
        let mut exclude_routes = settings.auth.exclude_routes.clone();
        if !exclude_routes.iter().any(|route| route == PUBLIC_KEY_ROUTE) {
            exclude_routes.push(PUBLIC_KEY_ROUTE.to_string());
        }
        let gate = AuthGate::new(cache, &exclude_routes, &settings.auth.exclude_methods)
            .map_err(|e| ConfigError::InvalidExcludePattern {
                pattern: settings.auth.exclude_routes.join(", "),
                message: e.to_string(),
            })?;

        let server = Self {
            settings,
            keys,
            gate: Arc::new(gate),
            registry: Arc::new(ConnectionRegistry::new()),
            local_addr: Mutex::new(None),
        };
        server.routes().build()?;
        Ok(server)
    }

    pub fn keys(&self) -> &ServerKeys {
        &self.keys
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn gate(&self) -> &Arc<AuthGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn scheme(&self) -> &'static str {
        self.settings.scheme()
    }

    /// The bound address while serving (resolves port `0`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build the router (shared between serving and tests).
    pub fn build_app(
        &self,
        data: Arc<Observable<Option<InboundMessage>>>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Result<Router, LifecycleError> {
        let state = AppState {
            public_key_hex: self.keys.public_key_hex(),
            scheme: self.scheme(),
            registry: Arc::clone(&self.registry),
            data,
            shutdown,
            tracker,
        };

        Ok(self
            .routes()
            .build()?
            .layer(cors_layer(&self.settings.allowed_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(state))
    }

    fn routes(&self) -> GuardedRouter<AppState> {
        GuardedRouter::new(Arc::clone(&self.gate))
            .plain("/", get(index_handler))
            .open(PUBLIC_KEY_ROUTE, get(public_key_handler))
            .plain("/protocol", get(protocol_handler))
            .stream("/websocket", get(ws_upgrade_handler))
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = addr;
    }
}

#[async_trait]
impl ServerBackend for WebSocketServer {
    type Inbound = InboundMessage;

    async fn serve(&self, ctx: RuntimeContext<InboundMessage>) -> anyhow::Result<()> {
        let tracker = TaskTracker::new();
        let app = self.build_app(Arc::clone(&ctx.data), ctx.shutdown.clone(), tracker.clone())?;

        let listener = TcpListener::bind(self.settings.addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        self.set_local_addr(Some(addr));
        info!(
            %addr,
            scheme = self.scheme(),
            public_key = %self.keys.public_key_hex(),
            "naclgate listening"
        );
        ctx.status.set(ServerStatus::Running);

        let result = match &self.settings.tls {
            None => serve_plain(listener, app, ctx.shutdown.clone()).await,
            Some(tls) => serve_tls(listener, app, tls, ctx.shutdown.clone()).await,
        };

        // Serve may also end on its own error; make sure connections see the shutdown.
        ctx.shutdown.cancel();
        let closed = self
            .registry
            .close_all(close_code::AWAY, SHUTDOWN_REASON)
            .await;
        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = tracker.len(), "connections did not drain in time");
        }

        self.set_local_addr(None);
        ctx.status.set(ServerStatus::Stopped);
        info!(closed, "naclgate stopped");
        result
    }

    async fn broadcast(&self, data: Value) -> BroadcastReport {
        self.registry.broadcast(&data).await
    }
}

async fn serve_plain(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

#[cfg(feature = "tls")]
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: &TlsConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use axum_server::{Handle, tls_rustls::RustlsConfig};

    let config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path).await?;
    let handle = Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        trigger.graceful_shutdown(Some(DRAIN_TIMEOUT));
    });

    axum_server::from_tcp_rustls(listener, config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(
    _listener: TcpListener,
    _app: Router,
    _tls: &TlsConfig,
    _shutdown: CancellationToken,
) -> anyhow::Result<()> {
    anyhow::bail!("TLS is configured but naclgate was built without the `tls` feature")
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin, error = %e, "ignoring invalid allowed origin");
                None
            },
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    public_key_hex: String,
    scheme: &'static str,
    registry: Arc<ConnectionRegistry>,
    data: Arc<Observable<Option<InboundMessage>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

async fn index_handler() -> &'static str {
    "index"
}

async fn public_key_handler(State(state): State<AppState>) -> String {
    state.public_key_hex
}

async fn protocol_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedRequest>,
) -> Response {
    debug!(
        peer = %auth.channel.peer_hex(),
        message = %String::from_utf8_lossy(&auth.plaintext),
        "protocol requested"
    );
    match auth.channel.seal_json(state.scheme) {
        Ok(sealed) => sealed.into_response(),
        Err(e) => {
            warn!(error = %e, "failed to seal protocol response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedRequest>,
) -> impl IntoResponse {
    debug!(
        peer = %auth.channel.peer_hex(),
        %addr,
        handshake = %String::from_utf8_lossy(&auth.plaintext),
        "websocket handshake authenticated"
    );
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        let (conn, outbound) = ConnectionHandle::new(auth.channel, Some(addr));
        tracker.track_future(handle_connection(
            socket,
            conn,
            outbound,
            state.registry,
            state.data,
            state.shutdown,
        ))
    })
}
