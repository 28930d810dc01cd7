use std::{
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use {
    async_trait::async_trait,
    naclgate_auth::ServerKeys,
    naclgate_config::{ConfigError, NaclgateConfig, load_config},
    serde_json::Value,
    tracing::{info, warn},
};

use crate::{
    observable::Observable,
    registry::{ConnectionHandle, InboundMessage},
    runtime::{LifecycleError, QueuedBroadcast, ServerRuntime, ServerStatus},
    server::{ServerSettings, WebSocketServer},
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Downstream consumer of decrypted streaming messages.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Handle one message. A returned value is broadcast to every connection.
    async fn on_message(&self, payload: Value, connection: &ConnectionHandle) -> Option<Value>;
}

/// Replies each payload to the connection it came from.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSink;

#[async_trait]
impl MessageSink for EchoSink {
    async fn on_message(&self, payload: Value, connection: &ConnectionHandle) -> Option<Value> {
        info!(conn_id = %connection.id(), %payload, "received data");
        if let Err(e) = connection.send_json(&payload) {
            warn!(conn_id = %connection.id(), error = %e, "failed to echo message");
        }
        None
    }
}

enum ConfigSource {
    Fixed,
    File(PathBuf),
}

/// Owns the server runtime and wires inbound messages to a [`MessageSink`].
///
/// Status listeners live on the manager, so they survive the runtime being
/// rebuilt when the configuration is reloaded.
pub struct ServerManager {
    source: ConfigSource,
    sink: Arc<dyn MessageSink>,
    status: Arc<Observable<ServerStatus>>,
    data: Arc<Observable<Option<InboundMessage>>>,
    ephemeral_keys: OnceLock<ServerKeys>,
    runtime: Mutex<Arc<ServerRuntime<WebSocketServer>>>,
}

impl ServerManager {
    pub fn new(config: NaclgateConfig, sink: Arc<dyn MessageSink>) -> Result<Self, ServerError> {
        Self::build(ConfigSource::Fixed, &config, sink)
    }

    /// Load from `path`; the file is read again on every [`start`](Self::start).
    pub fn from_path(path: impl AsRef<Path>, sink: Arc<dyn MessageSink>) -> Result<Self, ServerError> {
        let path = path.as_ref().to_path_buf();
        let config = load_config(&path)?;
        Self::build(ConfigSource::File(path), &config, sink)
    }

    fn build(
        source: ConfigSource,
        config: &NaclgateConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, ServerError> {
        let status = Arc::new(Observable::new("status", ServerStatus::Stopped));
        let data = Arc::new(Observable::new("data", None));
        let ephemeral_keys = OnceLock::new();
        let runtime = build_runtime(config, &status, &data, &ephemeral_keys)?;
        Ok(Self {
            source,
            sink,
            status,
            data,
            ephemeral_keys,
            runtime: Mutex::new(Arc::new(runtime)),
        })
    }

    /// Start serving. Returns before the listener is bound; watch the status
    /// with [`add_listener`](Self::add_listener) to know when it is.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut runtime = self.lock_runtime();
        if runtime.status() != ServerStatus::Stopped || runtime.is_worker_alive() {
            return Err(LifecycleError::AlreadyRunning.into());
        }

        if let ConfigSource::File(path) = &self.source {
            let config = load_config(path)?;
            *runtime = Arc::new(build_runtime(
                &config,
                &self.status,
                &self.data,
                &self.ephemeral_keys,
            )?);
            info!(path = %path.display(), "configuration reloaded");
        }

        self.connect_sink(&runtime);
        runtime.start()?;
        Ok(())
    }

    /// Stop forwarding messages and schedule the server shutdown.
    ///
    /// Safe to call from a status listener: it never blocks on the event loop.
    pub fn stop(&self) -> Result<(), ServerError> {
        let runtime = self.current();
        if runtime.status() != ServerStatus::Running {
            return Err(LifecycleError::NotRunning.into());
        }
        self.data.clear_listeners();
        if !runtime.queue_stop() {
            warn!("stop could not be queued");
        }
        Ok(())
    }

    /// Block until the event-loop thread has exited.
    pub fn join(&self) -> Result<(), ServerError> {
        self.current().join()?;
        Ok(())
    }

    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    pub fn add_listener<F, Fut>(&self, listener: F)
    where
        F: Fn(ServerStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.status.add_listener(listener);
    }

    pub fn stop_listening(&self) {
        self.status.clear_listeners();
    }

    pub fn queue_message(&self, data: Value) -> Option<QueuedBroadcast> {
        self.current().queue_message(data)
    }

    pub fn public_key_hex(&self) -> String {
        self.current().backend().keys().public_key_hex()
    }

    pub fn scheme(&self) -> &'static str {
        self.current().backend().scheme()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current().backend().local_addr()
    }

    fn connect_sink(&self, runtime: &ServerRuntime<WebSocketServer>) {
        let sink = Arc::clone(&self.sink);
        let registry = Arc::clone(runtime.backend().registry());
        self.data.clear_listeners();
        self.data.add_listener(move |message: Option<InboundMessage>| {
            let sink = Arc::clone(&sink);
            let registry = Arc::clone(&registry);
            async move {
                let Some(message) = message else {
                    return;
                };
                if let Some(reply) = sink.on_message(message.payload, &message.connection).await {
                    registry.broadcast(&reply).await;
                }
            }
        });
    }

    fn current(&self) -> Arc<ServerRuntime<WebSocketServer>> {
        Arc::clone(&self.lock_runtime())
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Arc<ServerRuntime<WebSocketServer>>> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_runtime(
    config: &NaclgateConfig,
    status: &Arc<Observable<ServerStatus>>,
    data: &Arc<Observable<Option<InboundMessage>>>,
    ephemeral_keys: &OnceLock<ServerKeys>,
) -> Result<ServerRuntime<WebSocketServer>, ServerError> {
    config.validate()?;
    let settings = ServerSettings::from_config(config)?;
    let keys = match config.server.private_key_bytes()? {
        Some(bytes) => ServerKeys::from_bytes(bytes),
        None => ephemeral_keys
            .get_or_init(|| {
                let keys = ServerKeys::generate();
                warn!(
                    public_key = %keys.public_key_hex(),
                    "no private key configured, using an ephemeral key"
                );
                keys
            })
            .clone(),
    };
    let server = WebSocketServer::new(settings, keys)?;
    Ok(ServerRuntime::with_observables(
        server,
        Arc::clone(status),
        Arc::clone(data),
    ))
}
