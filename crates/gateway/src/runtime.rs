//! Runs a server backend on its own event-loop thread.
//!
//! The control thread only talks to the loop through a bounded command
//! channel; connection state and channel lookups never leave the loop thread.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::{
        runtime::Handle,
        sync::{mpsc, oneshot},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{observable::Observable, registry::BroadcastReport};

/// Name of the dedicated event-loop thread.
pub const WORKER_THREAD_NAME: &str = "ServerThread";

/// Queued commands the loop has not consumed yet.
const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Stopped,
    Running,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running => f.write_str("running"),
        }
    }
}

/// Lifecycle calls made out of turn. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("join() called from the event-loop thread")]
    JoinFromEventLoop,

    #[error("event-loop thread panicked")]
    WorkerPanicked,

    #[error("failed to spawn event-loop thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("route `{0}` has no response shape and is not excluded from authentication")]
    UnshapedRoute(String),

    #[error("server failed: {0:#}")]
    ServeFailed(anyhow::Error),
}

/// What a backend sees while it is being served.
pub struct RuntimeContext<I> {
    pub status: Arc<Observable<ServerStatus>>,
    pub data: Arc<Observable<Option<I>>>,
    /// Cancelled by [`ServerBackend::stop`]; `serve` returns after observing it.
    pub shutdown: CancellationToken,
}

impl<I> Clone for RuntimeContext<I> {
    fn clone(&self) -> Self {
        Self {
            status: Arc::clone(&self.status),
            data: Arc::clone(&self.data),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// A concrete server driven by [`ServerRuntime`].
#[async_trait]
pub trait ServerBackend: Send + Sync + 'static {
    /// Messages published on the data observable.
    type Inbound: Clone + Send + Sync + 'static;

    /// Bind, set status to `Running`, serve until `ctx.shutdown` fires, tear
    /// down, set status to `Stopped`.
    async fn serve(&self, ctx: RuntimeContext<Self::Inbound>) -> anyhow::Result<()>;

    /// Raise the internal stop signal.
    async fn stop(&self, ctx: &RuntimeContext<Self::Inbound>) -> Result<(), LifecycleError> {
        if ctx.status.get() != ServerStatus::Running {
            return Err(LifecycleError::NotRunning);
        }
        ctx.shutdown.cancel();
        Ok(())
    }

    /// Send `data` to every live connection.
    async fn broadcast(&self, data: Value) -> BroadcastReport;
}

enum Command {
    Stop,
    Broadcast {
        data: Value,
        done: oneshot::Sender<BroadcastReport>,
    },
}

/// Completion handle for a broadcast scheduled with [`ServerRuntime::queue_message`].
#[derive(Debug)]
pub struct QueuedBroadcast {
    rx: oneshot::Receiver<BroadcastReport>,
}

impl QueuedBroadcast {
    /// Block until the broadcast ran. `None` if the loop exited first.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self) -> Option<BroadcastReport> {
        self.rx.blocking_recv().ok()
    }

    pub async fn done(self) -> Option<BroadcastReport> {
        self.rx.await.ok()
    }
}

type CommandSlot = Arc<Mutex<Option<mpsc::Sender<Command>>>>;

/// The event-loop thread returns how `serve` ended.
type Worker = thread::JoinHandle<anyhow::Result<()>>;

/// `Stopped --start()--> Running --stop()--> Stopped`, on a dedicated thread.
pub struct ServerRuntime<B: ServerBackend> {
    backend: Arc<B>,
    status: Arc<Observable<ServerStatus>>,
    data: Arc<Observable<Option<B::Inbound>>>,
    commands: CommandSlot,
    worker: Mutex<Option<Worker>>,
}

impl<B: ServerBackend> ServerRuntime<B> {
    pub fn new(backend: B) -> Self {
        Self::with_observables(
            backend,
            Arc::new(Observable::new("status", ServerStatus::Stopped)),
            Arc::new(Observable::new("data", None)),
        )
    }

    /// Use existing observables so listeners survive a backend rebuild.
    pub fn with_observables(
        backend: B,
        status: Arc<Observable<ServerStatus>>,
        data: Arc<Observable<Option<B::Inbound>>>,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            status,
            data,
            commands: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    pub fn status_observable(&self) -> &Arc<Observable<ServerStatus>> {
        &self.status
    }

    pub fn data_observable(&self) -> &Arc<Observable<Option<B::Inbound>>> {
        &self.data
    }

    /// Spawn the event-loop thread and return without waiting for the bind.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.as_ref()
            && !handle.is_finished()
        {
            return Err(LifecycleError::AlreadyRunning);
        }
        if self.status.get() != ServerStatus::Stopped {
            return Err(LifecycleError::AlreadyRunning);
        }
        // A finished worker that nobody joined yet.
        if let Some(handle) = worker.take() {
            match handle.join() {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(error = %e, "previous run ended with an error"),
                Err(_) => warn!("previous event-loop thread panicked"),
            }
        }

        let backend = Arc::clone(&self.backend);
        let status = Arc::clone(&self.status);
        let data = Arc::clone(&self.data);
        let commands = Arc::clone(&self.commands);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || -> anyhow::Result<()> {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .inspect_err(|e| error!(error = %e, "failed to build event loop"))?;
                rt.block_on(run_event_loop(backend, status, data, commands))
            })
            .map_err(LifecycleError::Spawn)?;

        info!(thread = WORKER_THREAD_NAME, "event-loop thread started");
        *worker = Some(handle);
        Ok(())
    }

    /// Schedule the stop sequence. Returns `false` when the loop is not running.
    pub fn queue_stop(&self) -> bool {
        self.send(Command::Stop)
    }

    /// Schedule a broadcast of `data`. `None` when the loop is not running.
    pub fn queue_message(&self, data: Value) -> Option<QueuedBroadcast> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Broadcast { data, done })
            .then_some(QueuedBroadcast { rx })
    }

    /// Block until the event-loop thread has exited.
    ///
    /// A `serve` that ended with an error is reported as
    /// [`LifecycleError::ServeFailed`], once.
    pub fn join(&self) -> Result<(), LifecycleError> {
        let mut worker = lock(&self.worker);
        let Some(handle) = worker.take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            *worker = Some(handle);
            return Err(LifecycleError::JoinFromEventLoop);
        }
        drop(worker);

        let outcome = handle.join().map_err(|_| LifecycleError::WorkerPanicked)?;
        debug!("event-loop thread joined");
        outcome.map_err(LifecycleError::ServeFailed)
    }

    pub fn is_worker_alive(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn send(&self, command: Command) -> bool {
        let commands = lock(&self.commands);
        let Some(tx) = commands.as_ref() else {
            debug!("event loop not running, command ignored");
            return false;
        };
        match tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to queue command");
                false
            },
        }
    }
}

impl<B: ServerBackend> Drop for ServerRuntime<B> {
    fn drop(&mut self) {
        if self.is_worker_alive() && self.status.get() == ServerStatus::Running {
            self.queue_stop();
        }
    }
}

async fn run_event_loop<B: ServerBackend>(
    backend: Arc<B>,
    status: Arc<Observable<ServerStatus>>,
    data: Arc<Observable<Option<B::Inbound>>>,
    commands: CommandSlot,
) -> anyhow::Result<()> {
    let handle = Handle::current();
    status.attach(handle.clone());
    data.attach(handle);

    let (tx, mut rx) = mpsc::channel(COMMAND_CAPACITY);
    *lock(&commands) = Some(tx);

    let ctx = RuntimeContext {
        status: Arc::clone(&status),
        data: Arc::clone(&data),
        shutdown: CancellationToken::new(),
    };
    let serve = backend.serve(ctx.clone());
    tokio::pin!(serve);

    let outcome = loop {
        tokio::select! {
            result = &mut serve => {
                if let Err(e) = &result {
                    error!(error = %e, "server exited with error");
                }
                break result;
            }
            Some(command) = rx.recv() => match command {
                Command::Stop => {
                    if let Err(e) = backend.stop(&ctx).await {
                        warn!(error = %e, "stop request ignored");
                    }
                },
                Command::Broadcast { data, done } => {
                    let backend = Arc::clone(&backend);
                    tokio::spawn(async move {
                        let _ = done.send(backend.broadcast(data).await);
                    });
                },
            },
        }
    };

    *lock(&commands) = None;
    if status.get() != ServerStatus::Stopped {
        status.set(ServerStatus::Stopped);
    }
    // Let `Stopped` listeners finish before the loop is torn down.
    if let Some(pending) = status.take_pending()
        && let Err(e) = pending.await
    {
        warn!(error = %e, "status listener panicked");
    }
    status.detach();
    data.detach();
    info!("event loop exited");
    outcome
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            sync::{Weak, mpsc as std_mpsc},
            time::Duration,
        },
    };

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct MockBackend {
        fail: bool,
        broadcasts: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ServerBackend for MockBackend {
        type Inbound = Value;

        async fn serve(&self, ctx: RuntimeContext<Value>) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("address in use");
            }
            ctx.status.set(ServerStatus::Running);
            ctx.shutdown.cancelled().await;
            ctx.status.set(ServerStatus::Stopped);
            Ok(())
        }

        async fn broadcast(&self, data: Value) -> BroadcastReport {
            lock(&self.broadcasts).push(data);
            BroadcastReport {
                delivered: 1,
                ..Default::default()
            }
        }
    }

    fn watch_status(
        runtime: &ServerRuntime<MockBackend>,
    ) -> std_mpsc::Receiver<ServerStatus> {
        let (tx, rx) = std_mpsc::channel();
        runtime.status_observable().add_listener(move |status| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(status);
            }
        });
        rx
    }

    #[test]
    fn full_lifecycle() {
        let runtime = ServerRuntime::new(MockBackend::default());
        let statuses = watch_status(&runtime);

        runtime.start().unwrap();
        assert_eq!(statuses.recv_timeout(WAIT).unwrap(), ServerStatus::Running);
        assert!(matches!(runtime.start(), Err(LifecycleError::AlreadyRunning)));

        let report = runtime
            .queue_message(serde_json::json!({"hello": "world"}))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(lock(&runtime.backend().broadcasts).len(), 1);

        assert!(runtime.queue_stop());
        runtime.join().unwrap();
        assert_eq!(runtime.status(), ServerStatus::Stopped);
        // The final fan-out is awaited before the thread exits.
        assert_eq!(statuses.try_recv().unwrap(), ServerStatus::Stopped);
        assert!(!runtime.is_worker_alive());
    }

    #[test]
    fn queue_operations_before_start_are_no_ops() {
        let runtime = ServerRuntime::new(MockBackend::default());
        assert!(!runtime.queue_stop());
        assert!(runtime.queue_message(serde_json::json!(1)).is_none());
        runtime.join().unwrap();
        assert_eq!(runtime.status(), ServerStatus::Stopped);
    }

    #[test]
    fn runtime_restarts_after_join() {
        let runtime = ServerRuntime::new(MockBackend::default());
        let statuses = watch_status(&runtime);

        for _ in 0..2 {
            runtime.start().unwrap();
            assert_eq!(statuses.recv_timeout(WAIT).unwrap(), ServerStatus::Running);
            assert!(runtime.queue_stop());
            runtime.join().unwrap();
            assert_eq!(statuses.recv_timeout(WAIT).unwrap(), ServerStatus::Stopped);
        }
    }

    #[test]
    fn join_from_event_loop_is_rejected() {
        let runtime = Arc::new(ServerRuntime::new(MockBackend::default()));
        let weak: Weak<ServerRuntime<MockBackend>> = Arc::downgrade(&runtime);
        let (tx, rx) = std_mpsc::channel();
        runtime.status_observable().add_listener(move |status| {
            let weak = weak.clone();
            let tx = tx.clone();
            async move {
                if status == ServerStatus::Running
                    && let Some(runtime) = weak.upgrade()
                {
                    let _ = tx.send(matches!(
                        runtime.join(),
                        Err(LifecycleError::JoinFromEventLoop)
                    ));
                }
            }
        });

        runtime.start().unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert!(runtime.queue_stop());
        runtime.join().unwrap();
    }

    #[test]
    fn failed_serve_ends_the_loop() {
        let runtime = ServerRuntime::new(MockBackend {
            fail: true,
            ..Default::default()
        });
        runtime.start().unwrap();
        let err = runtime.join().unwrap_err();
        assert!(matches!(err, LifecycleError::ServeFailed(_)));
        assert!(err.to_string().contains("address in use"));
        assert_eq!(runtime.status(), ServerStatus::Stopped);
        assert!(!runtime.queue_stop());
        // Reported once; the worker is gone after that.
        runtime.join().unwrap();
    }

    #[tokio::test]
    async fn stop_requires_running() {
        let backend = MockBackend::default();
        let ctx = RuntimeContext {
            status: Arc::new(Observable::new("status", ServerStatus::Stopped)),
            data: Arc::new(Observable::new("data", None)),
            shutdown: CancellationToken::new(),
        };
        assert!(matches!(
            backend.stop(&ctx).await,
            Err(LifecycleError::NotRunning)
        ));
        assert!(!ctx.shutdown.is_cancelled());

        ctx.status.set(ServerStatus::Running);
        backend.stop(&ctx).await.unwrap();
        assert!(ctx.shutdown.is_cancelled());
    }
}
