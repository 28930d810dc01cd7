//! A settable value whose changes fan out to async listeners on the owning event loop.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    futures::future::{BoxFuture, join_all},
    tokio::{runtime::Handle, task::JoinHandle},
    tracing::{debug, trace},
};

type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Holds a value and notifies listeners whenever it is [`set`](Observable::set).
///
/// `set` never blocks on listeners: it schedules one fan-out task on the
/// attached event loop, which runs every listener concurrently. There is no
/// ordering between listeners of one fan-out, and a later `set` may be
/// delivered before an earlier one finishes.
pub struct Observable<T> {
    name: &'static str,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    owner: Mutex<Option<Handle>>,
    notifications: AtomicU64,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, initial: T) -> Self {
        Self {
            name,
            value: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            owner: Mutex::new(None),
            notifications: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> T {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Store `value` and schedule a fan-out if anyone is listening.
    pub fn set(&self, value: T) {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = value.clone();

        let listeners = lock(&self.listeners).clone();
        if listeners.is_empty() {
            return;
        }

        let Some(handle) = lock(&self.owner)
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            debug!(observable = self.name, "no event loop attached, dropping notification");
            return;
        };

        let id = self.notifications.fetch_add(1, Ordering::Relaxed);
        trace!(observable = self.name, id, listeners = listeners.len(), "scheduling fan-out");
        let task = handle.spawn(async move {
            join_all(listeners.iter().map(|listener| listener(value.clone()))).await;
        });

        // Overwrites without cancelling: an earlier fan-out keeps running.
        *lock(&self.pending) = Some(task);
    }

    pub fn add_listener<F, Fut>(&self, listener: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        lock(&self.listeners).push(Arc::new(move |value: T| -> BoxFuture<'static, ()> {
            Box::pin(listener(value))
        }));
    }

    /// Remove every listener. Fan-outs already scheduled still run.
    pub fn clear_listeners(&self) {
        lock(&self.listeners).clear();
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Number of fan-outs scheduled so far.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    /// Bind fan-outs to the given event loop.
    pub fn attach(&self, handle: Handle) {
        *lock(&self.owner) = Some(handle);
    }

    pub fn detach(&self) {
        *lock(&self.owner) = None;
    }

    /// Take the handle of the most recently scheduled fan-out.
    pub fn take_pending(&self) -> Option<JoinHandle<()>> {
        lock(&self.pending).take()
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("value", &*self.value.read().unwrap_or_else(|e| e.into_inner()))
            .field("listeners", &lock(&self.listeners).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
