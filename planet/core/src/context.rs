//! Lifecycle contexts: an ownership tree of Created → Running → Stopping →
//! Stopped nodes. Stop requests travel down the tree, completion travels up.
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use planet_spec::{PlanetError, PlanetResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Lifecycle state of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but not started.
    Created,
    /// Accepting work.
    Running,
    /// Draining; no new work is accepted.
    Stopping,
    /// All tasks and children have finished.
    Stopped,
}

/// How a context should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Cancel in-flight work now.
    Immediate,
    /// Let in-flight work finish, escalating to `Immediate` after `timeout`.
    Graceful {
        /// Upper bound on the drain.
        timeout: Duration,
    },
}

/// A lifecycle-managed node in the host's process tree.
pub struct Context {
    label: String,
    state: watch::Sender<LifecycleState>,
    closing: CancellationToken,
    abort: CancellationToken,
    tasks: TaskTracker,
    parent: Option<Weak<Context>>,
    children: Mutex<Vec<Arc<Context>>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Context {
    /// New root context in the `Created` state.
    pub fn root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(
            label.into(),
            CancellationToken::new(),
            CancellationToken::new(),
            None,
        ))
    }

    fn build(
        label: String,
        closing: CancellationToken,
        abort: CancellationToken,
        parent: Option<Weak<Context>>,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            label,
            state,
            closing,
            abort,
            tasks: TaskTracker::new(),
            parent,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Attach a child context. Fails once this context is stopping.
    pub fn child(self: &Arc<Self>, label: impl Into<String>) -> PlanetResult<Arc<Context>> {
        let mut children = self.children.lock();
        if matches!(
            self.state(),
            LifecycleState::Stopping | LifecycleState::Stopped
        ) {
            return Err(PlanetError::NotRunning(self.label.clone()));
        }
        let child = Arc::new(Self::build(
            label.into(),
            self.closing.child_token(),
            self.abort.child_token(),
            Some(Arc::downgrade(self)),
        ));
        children.push(child.clone());
        Ok(child)
    }

    /// Context label, used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Move from `Created` to `Running`.
    pub fn start(&self) -> PlanetResult<()> {
        let started = self.state.send_if_modified(|s| {
            if *s == LifecycleState::Created {
                *s = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        match self.state() {
            LifecycleState::Running => {
                if started {
                    debug!(context = %self.label, "started");
                }
                Ok(())
            }
            _ => Err(PlanetError::NotRunning(self.label.clone())),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// True while `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Fires when any stop (graceful or immediate) begins.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Fires when in-flight work must be abandoned.
    pub fn abort(&self) -> &CancellationToken {
        &self.abort
    }

    /// Number of child contexts still attached.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Spawn a task whose completion this context waits for on stop.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(fut)
    }

    /// Resolves once the context reaches `Stopped`.
    pub async fn done(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == LifecycleState::Stopped).await;
    }

    /// Stop this context and all of its children, resolving once `Stopped`.
    pub fn stop(self: &Arc<Self>, mode: ShutdownMode) -> BoxFuture<'static, ()> {
        let ctx = self.clone();
        async move {
            let first = ctx.state.send_if_modified(|s| match s {
                LifecycleState::Created | LifecycleState::Running => {
                    *s = LifecycleState::Stopping;
                    true
                }
                _ => false,
            });
            if mode == ShutdownMode::Immediate {
                ctx.abort.cancel();
            }
            if !first {
                ctx.done().await;
                return;
            }
            debug!(context = %ctx.label, ?mode, "stopping");
            ctx.closing.cancel();

            let children: Vec<Arc<Context>> = ctx.children.lock().clone();
            let drain = async {
                join_all(children.iter().map(|c| c.stop(mode))).await;
                ctx.tasks.close();
                ctx.tasks.wait().await;
            };
            match mode {
                ShutdownMode::Immediate => drain.await,
                ShutdownMode::Graceful { timeout } => {
                    if tokio::time::timeout(timeout, drain).await.is_err() {
                        warn!(context = %ctx.label, "graceful stop timed out, aborting");
                        ctx.abort.cancel();
                        join_all(children.iter().map(|c| c.stop(ShutdownMode::Immediate)))
                            .await;
                        ctx.tasks.close();
                        ctx.tasks.wait().await;
                    }
                }
            }

            ctx.state.send_replace(LifecycleState::Stopped);
            debug!(context = %ctx.label, "stopped");
            if let Some(parent) = ctx.parent.as_ref().and_then(Weak::upgrade) {
                parent.children.lock().retain(|c| !Arc::ptr_eq(c, &ctx));
            }
        }
        .boxed()
    }
}
