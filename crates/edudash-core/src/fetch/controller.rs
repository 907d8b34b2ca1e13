use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::FetchState;
use crate::api::ApiError;
use crate::config::RetryConfig;

type Operation<P, T> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;
type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ApiError) + Send + Sync>;

/// Retry policy and completion callbacks for a `FetchController`.
pub struct FetchOptions<T> {
    retries: u32,
    backoff: Duration,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            retries: retry.max_retries,
            backoff: retry.backoff(),
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> Clone for FetchOptions<T> {
    fn clone(&self) -> Self {
        Self {
            retries: self.retries,
            backoff: self.backoff,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> fmt::Debug for FetchOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T> FetchOptions<T> {
    pub fn from_retry(retry: &RetryConfig) -> Self {
        Self {
            retries: retry.max_retries,
            backoff: retry.backoff(),
            ..Self::default()
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Called once per operation that settles successfully, after state is updated.
    ///
    /// Skipped when a newer operation has started by the time it would run.
    pub fn on_success(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called once per operation that settles with a surfaced failure
    pub fn on_error(mut self, callback: impl Fn(&ApiError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// The operation currently allowed to publish state.
struct PendingOperation<P> {
    abort: AbortHandle,
    params: P,
    retries_remaining: u32,
    started_at: Instant,
}

struct Control<P> {
    /// Bumped on every execute, cancel, and dispose. A task may only publish
    /// while the generation it was started under is still current.
    generation: u64,
    pending: Option<PendingOperation<P>>,
    last_params: Option<P>,
    dependencies: Option<P>,
    disposed: bool,
}

struct Shared<P, T> {
    operation: Operation<P, T>,
    options: FetchOptions<T>,
    control: Mutex<Control<P>>,
    state: watch::Sender<FetchState<T>>,
}

enum AfterFailure {
    Retry(Duration),
    Surface,
    Superseded,
}

/// Runs an async operation with latest-wins cancellation and bounded retry.
///
/// Dropping the last handle tears the controller down: the in-flight
/// operation is aborted and no further state updates are published.
pub struct FetchController<P, T> {
    shared: Arc<Shared<P, T>>,
}

impl<P, T> FetchController<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(operation: F, options: FetchOptions<T>) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let operation: Operation<P, T> = Arc::new(move |params| operation(params).boxed());
        let (state, _) = watch::channel(FetchState::default());
        Self {
            shared: Arc::new(Shared {
                operation,
                options,
                control: Mutex::new(Control {
                    generation: 0,
                    pending: None,
                    last_params: None,
                    dependencies: None,
                    disposed: false,
                }),
                state,
            }),
        }
    }

    /// Cancel whatever is in flight and start the operation with `params`.
    ///
    /// The returned handle resolves once this operation settles, is
    /// superseded, or is cancelled. Awaiting it is optional.
    pub fn execute(&self, params: P) -> JoinHandle<()> {
        let (registration, generation) = {
            let mut control = self.shared.lock();
            if control.disposed {
                debug!("Ignoring execute on a disposed fetch controller");
                return tokio::spawn(async {});
            }
            if let Some(prior) = control.pending.take() {
                debug!(
                    elapsed_ms = prior.started_at.elapsed().as_millis() as u64,
                    "Superseding in-flight fetch"
                );
                prior.abort.abort();
            }
            control.generation += 1;

            let (abort, registration) = AbortHandle::new_pair();
            control.pending = Some(PendingOperation {
                abort,
                params: params.clone(),
                retries_remaining: self.shared.options.retries,
                started_at: Instant::now(),
            });
            control.last_params = Some(params);

            self.shared.state.send_modify(|state| {
                state.loading = true;
                state.error = None;
            });
            (registration, control.generation)
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(Abortable::new(Shared::drive(shared, generation), registration).map(|_| ()))
    }

    /// Run again with the most recently executed parameters
    pub fn refetch(&self) -> Option<JoinHandle<()>> {
        let params = self.shared.lock().last_params.clone()?;
        Some(self.execute(params))
    }

    /// Abort the in-flight operation, if any.
    ///
    /// Clears the loading flag; data and error are left as they were.
    pub fn cancel(&self) {
        let mut control = self.shared.lock();
        if control.disposed {
            return;
        }
        control.generation += 1;
        if let Some(pending) = control.pending.take() {
            debug!("Fetch cancelled");
            pending.abort.abort();
        }
        self.shared.state.send_modify(|state| state.loading = false);
    }

    /// Abort the in-flight operation and stop publishing for good.
    pub fn dispose(&self) {
        self.shared.shut_down();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    pub fn state(&self) -> FetchState<T> {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.shared.state.subscribe()
    }
}

impl<P, T> FetchController<P, T>
where
    P: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Re-execute when the inputs the operation depends on have changed.
    ///
    /// The first call always executes. Returns `None` when `dependencies`
    /// equal the previous ones.
    pub fn set_dependencies(&self, dependencies: P) -> Option<JoinHandle<()>> {
        {
            let mut control = self.shared.lock();
            if control.dependencies.as_ref() == Some(&dependencies) {
                return None;
            }
            control.dependencies = Some(dependencies.clone());
        }
        Some(self.execute(dependencies))
    }
}

impl<P, T> Drop for FetchController<P, T> {
    fn drop(&mut self) {
        self.shared.shut_down();
    }
}

impl<P, T> Shared<P, T> {
    fn lock(&self) -> MutexGuard<'_, Control<P>> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shut_down(&self) {
        let mut control = self.lock();
        if control.disposed {
            return;
        }
        control.disposed = true;
        control.generation += 1;
        if let Some(pending) = control.pending.take() {
            debug!("Fetch controller disposed with an operation in flight");
            pending.abort.abort();
        }
    }
}

impl<P, T> Shared<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn drive(self: Arc<Self>, generation: u64) {
        loop {
            // Parameters are read per attempt so a retry sees what is current now.
            let Some(params) = self.current_params(generation) else {
                return;
            };

            match (self.operation)(params).await {
                Ok(data) => {
                    self.settle_success(generation, data);
                    return;
                }
                Err(e) if e.is_cancelled() => {
                    debug!("Fetch operation reported cancellation");
                    return;
                }
                Err(e) => match self.after_failure(generation, &e) {
                    AfterFailure::Retry(backoff) => {
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Fetch failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                    AfterFailure::Surface => {
                        self.settle_failure(generation, e);
                        return;
                    }
                    AfterFailure::Superseded => return,
                },
            }
        }
    }

    fn current_params(&self, generation: u64) -> Option<P> {
        let control = self.lock();
        if control.disposed || control.generation != generation {
            return None;
        }
        control.pending.as_ref().map(|pending| pending.params.clone())
    }

    fn after_failure(&self, generation: u64, error: &ApiError) -> AfterFailure {
        let mut control = self.lock();
        if control.disposed || control.generation != generation {
            return AfterFailure::Superseded;
        }
        match control.pending.as_mut() {
            Some(pending) if error.is_retryable() && pending.retries_remaining > 0 => {
                pending.retries_remaining -= 1;
                AfterFailure::Retry(self.options.backoff)
            }
            Some(_) => AfterFailure::Surface,
            None => AfterFailure::Superseded,
        }
    }

    fn settle_success(&self, generation: u64, data: T) {
        {
            let mut control = self.lock();
            if control.disposed || control.generation != generation {
                return;
            }
            if let Some(pending) = control.pending.take() {
                debug!(
                    elapsed_ms = pending.started_at.elapsed().as_millis() as u64,
                    "Fetch settled"
                );
            }
            let published = data.clone();
            self.state.send_modify(|state| {
                state.loading = false;
                state.data = Some(published);
                state.error = None;
            });
        }
        // Callbacks run unlocked so they may call back into the controller.
        // An operation superseded in the meantime does not report.
        if let Some(callback) = &self.options.on_success {
            if self.is_current(generation) {
                callback(&data);
            }
        }
    }

    fn settle_failure(&self, generation: u64, error: ApiError) {
        {
            let mut control = self.lock();
            if control.disposed || control.generation != generation {
                return;
            }
            control.pending = None;
            warn!(error = %error, "Fetch failed");
            let published = error.clone();
            self.state.send_modify(|state| {
                state.loading = false;
                state.error = Some(published);
            });
        }
        if let Some(callback) = &self.options.on_error {
            if self.is_current(generation) {
                callback(&error);
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let control = self.lock();
        !control.disposed && control.generation == generation
    }
}
