//! The actor contract: a unit of concurrent work with a cooperative stop.
//!
//! An actor is a pair of operations. `run` produces a future that completes when the work is
//! done or has failed; `interrupt` asks that future to complete promptly. A [`RunGroup`]
//! drives `run` on its own task and calls `interrupt` at most once.
//!
//! [`RunGroup`]: crate::lifecycle::group::RunGroup

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tracing::instrument::WithSubscriber;

/// Error type returned by actors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A `Future` that represents the execution of an actor.
pub type ActorFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;

/// Why a group is being torn down, handed to every interrupted actor.
#[derive(Debug, Clone, Copy)]
pub struct Termination<'a> {
    actor: &'a str,
    error: Option<&'a (dyn std::error::Error + Send + Sync + 'static)>,
}

impl<'a> Termination<'a> {
    pub(crate) fn new(actor: &'a str, error: Option<&'a BoxError>) -> Self {
        Self {
            actor,
            error: error.map(|e| e.as_ref()),
        }
    }

    /// Name of the actor whose completion triggered the teardown.
    pub fn actor(&self) -> &str {
        self.actor
    }

    /// Error the triggering actor returned, if it failed.
    pub fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.error
    }

    /// Whether the triggering actor completed cleanly.
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for Termination<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error {
            Some(e) => write!(f, "actor '{}' failed: {}", self.actor, e),
            None => write!(f, "actor '{}' stopped", self.actor),
        }
    }
}

/// A unit of concurrent work owned by a run group.
pub trait Actor: Send + 'static {
    /// Name used in logs and in the group outcome.
    fn name(&self) -> &str;

    /// Start the work.
    ///
    /// Called exactly once. The returned future runs on its own task and must complete
    /// promptly once [`Actor::interrupt`] has been called.
    fn run(&mut self) -> ActorFuture;

    /// Ask the running future to complete.
    ///
    /// Called at most once, never for the actor whose completion triggered the teardown,
    /// and must not block.
    fn interrupt(&mut self, cause: &Termination<'_>);
}

/// Raised when `run` is requested more than once from a function-backed actor.
#[derive(Debug, thiserror::Error)]
#[error("actor '{0}' was already started")]
pub struct AlreadyStarted(pub String);

type RunFn = Box<dyn FnOnce() -> ActorFuture + Send>;
type InterruptFn = Box<dyn FnOnce(&Termination<'_>) + Send>;

/// Function-pointer adapter for [`Actor`].
pub struct FnActor {
    name: String,
    run: Option<RunFn>,
    interrupt: Option<InterruptFn>,
}

impl FnActor {
    /// Build an actor from an async `run` and a synchronous `interrupt`.
    pub fn new<R, Fut, I>(name: impl Into<String>, run: R, interrupt: I) -> Self
    where
        R: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
        I: FnOnce(&Termination<'_>) + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Some(Box::new(move || Box::pin(run()) as ActorFuture)),
            interrupt: Some(Box::new(interrupt)),
        }
    }

    /// Build an actor whose `run` blocks a thread, e.g. a synchronous accept loop.
    ///
    /// `run` executes on the runtime's blocking pool with the caller's tracing dispatcher.
    pub fn blocking<R, I>(name: impl Into<String>, run: R, interrupt: I) -> Self
    where
        R: FnOnce() -> Result<(), BoxError> + Send + 'static,
        I: FnOnce(&Termination<'_>) + Send + 'static,
    {
        let name = name.into();
        let actor_name = name.clone();
        Self::new(
            name,
            move || async move {
                let dispatch = tracing::dispatcher::get_default(|d| d.clone());
                let joined =
                    tokio::task::spawn_blocking(move || tracing::dispatcher::with_default(&dispatch, run)).await;
                match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(Box::new(ActorPanicked(actor_name)) as BoxError),
                    Err(e) => Err(Box::new(e) as BoxError),
                }
            },
            interrupt,
        )
    }
}

impl Actor for FnActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> ActorFuture {
        match self.run.take() {
            Some(run) => run(),
            None => {
                let err: BoxError = Box::new(AlreadyStarted(self.name.clone()));
                Box::pin(async move { Err(err) })
            }
        }
    }

    fn interrupt(&mut self, cause: &Termination<'_>) {
        if let Some(interrupt) = self.interrupt.take() {
            interrupt(cause);
        }
    }
}

impl fmt::Debug for FnActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnActor")
            .field("name", &self.name)
            .field("started", &self.run.is_none())
            .field("interrupted", &self.interrupt.is_none())
            .finish()
    }
}

/// An actor's `run` panicked.
#[derive(Debug, thiserror::Error)]
#[error("actor '{0}' panicked")]
pub struct ActorPanicked(pub String);

/// Attach the current tracing dispatcher to an actor future before it is spawned.
pub(crate) fn with_current_dispatch(future: ActorFuture) -> impl Future<Output = Result<(), BoxError>> + Send {
    future.with_current_subscriber()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fn_actor_runs_once() {
        let mut actor = FnActor::new("once", || async { Ok(()) }, |_| {});
        assert!(actor.run().await.is_ok());

        let err = actor.run().await.unwrap_err();
        assert!(err.downcast_ref::<AlreadyStarted>().is_some());
    }

    #[test]
    fn fn_actor_interrupts_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let mut actor = FnActor::new(
            "counted",
            || async { Ok(()) },
            move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );

        let cause = Termination::new("other", None);
        actor.interrupt(&cause);
        actor.interrupt(&cause);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blocking_actor_reports_panics() {
        let mut actor = FnActor::blocking(
            "boom",
            || {
                if true {
                    panic!("boom");
                }
                Ok(())
            },
            |_| {},
        );
        let err = actor.run().await.unwrap_err();
        assert_eq!(err.to_string(), "actor 'boom' panicked");
    }

    #[test]
    fn termination_display_names_actor() {
        let err: BoxError = "socket closed".into();
        let cause = Termination::new("http", Some(&err));
        assert_eq!(cause.to_string(), "actor 'http' failed: socket closed");
        assert!(!cause.is_clean());
        assert!(Termination::new("signals", None).is_clean());
    }
}
