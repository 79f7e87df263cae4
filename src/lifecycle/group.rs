//! Run group: concurrent actors with tied termination.
//!
//! # Termination protocol
//! ```text
//! run()
//!     → spawn every actor's run future on its own task
//!     → wait for the first one to complete (value, error or panic)
//!     → interrupt every other actor once, in registration order
//!     → wait for all remaining tasks
//!     → return the first outcome
//! ```
//!
//! Secondary failures observed while the group winds down are logged and dropped so that the
//! returned error is always the one that caused the teardown.

use std::collections::HashMap;

use metrics::{counter, gauge};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::actor::{with_current_dispatch, Actor, ActorPanicked, BoxError, FnActor, Termination};

/// The error that terminated a group, carried unchanged from the actor that produced it.
#[derive(Debug, thiserror::Error)]
#[error("actor '{actor}' terminated the group: {source}")]
pub struct RunError {
    /// Name of the actor that failed.
    pub actor: String,
    /// The actor's own error.
    pub source: BoxError,
}

impl RunError {
    /// Attempt to view the actor's error as a concrete type.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

/// A set of actors that run concurrently and stop together.
#[derive(Default)]
pub struct RunGroup {
    actors: Vec<Box<dyn Actor>>,
}

impl RunGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor.
    pub fn add<A: Actor>(&mut self, actor: A) -> &mut Self {
        self.actors.push(Box::new(actor));
        self
    }

    /// Register a function-backed actor.
    pub fn add_fn<R, Fut, I>(&mut self, name: impl Into<String>, run: R, interrupt: I) -> &mut Self
    where
        R: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
        I: FnOnce(&Termination<'_>) + Send + 'static,
    {
        self.add(FnActor::new(name, run, interrupt))
    }

    /// Number of registered actors.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Whether no actor has been registered.
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Names of the registered actors, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.actors.iter().map(|a| a.name().to_string()).collect()
    }

    /// Run every actor until the first one completes, then tear the rest down.
    ///
    /// Returns once every actor's future has completed.
    ///
    /// # Errors
    ///
    /// Returns the error of the actor whose completion triggered the teardown.
    pub async fn run(mut self) -> Result<(), RunError> {
        if self.actors.is_empty() {
            debug!("Run group has no actors, nothing to do");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        let mut indices: HashMap<Id, usize> = HashMap::with_capacity(self.actors.len());

        for (index, actor) in self.actors.iter_mut().enumerate() {
            debug!(actor = actor.name(), "Starting actor");
            let handle = tasks.spawn(with_current_dispatch(actor.run()));
            indices.insert(handle.id(), index);
        }
        gauge!("actors_running").set(self.actors.len() as f64);

        // The set is non-empty, so the first completion always exists.
        let (trigger, outcome) = match tasks.join_next_with_id().await {
            Some(joined) => self.resolve(&indices, joined),
            None => return Ok(()),
        };
        let trigger_name = self.actors[trigger].name().to_string();
        record_exit(&trigger_name, &outcome);

        match &outcome {
            Ok(()) => info!(actor = %trigger_name, "Actor stopped, shutting down run group"),
            Err(e) => error!(actor = %trigger_name, error = %e, "Actor failed, shutting down run group"),
        }

        let cause = Termination::new(&trigger_name, outcome.as_ref().err());
        for (index, actor) in self.actors.iter_mut().enumerate() {
            if index != trigger {
                debug!(actor = actor.name(), cause = %cause, "Interrupting actor");
                actor.interrupt(&cause);
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (index, result) = self.resolve(&indices, joined);
            let name = self.actors[index].name();
            record_exit(name, &result);
            match result {
                Ok(()) => debug!(actor = name, "Actor stopped"),
                Err(e) => warn!(actor = name, error = %e, "Actor failed during shutdown"),
            }
        }
        gauge!("actors_running").set(0.0);

        match outcome {
            Ok(()) => {
                info!(actor = %trigger_name, "Run group stopped cleanly");
                Ok(())
            }
            Err(source) => {
                error!(actor = %trigger_name, error = %source, "Run group terminated by actor failure");
                Err(RunError {
                    actor: trigger_name,
                    source,
                })
            }
        }
    }

    fn resolve(
        &self,
        indices: &HashMap<Id, usize>,
        joined: Result<(Id, Result<(), BoxError>), JoinError>,
    ) -> (usize, Result<(), BoxError>) {
        match joined {
            Ok((id, result)) => (indices[&id], result),
            Err(e) => {
                let index = indices[&e.id()];
                let err: BoxError = if e.is_panic() {
                    Box::new(ActorPanicked(self.actors[index].name().to_string()))
                } else {
                    Box::new(e)
                };
                (index, Err(err))
            }
        }
    }
}

impl std::fmt::Debug for RunGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGroup").field("actors", &self.names()).finish()
    }
}

fn record_exit(actor: &str, outcome: &Result<(), BoxError>) {
    let outcome = if outcome.is_ok() { "ok" } else { "error" };
    counter!("actor_exits_total", "actor" => actor.to_string(), "outcome" => outcome).increment(1);
}
