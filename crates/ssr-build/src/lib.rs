//! Bounded-concurrency artifact build scheduler (§4.6).
//!
//! Takes an ordered collection of `(prefix, descriptor)` pairs and realizes
//! each one — running its handler factory, resolving it if it's also an
//! async producer, then inserting the built route into the router under
//! its prefix — with at most `B` realizations running concurrently.
//! Mutation of the router is serialized by an async mutex so two
//! realizations never race to insert into the same bucket; readers of the
//! router never observe a partially-inserted route because every insertion
//! happens while holding that same lock.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::instrument;

use ssr_core::router::{BuiltRoute, Router};

/// Default number of descriptors realized concurrently (§4.6).
pub const DEFAULT_BUILD_PARALLELISM: usize = 1;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One unit of build work: either a single route, or a factory that
/// produces a list of routes which must be realized sequentially within the
/// slot that claimed it (§4.6, "Factory-produced lists realize sequentially
/// within one slot to avoid deadlocks").
pub enum RouteDescriptor<S> {
    Single(Box<dyn FnOnce() -> BoxFuture<'static, BuildResult<S>> + Send>),
    Factory(Box<dyn FnOnce() -> BoxFuture<'static, Result<Vec<RouteDescriptor<S>>, BuildError>> + Send>),
}

/// What a single descriptor realization yields: the literal/async
/// classification needed to insert it into the router.
pub enum BuildOutcome<S> {
    Static {
        methods: Vec<ssr_core::http::Method>,
        path: String,
        route: BuiltRoute<S>,
    },
    Async(Arc<dyn ssr_core::router::AsyncPathMatcher<S>>),
}

pub type BuildResult<S> = Result<BuildOutcome<S>, BuildError>;

#[derive(Debug, Clone)]
pub struct BuildError {
    pub prefix: String,
    pub message: String,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "build failed for prefix {:?}: {}", self.prefix, self.message)
    }
}

impl std::error::Error for BuildError {}

/// A queued `(prefix, descriptor)` pair awaiting realization.
pub struct QueuedDescriptor<S> {
    pub prefix: String,
    pub descriptor: RouteDescriptor<S>,
}

/// Drives the bounded-concurrency realization of a queue of descriptors
/// against a shared [`Router`].
pub struct BuildScheduler<S> {
    router: Arc<Mutex<Router<S>>>,
    semaphore: Arc<Semaphore>,
}

impl<S> BuildScheduler<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(router: Arc<Mutex<Router<S>>>, build_parallelism: usize) -> Self {
        Self {
            router,
            semaphore: Arc::new(Semaphore::new(build_parallelism.max(1))),
        }
    }

    /// Run every queued descriptor to completion. On the first realization
    /// failure the whole build fails — in-flight realizations are allowed
    /// to finish (they may already have mutated the router; partial builds
    /// are not rolled back, matching the "nothing crashes the process"
    /// policy of never leaving the router in a torn state, just an
    /// incomplete one).
    #[instrument(skip(self, queue))]
    pub async fn run(&self, queue: Vec<QueuedDescriptor<S>>) -> Result<(), BuildError> {
        let mut handles = Vec::with_capacity(queue.len());

        for item in queue {
            let semaphore = self.semaphore.clone();
            let router = self.router.clone();
            let prefix = item.prefix;
            let descriptor = item.descriptor;

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                realize(&router, &prefix, descriptor).await
            });
            handles.push(handle);
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(prefix = %err.prefix, message = %err.message, "route build failed");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    let err = BuildError {
                        prefix: "<unknown>".into(),
                        message: format!("build task panicked: {join_err}"),
                    };
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits until the scheduler has no acquirable permits in flight, i.e.
    /// every previously-submitted slot has drained. Used by the terminator
    /// step before the build returns (§4.6 "Termination").
    pub async fn drain(&self, build_parallelism: usize) {
        // Acquiring every permit blocks until all in-flight realizations
        // have released theirs.
        let _all = self
            .semaphore
            .acquire_many(build_parallelism.max(1) as u32)
            .await
            .expect("semaphore closed");
    }
}

fn realize<'a, S>(
    router: &'a Arc<Mutex<Router<S>>>,
    prefix: &'a str,
    descriptor: RouteDescriptor<S>,
) -> BoxFuture<'a, Result<(), BuildError>>
where
    S: Clone + Send + Sync + 'static,
{
    Box::pin(async move {
        match descriptor {
            RouteDescriptor::Single(factory) => {
                let outcome = factory().await?;
                insert_outcome(router, prefix, outcome).await
            }
            RouteDescriptor::Factory(factory) => {
                let sub_descriptors = factory().await.map_err(|mut e| {
                    e.prefix = prefix.to_string();
                    e
                })?;
                // Sequential within this slot (§4.6 "Sequential generator
                // fan-in" design note and §4.6's factory contract).
                for sub in sub_descriptors {
                    realize(router, prefix, sub).await?;
                }
                Ok(())
            }
        }
    })
}

async fn insert_outcome<S>(
    router: &Arc<Mutex<Router<S>>>,
    prefix: &str,
    outcome: BuildOutcome<S>,
) -> Result<(), BuildError>
where
    S: Clone + Send + Sync + 'static,
{
    let mut guard = router.lock().await;
    match outcome {
        BuildOutcome::Static { methods, path, route } => {
            guard
                .insert_static(prefix, &methods, &path, route)
                .map_err(|conflict| BuildError {
                    prefix: prefix.to_string(),
                    message: conflict.to_string(),
                })?;
        }
        BuildOutcome::Async(matcher) => {
            guard.insert_async(prefix, matcher);
        }
    }
    Ok(())
}
