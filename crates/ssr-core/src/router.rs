//! Two-phase router core (§4.5).
//!
//! For each insertion-time prefix the router keeps a static method→path
//! table (checked first, across every matching prefix, in a single pass)
//! and an ordered list of async path matchers (checked only if no static
//! hit occurred). The async phase runs up to `K` matchers concurrently and
//! declares the *earliest-inserted* matcher that resolves `true` as the
//! winner — not the one that happens to resolve first. Once build completes
//! the graph is never mutated again; lookups only read.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::http::{Method, Request};

/// Default number of concurrent in-flight async matcher calls (§4.5 step 3).
pub const DEFAULT_ASYNC_CONCURRENCY: usize = 10;

/// A fully built route: its handler plus whatever the matcher needed to
/// decide to dispatch here. `S` is the shared application state type passed
/// to every handler, mirroring `axum`'s `State<S>` convention.
pub struct BuiltRoute<S> {
    pub handler: RouteHandler<S>,
}

/// A boxed, cloneable async handler.
pub type RouteHandler<S> = Arc<
    dyn Fn(Request, S) -> Pin<Box<dyn Future<Output = crate::http::Response> + Send>>
        + Send
        + Sync,
>;

/// A path matcher for templated (non-literal) routes. Literal paths never
/// go through this trait — they're resolved by the static hash table — per
/// the design note that the two cases participate in entirely different
/// lookup phases and should not be unified behind one signature.
pub trait AsyncPathMatcher<S>: Send + Sync + 'static {
    /// Test whether this matcher claims `(method, path)`. Must be
    /// cancel-safe: if `cancel` fires, return promptly with `false`.
    fn matches<'a>(
        &'a self,
        method: &'a Method,
        path: &'a str,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// The handler to invoke once this matcher wins.
    fn route(&self) -> &BuiltRoute<S>;
}

type BoxedMatcher<S> = Arc<dyn AsyncPathMatcher<S>>;

/// One insertion-time prefix's routing data (§4.5 "Shape").
struct PrefixBucket<S> {
    prefix: String,
    /// method -> absolute path -> route
    static_table: HashMap<Method, HashMap<String, Arc<BuiltRoute<S>>>>,
    /// async matchers in insertion order, interleaved with their global
    /// ordinal so the race phase can enforce earliest-ordinal-wins across
    /// prefixes, not just within one.
    async_routes: Vec<(u64, BoxedMatcher<S>)>,
}

impl<S> PrefixBucket<S> {
    fn new(prefix: String) -> Self {
        Self {
            prefix,
            static_table: HashMap::new(),
            async_routes: Vec::new(),
        }
    }
}

/// Error returned when inserting a route that collides with an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConflict {
    pub prefix: String,
    pub method: Method,
    pub path: String,
}

impl std::fmt::Display for RouteConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "route conflict: {} {} already registered under prefix {:?}",
            self.method, self.path, self.prefix
        )
    }
}

impl std::error::Error for RouteConflict {}

/// The result of a lookup.
pub enum Lookup<S> {
    Hit(Arc<BuiltRoute<S>>),
    Miss,
}

/// The two-phase router. Built once (insertion phase), then read-only for
/// the remainder of the process's life (lookup phase).
pub struct Router<S> {
    buckets: Vec<PrefixBucket<S>>,
    async_concurrency: usize,
    next_ordinal: u64,
}

impl<S> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_async_concurrency(DEFAULT_ASYNC_CONCURRENCY)
    }

    pub fn with_async_concurrency(async_concurrency: usize) -> Self {
        Self {
            buckets: Vec::new(),
            async_concurrency: async_concurrency.max(1),
            next_ordinal: 0,
        }
    }

    fn bucket_mut(&mut self, prefix: &str) -> &mut PrefixBucket<S> {
        if let Some(idx) = self.buckets.iter().position(|b| b.prefix == prefix) {
            return &mut self.buckets[idx];
        }
        self.buckets.push(PrefixBucket::new(prefix.to_string()));
        self.buckets.last_mut().unwrap()
    }

    /// Insert a literal-path route under `prefix` for every method in
    /// `methods`. Fails if any (method, absolute path) pair is already
    /// registered under this prefix.
    pub fn insert_static(
        &mut self,
        prefix: &str,
        methods: &[Method],
        path: &str,
        route: BuiltRoute<S>,
    ) -> Result<(), RouteConflict> {
        let bucket = self.bucket_mut(prefix);
        for method in methods {
            if bucket
                .static_table
                .get(method)
                .is_some_and(|table| table.contains_key(path))
            {
                return Err(RouteConflict {
                    prefix: prefix.to_string(),
                    method: method.clone(),
                    path: path.to_string(),
                });
            }
        }
        let route = Arc::new(route);
        for method in methods {
            bucket
                .static_table
                .entry(method.clone())
                .or_default()
                .insert(path.to_string(), route.clone());
        }
        Ok(())
    }

    /// Append an async matcher under `prefix`, in insertion order.
    pub fn insert_async(&mut self, prefix: &str, matcher: Arc<dyn AsyncPathMatcher<S>>) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.bucket_mut(prefix).async_routes.push((ordinal, matcher));
    }

    /// Phase 1 + 2: exact path extraction and static-table lookup across
    /// every matching prefix in a single pass. Returns `Some` on a static
    /// hit; `None` means the async phase must run.
    fn lookup_static(&self, method: &Method, path: &str) -> Option<Arc<BuiltRoute<S>>> {
        for bucket in &self.buckets {
            if !path.starts_with(bucket.prefix.as_str()) {
                continue;
            }
            if let Some(table) = bucket.static_table.get(method) {
                if let Some(route) = table.get(path) {
                    return Some(route.clone());
                }
            }
        }
        None
    }

    /// Full lookup: static phase, then (if no hit) the ordered async race.
    pub async fn lookup(&self, method: &Method, raw_target: &str) -> Lookup<S> {
        let path = crate::http::path_only(raw_target);

        if let Some(route) = self.lookup_static(method, path) {
            return Lookup::Hit(route);
        }

        let mut candidates: Vec<(u64, BoxedMatcher<S>)> = Vec::new();
        for bucket in &self.buckets {
            if path.starts_with(bucket.prefix.as_str()) {
                candidates.extend(bucket.async_routes.iter().cloned());
            }
        }
        if candidates.is_empty() {
            return Lookup::Miss;
        }
        candidates.sort_by_key(|(ordinal, _)| *ordinal);

        match race_async_matchers(candidates, method.clone(), path.to_string(), self.async_concurrency)
            .await
        {
            Some(route) => Lookup::Hit(route),
            None => Lookup::Miss,
        }
    }
}

impl<S> Default for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Race `candidates` (already sorted by ascending ordinal) against
/// `(method, path)`, dispatching up to `concurrency` at a time, and return
/// the route belonging to the earliest-ordinal matcher to resolve `true`.
///
/// Implements §4.5's "front pointer" rule: a matcher at index `i` may only
/// be declared the winner once every candidate at index `< i` has either
/// resolved `false` or been cancelled — so a later dispatch resolving first
/// never jumps the queue.
async fn race_async_matchers<S>(
    candidates: Vec<(u64, BoxedMatcher<S>)>,
    method: Method,
    path: String,
    concurrency: usize,
) -> Option<Arc<BuiltRoute<S>>>
where
    S: Send + Sync + 'static,
{
    let n = candidates.len();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let cancel = CancellationToken::new();
    let path = Arc::new(path);
    let method = Arc::new(method);

    // results[i] = None (pending/not started), Some(true) (won), Some(false) (lost)
    let mut results: Vec<Option<bool>> = vec![None; n];
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(usize, bool)>();

    let mut dispatched = 0usize;
    let mut in_flight = 0usize;
    let mut handles = Vec::new();

    let mut dispatch_next = |dispatched: &mut usize, in_flight: &mut usize| {
        while *dispatched < n && *in_flight < concurrency {
            let idx = *dispatched;
            *dispatched += 1;
            *in_flight += 1;
            let (_, matcher) = candidates[idx].clone();
            let method = method.clone();
            let path = path.clone();
            let child_cancel = cancel.child_token();
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let matched = matcher.matches(&method, &path, child_cancel).await;
                let _ = tx.send((idx, matched));
            });
            handles.push(handle);
        }
    };

    dispatch_next(&mut dispatched, &mut in_flight);

    let mut winner: Option<usize> = None;
    loop {
        // Declare a winner only when no earlier-ordinal candidate remains
        // pending: scan from the front, stop at the first `None` (still
        // running) or the first `true` (winner).
        let mut front_blocked = false;
        let mut found_winner = None;
        for (i, result) in results.iter().enumerate() {
            match result {
                Some(true) => {
                    found_winner = Some(i);
                    break;
                }
                Some(false) => continue,
                None => {
                    front_blocked = true;
                    break;
                }
            }
        }
        if !front_blocked {
            winner = found_winner;
            break;
        }
        if results.iter().all(|r| *r == Some(false)) {
            break; // every candidate resolved false: a miss
        }

        match rx.recv().await {
            Some((idx, matched)) => {
                results[idx] = Some(matched);
                in_flight -= 1;
                dispatch_next(&mut dispatched, &mut in_flight);
            }
            None => break,
        }
    }

    cancel.cancel();
    for handle in handles {
        handle.abort();
    }

    winner.map(|idx| {
        let route_box: &BuiltRoute<S> = candidates[idx].1.route();
        // SAFETY-free: we just need another Arc to the same route; since
        // `BuiltRoute` isn't `Clone`, wrap the handler in a fresh Arc sharing
        // the same handler fn pointer.
        Arc::new(BuiltRoute {
            handler: route_box.handler.clone(),
        })
    })
}
