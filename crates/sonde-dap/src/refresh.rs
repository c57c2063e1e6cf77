//! Coalesced refreshes.
//!
//! A [`Coalescer`] turns a burst of refresh triggers into one run of its job.
//! The first trigger starts a worker that waits for the coalescing window
//! and then runs the job with the most recent arguments. Triggers that arrive
//! while the job is running queue exactly one follow-up run.
//!
//! Runs never overlap, so a newer run always lands after an older one. Each
//! run receives a [`Ticket`]; [`Coalescer::invalidate`] makes every issued
//! ticket stale, and a job checks its ticket before writing its result so a
//! response that arrives after the state was cleared is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::lock;

/// Default coalescing window for thread and stack refreshes.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_millis(100);

type Job<A> = Arc<dyn Fn(A, Ticket) -> BoxFuture<'static, ()> + Send + Sync>;

struct State<A> {
    pending: Option<A>,
    running: bool,
}

struct Shared<A> {
    delay: Duration,
    job: Job<A>,
    state: Mutex<State<A>>,
    generation: Arc<AtomicU64>,
}

/// Collapses refresh triggers that arrive within one window.
pub struct Coalescer<A> {
    shared: Arc<Shared<A>>,
}

impl<A: Send + 'static> Coalescer<A> {
    /// Create a coalescer that runs `job` at most once per `delay`.
    pub fn new<F>(delay: Duration, job: F) -> Self
    where
        F: Fn(A, Ticket) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                delay,
                job: Arc::new(job),
                state: Mutex::new(State {
                    pending: None,
                    running: false,
                }),
                generation: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Schedule a run with `args`, replacing any arguments still waiting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, args: A) {
        self.request_with(|_| args);
    }

    /// Schedule a run whose arguments are derived from the ones still
    /// waiting, if any.
    pub fn request_with<F>(&self, update: F)
    where
        F: FnOnce(Option<A>) -> A,
    {
        let start = {
            let mut state = lock(&self.shared.state);
            let pending = state.pending.take();
            state.pending = Some(update(pending));
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            tokio::spawn(run(Arc::clone(&self.shared)));
        }
    }

    /// Drop waiting arguments and make every issued ticket stale.
    pub fn invalidate(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.state).pending = None;
    }

    /// Edit the arguments still waiting for the next run.
    pub fn update_pending<F>(&self, update: F)
    where
        F: FnOnce(&mut A),
    {
        if let Some(pending) = lock(&self.shared.state).pending.as_mut() {
            update(pending);
        }
    }

    /// Whether a run is scheduled or in progress.
    pub fn is_busy(&self) -> bool {
        lock(&self.shared.state).running
    }
}

impl<A> std::fmt::Debug for Coalescer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("delay", &self.shared.delay)
            .field("generation", &self.shared.generation.load(Ordering::SeqCst))
            .finish()
    }
}

async fn run<A: Send + 'static>(shared: Arc<Shared<A>>) {
    loop {
        tokio::time::sleep(shared.delay).await;
        let args = {
            let mut state = lock(&shared.state);
            match state.pending.take() {
                Some(args) => args,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
        let ticket = Ticket {
            generation: Arc::downgrade(&shared.generation),
            issued: shared.generation.load(Ordering::SeqCst),
        };
        (shared.job)(args, ticket).await;
    }
}

/// Proof of which trigger a run belongs to.
#[derive(Debug, Clone)]
pub struct Ticket {
    generation: Weak<AtomicU64>,
    issued: u64,
}

impl Ticket {
    /// False once the coalescer was invalidated or dropped.
    pub fn is_current(&self) -> bool {
        self.generation
            .upgrade()
            .is_some_and(|g| g.load(Ordering::SeqCst) == self.issued)
    }
}
