//! Inference dispatcher: a fixed worker pool between the request and
//! response queues

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Mutex, PoisonError};

use ambrosia_core::{CancelToken, Limiter, RetryPolicy};
use anyhow::Context;

use crate::error::ProviderError;
use crate::provider::{Provider, Request, Response};

/// Repeat the retry warning every this many failed attempts
const WARN_EVERY: u32 = 10;

/// Outcome counts for one dispatch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Responses handed to the response queue
    pub completed: usize,
    /// Failed attempts that were retried
    pub retries: usize,
    /// Requests abandoned by the retry policy
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    retries: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            completed: self.completed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

enum Outcome {
    Done(Response),
    GaveUp,
    Cancelled,
}

/// Worker pool calling a provider under an optional rate limiter.
pub struct Dispatcher<'a> {
    provider: &'a dyn Provider,
    /// `None` runs unthrottled (dry-run)
    limiter: Option<&'a Limiter>,
    retry: RetryPolicy<ProviderError>,
    workers: usize,
    cancel: CancelToken,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Dispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("provider", &self.provider.name())
            .field("throttled", &self.limiter.is_some())
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        limiter: Option<&'a Limiter>,
        retry: RetryPolicy<ProviderError>,
        workers: usize,
        cancel: CancelToken,
    ) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dispatch-{i}"))
            .build()
            .context("Failed to create thread pool")?;
        Ok(Self {
            provider,
            limiter,
            retry,
            workers,
            cancel,
            pool,
        })
    }

    /// Drain `rx` with every worker until it is closed and empty, the run is
    /// cancelled, or `tx` hangs up. `tx` is dropped on return, closing the
    /// response queue.
    pub fn run(&self, rx: Receiver<Request>, tx: SyncSender<Response>) -> DispatchStats {
        let rx = Mutex::new(rx);
        let counters = Counters::default();
        self.pool.install(|| {
            rayon::scope(|s| {
                for _ in 0..self.workers {
                    s.spawn(|_| self.work(&rx, &tx, &counters));
                }
            })
        });
        let stats = counters.snapshot();
        log::debug!(
            "dispatcher finished: {} completed, {} retries, {} failed",
            stats.completed,
            stats.retries,
            stats.failed
        );
        stats
    }

    fn work(&self, rx: &Mutex<Receiver<Request>>, tx: &SyncSender<Response>, counters: &Counters) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            // Lock only for the receive; other workers keep calling meanwhile
            let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
            let Ok(request) = next else {
                return;
            };
            log::debug!("inference request {}: {:?}", request.id, request.prompt);

            match self.dispatch(&request, counters) {
                Outcome::Done(response) => {
                    if tx.send(response).is_err() {
                        log::debug!("response queue closed, worker exiting");
                        return;
                    }
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::GaveUp => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Cancelled => return,
            }
        }
    }

    /// Reserve, call and retry one request until it succeeds, the policy
    /// gives up, or the run is cancelled.
    fn dispatch(&self, request: &Request, counters: &Counters) -> Outcome {
        let estimate = request.byte_estimate();
        let mut attempt = 0u32;
        loop {
            if let Some(limiter) = self.limiter {
                if limiter.reserve(estimate, &self.cancel).is_err() {
                    return Outcome::Cancelled;
                }
            }

            let err = match self.provider.infer(request) {
                Ok(response) => {
                    if let Some(limiter) = self.limiter {
                        // The call already happened; deliver it even if interrupted here
                        if limiter
                            .reconcile(estimate, response.tokens, &self.cancel)
                            .is_err()
                        {
                            log::debug!("request {}: reconcile interrupted", request.id);
                        }
                    }
                    log::debug!(
                        "inference response {}: {} tokens",
                        response.id,
                        response.tokens
                    );
                    return Outcome::Done(response);
                }
                Err(err) => err,
            };

            attempt = attempt.saturating_add(1);
            let Some(delay) = self.retry.next_delay(attempt, &err) else {
                log::error!(
                    "request {}: giving up after {attempt} attempts: {err}",
                    request.id
                );
                return Outcome::GaveUp;
            };
            counters.retries.fetch_add(1, Ordering::Relaxed);
            if attempt == 1 || attempt % WARN_EVERY == 0 {
                log::warn!(
                    "request {}: attempt {attempt} failed, retrying in {delay:?}: {err}",
                    request.id
                );
            } else {
                log::debug!("request {}: attempt {attempt} failed: {err}", request.id);
            }
            if self.cancel.sleep(delay).is_err() {
                return Outcome::Cancelled;
            }
        }
    }
}
