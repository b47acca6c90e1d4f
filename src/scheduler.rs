use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};

use anyhow::{Result, ensure};
use futures_util::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{select, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::channel::{Attempt, ChannelDescriptor, ExtractionOutcome, FailureReason};

/// Number of retry passes after the initial pass
pub const RETRY_PASSES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub initial_concurrency: usize,
    pub retry_concurrency: usize,
}

impl SchedulePolicy {
    /// Retry concurrency is capped at the initial concurrency
    ///
    /// # Errors
    /// Errors when either limit is zero
    pub fn new(initial_concurrency: usize, retry_concurrency: usize) -> Result<Self> {
        ensure!(initial_concurrency > 0, "Concurrency must be at least 1");
        ensure!(retry_concurrency > 0, "Retry concurrency must be at least 1");

        if retry_concurrency > initial_concurrency {
            warn!(
                "Retry concurrency {retry_concurrency} is above the initial concurrency, using {initial_concurrency}"
            );
        }
        Ok(Self {
            initial_concurrency,
            retry_concurrency: retry_concurrency.min(initial_concurrency),
        })
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// One final outcome per channel, in completion order
    pub outcomes: Vec<ExtractionOutcome>,
    pub initial_failures: usize,
    pub retried: usize,
    pub final_failures: usize,
}

impl RunReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.len() - self.final_failures
    }
}

/// Fans channels out over bounded workers, then retries the failures once
///
/// `attempt` does the actual work for one channel; the scheduler only deals
/// with concurrency, progress and bookkeeping.
pub struct Scheduler {
    policy: SchedulePolicy,
    ct: CancellationToken,
    progress: bool,
}

impl Scheduler {
    #[must_use]
    pub const fn new(policy: SchedulePolicy, ct: CancellationToken) -> Self {
        Self {
            policy,
            ct,
            progress: false,
        }
    }

    /// Draws a progress bar for each pass
    #[must_use]
    pub const fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    #[instrument(skip_all, fields(channels = channels.len()))]
    pub async fn run<F, Fut>(&self, channels: Vec<ChannelDescriptor>, attempt: F) -> RunReport
    where
        F: Fn(ChannelDescriptor, Attempt) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ExtractionOutcome> + Send + 'static,
    {
        let mut outcomes = self
            .run_pass(
                channels,
                Attempt::Initial,
                self.policy.initial_concurrency,
                attempt.clone(),
            )
            .await;

        let initial_failures = outcomes.iter().filter(|o| !o.is_success()).count();
        let mut retried = 0;

        for _ in 0..RETRY_PASSES {
            let failed = outcomes
                .iter()
                .filter_map(ExtractionOutcome::retry_descriptor)
                .cloned()
                .collect::<Vec<_>>();
            if failed.is_empty() {
                break;
            }
            if self.ct.is_cancelled() {
                warn!("Cancelled, skipping retry of {} channel(s)", failed.len());
                break;
            }

            info!("Retrying {} failed channel(s)", failed.len());
            retried += failed.len();
            let retry_outcomes = self
                .run_pass(
                    failed,
                    Attempt::Retry,
                    self.policy.retry_concurrency,
                    attempt.clone(),
                )
                .await;
            merge_by_id(&mut outcomes, retry_outcomes);
        }

        let final_failures = outcomes.iter().filter(|o| !o.is_success()).count();
        RunReport {
            outcomes,
            initial_failures,
            retried,
            final_failures,
        }
    }

    async fn run_pass<F, Fut>(
        &self,
        channels: Vec<ChannelDescriptor>,
        kind: Attempt,
        concurrency: usize,
        attempt: F,
    ) -> Vec<ExtractionOutcome>
    where
        F: Fn(ChannelDescriptor, Attempt) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ExtractionOutcome> + Send + 'static,
    {
        let pb = self.progress_bar(channels.len() as u64, kind);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();

        for channel in channels {
            let ct = self.ct.clone();
            let slots = Arc::clone(&slots);
            let attempt = attempt.clone();

            workers.spawn(async move {
                let _slot = select! {
                    biased;
                    () = ct.cancelled() => {
                        return ExtractionOutcome::failed(channel, kind, FailureReason::Cancelled);
                    }
                    slot = slots.acquire_owned() => slot,
                };

                let fallback = channel.clone();
                match AssertUnwindSafe(attempt(channel, kind)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let detail = panic_message(panic.as_ref());
                        error!("{}: attempt panicked: {detail}", fallback.name);
                        ExtractionOutcome::failed(fallback, kind, FailureReason::Unexpected(detail))
                    }
                }
            });
        }

        let mut outcomes = Vec::with_capacity(workers.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // Only reachable if the runtime is shutting down under us
                Err(e) => error!("Extraction worker aborted: {e}"),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        outcomes
    }

    fn progress_bar(&self, len: u64, kind: Attempt) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) =
            ProgressStyle::with_template("[{elapsed_precise}] {msg} [{wide_bar:.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("{kind} pass"));
        pb
    }
}

/// Replaces outcomes in `outcomes` with the retry outcome of the same id
fn merge_by_id(outcomes: &mut [ExtractionOutcome], retries: Vec<ExtractionOutcome>) {
    let index = outcomes
        .iter()
        .enumerate()
        .map(|(i, o)| (o.id.clone(), i))
        .collect::<HashMap<_, _>>();

    for retry in retries {
        match index.get(&retry.id) {
            Some(&i) => outcomes[i] = retry,
            None => warn!("Retry outcome for unknown channel `{}`", retry.id),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
