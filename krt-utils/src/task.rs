//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::{task, time};
use tracing::{Instrument, error, warn};

/// An owned background task.
///
/// Going out of scope aborts the task, so every background activity stays
/// tied to the engine handle that spawned it.
#[derive(Debug)]
pub struct Task<T> {
    handle: task::JoinHandle<T>,
}

/// A handle which can be used to manipulate the timeout task created by the
/// [`TimeoutTask::new`] function.
///
/// Dropping this handle cancels the timeout task.
#[derive(Debug)]
pub struct TimeoutTask {
    _task: Task<()>,
    reset_tx: UnboundedSender<Duration>,
}

/// A handle which can be used to manipulate the interval task created by the
/// [`IntervalTask::new`] function.
///
/// Dropping this handle cancels the interval task.
#[derive(Debug)]
pub struct IntervalTask {
    _task: Task<()>,
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Runs the given future in a background task owned by the returned
    /// handle.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            handle: task::spawn(future),
        }
    }

    /// Runs `body` in a background task, respawning it after every panic.
    /// The supervision ends once an attempt runs to completion.
    ///
    /// Meant for receive loops where one poisonous message must not take
    /// the whole engine down with it.
    pub fn spawn_supervised<F, Fut>(body: F) -> Task<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task::spawn(
            async move {
                loop {
                    // Each attempt gets its own handle so aborting the
                    // supervisor also aborts the running attempt.
                    let mut attempt = Task::spawn(body());
                    match (&mut attempt.handle).await {
                        Err(error) if error.is_panic() => {
                            warn!("supervised task panicked, respawning");
                        }
                        _ => break,
                    }
                }
            }
            .in_current_span(),
        )
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a new task that will call the provided async closure when the
    /// specified timeout expires.
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel();

        let task = Task::spawn(
            async move {
                let timeout_fut = time::sleep(timeout);
                tokio::pin!(timeout_fut);

                loop {
                    tokio::select! {
                        // Timeout has expired.
                        _ = &mut timeout_fut => {
                            (cb)().await;
                            break;
                        }
                        // Timeout has been refreshed, or aborted.
                        timeout = reset_rx.recv() => {
                            match timeout {
                                Some(timeout) => {
                                    let next =
                                        time::Instant::now() + timeout;
                                    timeout_fut.as_mut().reset(next);
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        TimeoutTask {
            _task: task,
            reset_tx,
        }
    }

    /// Resets the timeout, regardless if it has already expired or not.
    pub fn reset(&mut self, timeout: Duration) {
        if self.reset_tx.send(timeout).is_err() {
            error!("failed to reset timeout");
        }
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    /// Spawns a new task that will call the provided async closure whenever
    /// the specified interval timer ticks.
    pub fn new<F, Fut>(
        interval: Duration,
        tick_on_start: bool,
        mut cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = Task::spawn(
            async move {
                let mut interval_fut = if tick_on_start {
                    time::interval(interval)
                } else {
                    time::interval_at(
                        time::Instant::now() + interval,
                        interval,
                    )
                };

                loop {
                    interval_fut.tick().await;
                    (cb)().await;
                }
            }
            .in_current_span(),
        );

        IntervalTask { _task: task }
    }
}
