//! Process runner for long-lived bridge activities with cooperative shutdown.
//!
//! The runner:
//! - Runs every registered process concurrently, each with a shared cancellation token
//! - Cancels all processes on SIGTERM/SIGINT or when any process fails
//! - Gives cancelled processes a bounded window to drain before aborting them
//! - Runs closers afterwards, regardless of how processes stopped
//!
//! # Example
//!
//! ```no_run
//! use bridge_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_app_process(|ctx| async move {
//!             ctx.cancelled().await;
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Boxed app process: takes the shared cancellation token and runs until it
/// is cancelled or fails.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>
        + Send,
>;

/// Boxed cleanup function executed after all processes stopped.
pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>> + Send>;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Stopped by signal or external cancellation, or every process returned Ok
    Stopped,
    /// A process failed (or panicked) and brought the others down
    Failed(anyhow::Error),
}

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    shutdown_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Creates a runner with a 10 second closer timeout and a 30 second
    /// shutdown (drain) timeout.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Adds an anonymous app process.
    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let name = format!("process_{}", self.app_processes.len());
        self.with_named_process(name, Box::new(|token| Box::pin(process(token))))
    }

    /// Adds an already boxed app process under a name used in logs.
    pub fn with_named_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.app_processes.push((name.into(), process));
        self
    }

    /// Adds a closer. All closers run concurrently after the processes stop,
    /// even if some of them fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Time cancelled processes get to finish draining before being aborted.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs until stopped and exits the process: code 1 if a process failed,
    /// 0 otherwise.
    pub async fn run(self) {
        let token = self.cancellation_token.clone();
        spawn_signal_handlers(token);

        match self.run_until_stopped().await {
            RunOutcome::Failed(err) => {
                tracing::error!("Application exiting with error: {:#}", err);
                std::process::exit(1);
            }
            RunOutcome::Stopped => {
                tracing::info!("Application exiting normally");
                std::process::exit(0);
            }
        }
    }

    /// Runs all processes and closers without installing signal handlers or
    /// exiting.
    pub async fn run_until_stopped(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                tracing::debug!(process = %name, "starting app process");
                (name, process(process_token).await)
            });
        }

        let mut first_error = None;
        loop {
            let joined = tokio::select! {
                _ = token.cancelled() => break,
                joined = join_set.join_next() => match joined {
                    Some(joined) => joined,
                    None => break,
                },
            };

            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(process = %name, "app process completed");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = %name, "app process error: {:#}", err);
                    first_error = Some(err.context(format!("process {} failed", name)));
                    token.cancel();
                }
                Err(err) => {
                    tracing::error!("app process panicked: {}", err);
                    first_error = Some(anyhow::anyhow!("app process panicked: {}", err));
                    token.cancel();
                }
            }
        }

        // Let cancelled processes drain, then abort stragglers
        let shutdown_timeout = self.shutdown_timeout;
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => tracing::debug!(process = %name, "app process stopped"),
                    Ok((name, Err(err))) => {
                        tracing::warn!(process = %name, "app process error during shutdown: {:#}", err)
                    }
                    Err(err) => tracing::error!("app process panicked during shutdown: {}", err),
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::error!(
                "app processes did not stop within {:?}, aborting",
                shutdown_timeout
            );
            join_set.shutdown().await;
        }

        if !self.closers.is_empty() {
            tracing::info!("Running closers with timeout of {:?}", self.closer_timeout);
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => tracing::info!("All closers completed"),
                Err(_) => tracing::error!("Closers timed out after {:?}", self.closer_timeout),
            }
        }

        match first_error {
            Some(err) => RunOutcome::Failed(err),
            None => RunOutcome::Stopped,
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => tracing::error!("Error setting up signal handler: {}", err),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
                token.cancel();
            }
            Err(err) => tracing::error!("Error setting up SIGTERM handler: {}", err),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => tracing::debug!("Closer completed successfully"),
            Ok(Err(err)) => tracing::error!("Closer error: {:#}", err),
            Err(err) => tracing::error!("Closer panicked: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_external_cancellation_stops_processes_and_runs_closers() {
        let closer_called = Arc::new(AtomicBool::new(false));
        let flag = closer_called.clone();
        let token = CancellationToken::new();
        let canceller = token.clone();

        let runner = Runner::new()
            .with_app_process(|ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_closer(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = runner.run_until_stopped().await;
        assert!(matches!(outcome, RunOutcome::Stopped));
        assert!(closer_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_process_cancels_the_others() {
        let drained = Arc::new(AtomicBool::new(false));
        let drained_flag = drained.clone();

        let runner = Runner::new()
            .with_app_process(|_ctx| async move { Err(anyhow::anyhow!("broker unreachable")) })
            .with_app_process(move |ctx| async move {
                ctx.cancelled().await;
                drained_flag.store(true, Ordering::SeqCst);
                Ok(())
            });

        let outcome = runner.run_until_stopped().await;
        match outcome {
            RunOutcome::Failed(err) => assert!(format!("{:#}", err).contains("broker unreachable")),
            RunOutcome::Stopped => panic!("expected failure"),
        }
        assert!(drained.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_process_is_aborted_after_shutdown_timeout() {
        let token = CancellationToken::new();
        token.cancel();

        let runner = Runner::new()
            .with_app_process(|_ctx| async move {
                // Ignores cancellation entirely
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .with_cancellation_token(token)
            .with_shutdown_timeout(Duration::from_secs(1));

        let outcome = tokio::time::timeout(Duration::from_secs(10), runner.run_until_stopped())
            .await
            .expect("runner should abort stuck processes");
        assert!(matches!(outcome, RunOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_all_closers_run_even_if_one_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        let c2 = counter.clone();

        let outcome = Runner::new()
            .with_closer(move || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("close failed"))
            })
            .with_closer(move || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .run_until_stopped()
            .await;

        assert!(matches!(outcome, RunOutcome::Stopped));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
