//! Dedicated thread owning the shared namespace.
//!
//! The interpreter cannot leave the thread that created it, and executions
//! must not overlap. Every job runs on one OS thread in arrival order. Async
//! handlers enqueue a job and await its oneshot reply; a slow snippet delays
//! later jobs but not the accept loop.

use std::panic::{self, AssertUnwindSafe};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::LiveChannel;
use crate::engine::{self, Outcome};
use crate::error::EngineError;
use crate::namespace::{Namespace, NamespaceSettings};

/// Native stack of the executor thread. Python recursion must hit the
/// interpreter's recursion limit long before it can exhaust this.
const EXECUTOR_STACK_BYTES: usize = 256 * 1024 * 1024;

/// A job sent to the executor thread
enum Job {
    Run {
        code: String,
        response: oneshot::Sender<Result<Outcome, EngineError>>,
    },
    Attach {
        channel: LiveChannel,
        response: oneshot::Sender<Result<(), EngineError>>,
    },
    Detach {
        id: Uuid,
    },
    #[cfg(test)]
    Panic {
        response: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Handle to the executor thread. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    sender: mpsc::UnboundedSender<Job>,
}

impl Executor {
    /// Start the executor thread and build its namespace there.
    ///
    /// Blocks until the namespace exists; an interpreter that cannot be
    /// created is reported here rather than on the first job.
    pub fn spawn(settings: NamespaceSettings) -> Result<Self, EngineError> {
        Self::spawn_with(move || Namespace::new(&settings))
    }

    fn spawn_with<F>(init: F) -> Result<Self, EngineError>
    where
        F: FnOnce() -> Result<Namespace, EngineError> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        std::thread::Builder::new()
            .name("fujian-executor".to_string())
            .stack_size(EXECUTOR_STACK_BYTES)
            .spawn(move || {
                let mut namespace = match contain_panic("creating the namespace", init) {
                    Ok(namespace) => namespace,
                    Err(e) => {
                        error!(error = %e, "failed to create namespace");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!("executor thread started");

                while let Some(job) = rx.blocking_recv() {
                    match job {
                        Job::Run { code, response } => {
                            let result = contain_panic("running a submission", || {
                                engine::run(&namespace, &code)
                            });
                            if let Err(e) = &result {
                                error!(error = %e, "execution bookkeeping failed");
                            }
                            // Receiver may have gone away (client disconnected)
                            let _ = response.send(result);
                        }
                        Job::Attach { channel, response } => {
                            let id = channel.id();
                            let result = contain_panic("binding a live channel", || {
                                namespace.bind_channel(Some(channel))
                            });
                            if result.is_ok() {
                                info!(%id, "live channel bound");
                            }
                            let _ = response.send(result);
                        }
                        Job::Detach { id } => {
                            match contain_panic("clearing a live channel", || {
                                namespace.release_channel(id)
                            }) {
                                Ok(true) => info!(%id, "live channel cleared"),
                                Ok(false) => {}
                                Err(e) => warn!(%id, error = %e, "failed to clear live channel"),
                            }
                        }
                        #[cfg(test)]
                        Job::Panic { response } => {
                            let _ = response.send(contain_panic("a test job", || panic!("boom")));
                        }
                    }
                }
                info!("executor thread stopped");
            })?;

        ready_rx.recv().map_err(|_| EngineError::ExecutorGone)??;
        Ok(Self { sender: tx })
    }

    /// Execute `code` against the shared namespace.
    pub async fn run(&self, code: String) -> Result<Outcome, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Job::Run { code, response: tx })
            .map_err(|_| EngineError::ExecutorGone)?;
        rx.await.map_err(|_| EngineError::ExecutorGone)?
    }

    /// Make `channel` the namespace's live channel, replacing any previous one.
    pub async fn attach(&self, channel: LiveChannel) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Job::Attach {
                channel,
                response: tx,
            })
            .map_err(|_| EngineError::ExecutorGone)?;
        rx.await.map_err(|_| EngineError::ExecutorGone)?
    }

    /// Clear the live channel if it is still connection `id`. Does not wait.
    pub fn detach(&self, id: Uuid) {
        if self.sender.send(Job::Detach { id }).is_err() {
            warn!(%id, "executor gone, cannot clear live channel");
        }
    }
}

/// Run `job`, turning a panic inside the interpreter into an error so the
/// executor thread keeps serving.
fn contain_panic<T>(
    what: &str,
    job: impl FnOnce() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            error!(what, %reason, "interpreter panicked");
            Err(EngineError::Panicked(format!("{what}: {reason}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executions_share_one_namespace() {
        let executor = Executor::spawn(NamespaceSettings::default()).unwrap();
        executor.run("total = 10".to_string()).await.unwrap();
        let outcome = executor
            .run("total += 5\nfujian_return = total".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.return_value, "15");
    }

    #[tokio::test]
    async fn concurrent_submissions_keep_their_own_output() {
        let executor = Executor::spawn(NamespaceSettings::default()).unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                let outcome = executor
                    .run(format!("for _ in range(50):\n    print({i})\n"))
                    .await
                    .unwrap();
                (i, outcome)
            }));
        }
        for handle in handles {
            let (i, outcome) = handle.await.unwrap();
            assert_eq!(outcome.stdout, format!("{i}\n").repeat(50));
        }
    }

    #[tokio::test]
    async fn attached_channel_receives_pushes_from_any_submission() {
        let executor = Executor::spawn(NamespaceSettings::default()).unwrap();
        let (channel, mut outbox) = LiveChannel::open();
        executor.attach(channel.clone()).await.unwrap();

        let outcome = executor
            .run("FUJIAN_WS.write_message('ping')".to_string())
            .await
            .unwrap();
        assert!(outcome.is_silent());
        assert_eq!(outbox.recv().await.as_deref(), Some("ping"));

        executor.detach(channel.id());
        let outcome = executor
            .run("fujian_return = FUJIAN_WS is None".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.return_value, "True");
    }

    #[tokio::test]
    async fn unbounded_recursion_raises_recursion_error() {
        let executor = Executor::spawn(NamespaceSettings::default()).unwrap();
        let outcome = executor
            .run("print('before')\ndef f():\n    return f()\nf()\n".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "before\n");
        let traceback = outcome.traceback.expect("recursion should fail");
        assert!(traceback.contains("RecursionError"), "got: {traceback}");

        let outcome = executor
            .run("fujian_return = 'still here'".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.return_value, "still here");
    }

    #[test]
    fn failed_namespace_creation_fails_spawn() {
        let result = Executor::spawn_with(|| {
            Err(EngineError::Bookkeeping("no interpreter".to_string()))
        });
        assert!(matches!(result, Err(EngineError::Bookkeeping(_))));
    }

    #[test]
    fn panicking_namespace_creation_fails_spawn() {
        let result = Executor::spawn_with(|| panic!("cannot build interpreter"));
        match result {
            Err(EngineError::Panicked(reason)) => {
                assert!(reason.contains("cannot build interpreter"), "got: {reason}")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should have failed"),
        }
    }

    #[tokio::test]
    async fn executor_survives_a_panicking_job() {
        let executor = Executor::spawn(NamespaceSettings::default()).unwrap();
        executor.run("kept = 'value'".to_string()).await.unwrap();

        let (tx, rx) = oneshot::channel();
        assert!(executor.sender.send(Job::Panic { response: tx }).is_ok());
        assert!(matches!(rx.await.unwrap(), Err(EngineError::Panicked(_))));

        let outcome = executor
            .run("fujian_return = kept".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.return_value, "value");
    }

    #[test]
    fn contain_panic_passes_results_through() {
        assert_eq!(contain_panic("adding", || Ok(1 + 1)).unwrap(), 2);
        let err = contain_panic::<()>("formatting", || panic!("bad {}", "input")).unwrap_err();
        assert_eq!(err.to_string(), "interpreter panicked while formatting: bad input");
    }
}
