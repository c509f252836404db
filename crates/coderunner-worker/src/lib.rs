//! The worker pool (spec component C5): a bounded-concurrency consumer that drives each job
//! through prepare -> invoke -> classify -> cleanup/retain (spec.md §4.4), and the outcome
//! classification table of §4.5.

use coderunner_catalog::{Catalog, CommandBinding, LanguageDescriptor};
use coderunner_queue::{Job, JobQueue};
use coderunner_sandbox::{DriverError, SandboxDriver, SandboxLimits, SandboxOutcome};
use coderunner_util::Concurrency;
use coderunner_workspace::{ArtifactSet, Workspace};
use slog::{debug, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// One job's terminal classification, per spec.md §4.5's table.
#[derive(Debug, Eq, PartialEq)]
enum Outcome {
    Success(String),
    Failure(String),
}

fn classify(descriptor: &LanguageDescriptor, outcome: &SandboxOutcome) -> Outcome {
    let stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();

    if outcome.exit_ok {
        if stderr.is_empty() || !descriptor.treat_stderr_as_failure {
            Outcome::Success(stdout)
        } else {
            Outcome::Failure(format!("Execution potentially failed. Stderr:\n{stderr}"))
        }
    } else {
        let mut reason = "Process exited with a non-zero status".to_string();
        if !stderr.is_empty() {
            reason.push_str(": ");
            reason.push_str(&stderr);
        }
        Outcome::Failure(reason)
    }
}

/// Binds the artifact paths `prepare` produced to the three placeholders a command template
/// may reference (spec.md §4.4 step 3).
fn command_binding(descriptor: &LanguageDescriptor, artifacts: &ArtifactSet) -> CommandBinding {
    let file = artifacts
        .source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output = artifacts
        .extra_paths
        .first()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let classname = if descriptor.tag == "java" {
        artifacts
            .source_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        String::new()
    };
    CommandBinding { file, output, classname }
}

/// The bounded-concurrency job consumer.
#[derive(Clone)]
pub struct WorkerPool {
    catalog: Arc<Catalog>,
    workspace: Arc<Workspace>,
    sandbox: Arc<SandboxDriver>,
    queue: JobQueue,
    limits: SandboxLimits,
    concurrency: Concurrency,
    log: Logger,
}

impl WorkerPool {
    pub fn new(
        catalog: Arc<Catalog>,
        workspace: Arc<Workspace>,
        sandbox: Arc<SandboxDriver>,
        queue: JobQueue,
        limits: SandboxLimits,
        concurrency: Concurrency,
        log: Logger,
    ) -> Self {
        Self {
            catalog,
            workspace,
            sandbox,
            queue,
            limits,
            concurrency,
            log,
        }
    }

    /// Runs the pool until `shutdown` is signalled. Holds at most `concurrency` jobs in flight
    /// at once (spec.md §4.4); on shutdown, stops accepting new deliveries and waits for
    /// in-flight jobs to finish (spec.md §4.7, §5's cooperative cancellation).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency.0));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore is never closed"),
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    drop(permit);
                    break;
                }
                dequeued = self.queue.dequeue(Duration::from_secs(1), &self.log) => {
                    match dequeued {
                        Ok(Some(job)) => {
                            let pool = self.clone();
                            in_flight.spawn(async move {
                                pool.process(job).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => drop(permit),
                        Err(err) => {
                            warn!(self.log, "dequeue failed, backing off"; "error" => %err);
                            drop(permit);
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }

        debug!(self.log, "worker pool draining in-flight jobs"; "count" => in_flight.len());
        while in_flight.join_next().await.is_some() {}
    }

    /// Periodically reclaims jobs abandoned by a dead worker (spec.md §4.4's `stalled` state).
    pub async fn run_stalled_monitor(
        &self,
        lease_ttl: Duration,
        redeliver_stalled: bool,
        scan_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(scan_interval) => {
                    match self.queue.scan_stalled(lease_ttl, redeliver_stalled).await {
                        Ok(0) => {}
                        Ok(n) => warn!(self.log, "found stalled jobs"; "count" => n, "redelivered" => redeliver_stalled),
                        Err(err) => warn!(self.log, "stalled scan failed"; "error" => %err),
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    async fn process(&self, job: Job) {
        let id = job.id;
        let descriptor = match self.catalog.resolve(&job.language) {
            Ok(descriptor) => descriptor.clone(),
            Err(_) => {
                // Should not occur; the API validates language against the catalog at submit
                // time (spec.md §4.4 step 1).
                self.fail(id, "Unknown language".to_string()).await;
                return;
            }
        };

        let artifacts = match self.workspace.prepare(&descriptor, &job.code, id, &self.log) {
            Ok(artifacts) => artifacts,
            Err(err) => {
                self.fail(id, format!("Workspace error: {err}")).await;
                return;
            }
        };

        let binding = command_binding(&descriptor, &artifacts);
        let command = descriptor.expand_command(&binding);
        let volume = artifacts.job_dir.to_string_lossy().into_owned();

        debug!(self.log, "invoking sandbox"; "job_id" => %id, "language" => &job.language);
        match self
            .sandbox
            .run(descriptor.image, &command, &volume, &self.limits, &self.log)
            .await
        {
            Ok(outcome) => match classify(&descriptor, &outcome) {
                Outcome::Success(stdout) => {
                    // §4.5: a success with non-empty stderr still discards it from the result,
                    // but it's logged rather than silently dropped.
                    if !outcome.stderr.is_empty() {
                        debug!(self.log, "discarding stderr on successful job";
                            "job_id" => %id, "stderr" => %String::from_utf8_lossy(&outcome.stderr));
                    }
                    self.workspace.cleanup(&artifacts, &self.log);
                    self.complete(id, stdout).await;
                }
                Outcome::Failure(reason) => {
                    // Artifacts of a failed job are retained for operator post-mortem
                    // (spec.md §4.4 step 7, §7's propagation policy).
                    self.fail(id, reason).await;
                }
            },
            Err(DriverError::Timeout { seconds }) => {
                self.fail(id, format!("Timeout after {seconds} seconds")).await;
            }
            Err(err) => {
                self.fail(id, format!("Sandbox runtime error: {err}")).await;
            }
        }
    }

    async fn complete(&self, id: coderunner_util::JobId, stdout: String) {
        if let Err(err) = self.queue.resolve_completed(id, &stdout).await {
            warn!(self.log, "failed to publish completed result"; "job_id" => %id, "error" => %err);
        }
    }

    async fn fail(&self, id: coderunner_util::JobId, reason: String) {
        warn!(self.log, "job failed"; "job_id" => %id, "reason" => &reason);
        if let Err(err) = self.queue.resolve_failed(id, &reason).await {
            warn!(self.log, "failed to publish failure result"; "job_id" => %id, "error" => %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_catalog::Catalog;

    fn outcome(exit_ok: bool, stdout: &str, stderr: &str) -> SandboxOutcome {
        SandboxOutcome {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_ok,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    #[test]
    fn success_with_empty_stderr_is_always_success() {
        let catalog = Catalog::with_defaults();
        let python = catalog.resolve("python").unwrap();
        let result = classify(python, &outcome(true, "hi\n", ""));
        assert_eq!(result, Outcome::Success("hi\n".to_string()));
    }

    #[test]
    fn interpreted_language_succeeds_despite_stderr() {
        let catalog = Catalog::with_defaults();
        let python = catalog.resolve("python").unwrap();
        let result = classify(python, &outcome(true, "hi\n", "warning: deprecated\n"));
        assert_eq!(result, Outcome::Success("hi\n".to_string()));
    }

    #[test]
    fn compiled_language_fails_on_stderr_even_with_exit_ok() {
        let catalog = Catalog::with_defaults();
        let c = catalog.resolve("c").unwrap();
        let result = classify(c, &outcome(true, "", "warning: unused variable\n"));
        assert_eq!(
            result,
            Outcome::Failure("Execution potentially failed. Stderr:\nwarning: unused variable\n".to_string())
        );
    }

    #[test]
    fn nonzero_exit_is_always_a_failure() {
        let catalog = Catalog::with_defaults();
        let node = catalog.resolve("node").unwrap();
        let result = classify(node, &outcome(false, "", "ReferenceError: x is not defined\n"));
        assert_eq!(
            result,
            Outcome::Failure(
                "Process exited with a non-zero status: ReferenceError: x is not defined\n".to_string()
            )
        );
    }

    #[test]
    fn command_binding_derives_classname_from_source_file_stem() {
        let catalog = Catalog::with_defaults();
        let java = catalog.resolve("java").unwrap();
        let artifacts = ArtifactSet {
            job_dir: "/workspace/abc".into(),
            source_path: "/workspace/abc/Greeter.java".into(),
            extra_paths: vec!["/workspace/abc/Greeter.class".into()],
        };
        let binding = command_binding(java, &artifacts);
        assert_eq!(binding.file, "Greeter.java");
        assert_eq!(binding.classname, "Greeter");
    }
}
