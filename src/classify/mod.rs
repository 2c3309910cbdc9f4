//! Classification of mutants against the project's existing test suite.
//!
//! Every pending mutant is executed in its own sandbox copy with the mutated
//! file overlaid, and the suite's verdict decides its fate: a failing suite
//! kills the mutant, a green suite means it survived and is a coverage gap.

use crate::error::EngineError;
use crate::mutants::{Mutant, MutantStatus};
use crate::sandbox::{ExecutionOutcome, FileOverlay, Sandbox, SandboxRequest};
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;

/// Exit code emitted by pytest/unittest when tests fail. Anything else
/// nonzero is treated as a broken run rather than a kill.
const TEST_FAILURE_CODE: i32 = 1;

struct ClassifyTask {
    mutant_id: String,
    request: SandboxRequest,
}

/// Map a suite run against a mutated tree to a mutant verdict.
pub fn outcome_status(outcome: &ExecutionOutcome) -> MutantStatus {
    if outcome.limit_exceeded {
        MutantStatus::TimedOut
    } else if outcome.exit_code == 0 {
        MutantStatus::Survived
    } else if outcome.exit_code == TEST_FAILURE_CODE {
        MutantStatus::Killed
    } else {
        MutantStatus::Errored
    }
}

/// Run the unmodified suite once before any mutation.
///
/// A red or unlaunchable baseline means every mutant verdict would be
/// meaningless, so this is the one session-fatal gate.
pub async fn verify_baseline(
    sandbox: &Sandbox,
    project_root: &Path,
    test_command: &str,
    time_limit: Duration,
) -> Result<ExecutionOutcome, EngineError> {
    let outcome = sandbox
        .run(SandboxRequest {
            command: test_command.to_string(),
            working_tree: project_root.to_path_buf(),
            overlays: vec![],
            time_limit,
        })
        .await;

    if outcome.launch_failed() {
        return Err(EngineError::SandboxLaunch(format!(
            "baseline suite could not be launched: {}",
            outcome.stderr.trim()
        )));
    }
    if outcome.limit_exceeded {
        return Err(EngineError::SandboxLaunch(
            "baseline suite exceeded the execution time limit".to_string(),
        ));
    }
    if outcome.exit_code != 0 {
        return Err(EngineError::SandboxLaunch(format!(
            "baseline suite is failing (exit {}); fix the suite before generating tests",
            outcome.exit_code
        )));
    }

    Ok(outcome)
}

/// Classify every pending mutant against the existing suite.
///
/// Runs up to `max_concurrent` sandboxes in parallel. Mutants not dispatched
/// before `deadline` keep their `Pending` status. The returned vector
/// preserves the input order.
pub async fn classify_all(
    sandbox: &Sandbox,
    mutants: Vec<Mutant>,
    project_root: &Path,
    test_command: &str,
    time_limit: Duration,
    max_concurrent: usize,
    deadline: Instant,
) -> Vec<Mutant> {
    let (task_tx, task_rx) = mpsc::channel::<ClassifyTask>(100);
    let (result_tx, mut result_rx) = mpsc::channel::<(String, MutantStatus)>(100);
    let task_rx = Arc::new(TokioMutex::new(task_rx));

    let mut worker_handles = Vec::new();
    for _ in 0..max_concurrent.max(1) {
        let worker_rx = Arc::clone(&task_rx);
        let worker_tx = result_tx.clone();
        let sandbox = sandbox.clone();

        let handle = tokio::spawn(async move {
            classify_worker(sandbox, worker_rx, worker_tx).await;
        });
        worker_handles.push(handle);
    }
    drop(result_tx);

    // Original file contents, read once per file
    let mut file_cache: HashMap<PathBuf, Option<String>> = HashMap::new();
    let mut statuses: HashMap<String, MutantStatus> = HashMap::new();
    let mut dispatched = 0usize;

    for mutant in &mutants {
        if mutant.status != MutantStatus::Pending {
            continue;
        }
        if Instant::now() >= deadline {
            tracing::warn!("session budget exhausted during classification");
            break;
        }

        let content = file_cache.entry(mutant.file.clone()).or_insert_with(|| {
            std::fs::read_to_string(project_root.join(&mutant.file)).ok()
        });
        let content = match content {
            Some(c) => c.clone(),
            None => {
                tracing::warn!("cannot read {} for mutant {}", mutant.file.display(), mutant.short_id());
                statuses.insert(mutant.id.clone(), MutantStatus::Errored);
                continue;
            }
        };

        let task = ClassifyTask {
            mutant_id: mutant.id.clone(),
            request: SandboxRequest {
                command: test_command.to_string(),
                working_tree: project_root.to_path_buf(),
                overlays: vec![FileOverlay {
                    path: mutant.file.clone(),
                    contents: mutant.apply_to(&content),
                }],
                time_limit,
            },
        };
        if task_tx.send(task).await.is_err() {
            break;
        }
        dispatched += 1;
    }
    drop(task_tx);

    while let Some((mutant_id, status)) = result_rx.recv().await {
        statuses.insert(mutant_id, status);
    }
    for handle in worker_handles {
        let _ = handle.await;
    }

    tracing::info!("classified {} mutants against the existing suite", dispatched);

    mutants
        .into_iter()
        .map(|mut m| {
            if let Some(status) = statuses.get(&m.id) {
                m.status = *status;
            }
            m
        })
        .collect()
}

async fn classify_worker(
    sandbox: Sandbox,
    receiver: Arc<TokioMutex<mpsc::Receiver<ClassifyTask>>>,
    results: mpsc::Sender<(String, MutantStatus)>,
) {
    loop {
        let task = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        let task = match task {
            Some(t) => t,
            None => break,
        };

        let outcome = sandbox.run(task.request).await;
        let status = outcome_status(&outcome);
        tracing::debug!(
            "mutant {} classified as {} (exit {}, {:?})",
            &task.mutant_id[..12.min(task.mutant_id.len())],
            status,
            outcome.exit_code,
            outcome.duration
        );

        if results.send((task.mutant_id, status)).await.is_err() {
            break;
        }
    }
}
