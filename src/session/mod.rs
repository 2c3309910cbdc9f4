//! Session orchestration: scan, mutate, classify, generate, verify, report.
//!
//! A session owns the whole pipeline for one project. The user's tree is
//! never modified except for one merged test file written at the end, and
//! only when at least one candidate was accepted. Budget exhaustion is not
//! an error: in-flight work is cancelled and whatever was learned is still
//! reported.

use crate::classify;
use crate::config::Config;
use crate::context;
use crate::error::EngineError;
use crate::mutants::{self, Mutant, MutantStatus};
use crate::sandbox::Sandbox;
use crate::source::{self, SourceUnit};
use crate::synth::{Candidate, ModelClient, Synthesizer, Verdict};
use crate::verify::Verifier;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;

/// File the accepted candidates are merged into, inside the test directory.
pub const MERGED_TEST_FILE: &str = "test_forge_generated.py";

/// Pipeline phase, reported through progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Classifying,
    Generating,
    Reporting,
    Done,
    Aborted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Classifying => "classifying",
            SessionState::Generating => "generating",
            SessionState::Reporting => "reporting",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Progress notifications for a running session.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StateChanged(SessionState),
    ClassificationFinished { killed: usize, survived: usize },
    MutantResolved { mutant_id: String, candidate_id: String },
    MutantUnresolved { mutant_id: String },
}

/// Per-mutant entry in the final report.
#[derive(Debug, Clone, Serialize)]
pub struct MutantReport {
    pub id: String,
    pub unit_id: String,
    pub operator: String,
    pub line: usize,
    pub description: String,
    pub status: MutantStatus,
    /// True when an accepted candidate kills this mutant
    pub resolved: bool,
}

/// Final session report. This is the tool's output contract: producing it
/// means the session ran, whatever the per-mutant outcomes were.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub elapsed_ms: u64,
    /// `Done`, or `Aborted` when the budget truncated the run. Either way a
    /// report was produced, so the exit code stays zero.
    pub final_state: SessionState,
    pub budget_exhausted: bool,
    pub mutants_total: usize,
    pub killed: usize,
    pub survived: usize,
    pub timed_out: usize,
    pub errored: usize,
    pub pending: usize,
    /// Survivors taken through generation
    pub targeted: usize,
    /// Survivors now covered by an accepted test
    pub resolved: usize,
    pub mutants: Vec<MutantReport>,
    pub accepted: Vec<Candidate>,
    pub rejected: Vec<Candidate>,
    pub warnings: Vec<String>,
    /// Written only when at least one candidate was accepted
    pub merged_test_file: Option<PathBuf>,
}

struct GenerationOutcome {
    mutant_id: String,
    accepted: Option<Candidate>,
    rejected: Vec<Candidate>,
    warnings: Vec<String>,
}

/// Shared read-only state for generation workers.
struct GenerationShared {
    synthesizer: Synthesizer,
    verifier: Verifier,
    source_units: Vec<SourceUnit>,
    test_units: Vec<SourceUnit>,
    max_related: usize,
    max_context_bytes: usize,
    max_attempts: u32,
    deadline: Instant,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

pub struct Session {
    project_root: PathBuf,
    /// Source directory, relative to the project root
    source_dir: PathBuf,
    /// Test directory, relative to the project root
    test_dir: PathBuf,
    config: Config,
    model: Arc<ModelClient>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    state: SessionState,
}

impl Session {
    pub fn new(
        project_root: &Path,
        source_dir: &Path,
        test_dir: &Path,
        config: Config,
        model: ModelClient,
    ) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
            test_dir: test_dir.to_path_buf(),
            config,
            model: Arc::new(model),
            progress: None,
            state: SessionState::Idle,
        }
    }

    /// Subscribe to progress events.
    pub fn progress_events(&mut self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress = Some(tx);
        rx
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        tracing::info!("session state: {}", state);
        self.emit(ProgressEvent::StateChanged(state));
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    /// Run the full pipeline and produce the session report.
    ///
    /// The only fatal failures are an unusable execution environment and a
    /// red baseline; everything else lands in the report.
    pub async fn run(mut self) -> Result<SessionReport> {
        let started = Instant::now();
        let deadline = started + self.config.budget.session_limit();
        let mut warnings: Vec<String> = Vec::new();

        let source_scan = source::scan(&self.project_root, &self.source_dir, false)
            .context("Failed to scan source directory")?;
        warnings.extend(source_scan.warnings);

        let test_units = if self.project_root.join(&self.test_dir).is_dir() {
            let scan = source::scan(&self.project_root, &self.test_dir, true)?;
            warnings.extend(scan.warnings);
            scan.units
        } else {
            warnings.push(format!(
                "test directory {} does not exist; generating without existing tests",
                self.test_dir.display()
            ));
            Vec::new()
        };

        let operators = mutants::builtin_operators();
        let all_mutants = mutants::generate(&source_scan.units, &operators);
        tracing::info!(
            "scanned {} units, generated {} mutants",
            source_scan.units.len(),
            all_mutants.len()
        );

        if all_mutants.is_empty() {
            warnings.push("no mutable units found; nothing to do".to_string());
            self.set_state(SessionState::Done);
            return Ok(self.build_report(
                started,
                SessionState::Done,
                false,
                Vec::new(),
                0,
                Vec::new(),
                Vec::new(),
                warnings,
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sandbox = Sandbox::new(self.config.run.max_output_bytes, cancel_rx);

        // Budget watchdog: cancels every in-flight sandbox at the deadline.
        let watchdog = tokio::spawn({
            let deadline = tokio::time::Instant::from_std(deadline);
            async move {
                tokio::time::sleep_until(deadline).await;
                let _ = cancel_tx.send(true);
            }
        });

        // The suite must be green before any verdict means anything.
        let result = self
            .run_pipeline(started, deadline, sandbox, source_scan.units, test_units, all_mutants, warnings)
            .await;
        watchdog.abort();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &mut self,
        started: Instant,
        deadline: Instant,
        sandbox: Sandbox,
        source_units: Vec<SourceUnit>,
        test_units: Vec<SourceUnit>,
        all_mutants: Vec<Mutant>,
        mut warnings: Vec<String>,
    ) -> Result<SessionReport> {
        if Instant::now() >= deadline {
            warnings.push("session budget exhausted before classification".to_string());
            self.set_state(SessionState::Aborted);
            return Ok(self.build_report(
                started,
                SessionState::Aborted,
                true,
                all_mutants,
                0,
                Vec::new(),
                Vec::new(),
                warnings,
            ));
        }

        match classify::verify_baseline(
            &sandbox,
            &self.project_root,
            &self.config.run.test_command,
            self.config.run.timeout(),
        )
        .await
        {
            Ok(_) => {}
            Err(e @ EngineError::SandboxLaunch(_)) => {
                self.set_state(SessionState::Aborted);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        self.set_state(SessionState::Classifying);
        let classified = classify::classify_all(
            &sandbox,
            all_mutants,
            &self.project_root,
            &self.config.run.test_command,
            self.config.run.timeout(),
            self.config.budget.max_concurrent,
            tokio::time::Instant::from_std(deadline),
        )
        .await;

        let killed = count(&classified, MutantStatus::Killed);
        let survived_count = count(&classified, MutantStatus::Survived);
        self.emit(ProgressEvent::ClassificationFinished {
            killed,
            survived: survived_count,
        });

        let targeted: Vec<Mutant> = classified
            .iter()
            .filter(|m| m.status == MutantStatus::Survived)
            .take(self.config.budget.max_mutants)
            .cloned()
            .collect();
        if survived_count > targeted.len() {
            warnings.push(format!(
                "{} survivors exceed the per-session cap; targeting the first {}",
                survived_count,
                targeted.len()
            ));
        }

        self.set_state(SessionState::Generating);
        let (accepted, rejected, gen_warnings) = self
            .generate_for_survivors(&sandbox, &targeted, source_units, test_units, deadline)
            .await;
        warnings.extend(gen_warnings);

        self.set_state(SessionState::Reporting);
        let budget_exhausted = Instant::now() >= deadline
            || classified.iter().any(|m| m.status == MutantStatus::Pending);

        let merged = if accepted.is_empty() {
            None
        } else {
            Some(self.write_merged_tests(&accepted)?)
        };

        // Budget truncation aborts the session, but the partial report is
        // still the product.
        let final_state = if budget_exhausted {
            SessionState::Aborted
        } else {
            SessionState::Done
        };
        self.set_state(final_state);
        let mut report = self.build_report(
            started,
            final_state,
            budget_exhausted,
            classified,
            targeted.len(),
            accepted,
            rejected,
            warnings,
        );
        report.merged_test_file = merged;
        Ok(report)
    }

    async fn generate_for_survivors(
        &self,
        sandbox: &Sandbox,
        targeted: &[Mutant],
        source_units: Vec<SourceUnit>,
        test_units: Vec<SourceUnit>,
        deadline: Instant,
    ) -> (Vec<Candidate>, Vec<Candidate>, Vec<String>) {
        if targeted.is_empty() {
            return (Vec::new(), Vec::new(), Vec::new());
        }

        let shared = Arc::new(GenerationShared {
            synthesizer: Synthesizer::new_shared(Arc::clone(&self.model)),
            verifier: Verifier::new(
                sandbox.clone(),
                &self.project_root,
                &self.test_dir,
                &self.config.run.test_command,
                self.config.run.timeout(),
            ),
            source_units,
            test_units,
            max_related: self.config.run.max_related,
            max_context_bytes: self.config.run.max_context_bytes,
            max_attempts: self.config.budget.max_attempts_per_mutant,
            deadline,
            progress: self.progress.clone(),
        });

        let (task_tx, task_rx) = mpsc::channel::<Mutant>(100);
        let (result_tx, mut result_rx) = mpsc::channel::<GenerationOutcome>(100);
        let task_rx = Arc::new(TokioMutex::new(task_rx));

        let mut worker_handles = Vec::new();
        for _ in 0..self.config.budget.max_concurrent.max(1) {
            let worker_rx = Arc::clone(&task_rx);
            let worker_tx = result_tx.clone();
            let shared = Arc::clone(&shared);
            worker_handles.push(tokio::spawn(async move {
                generation_worker(shared, worker_rx, worker_tx).await;
            }));
        }
        drop(result_tx);

        for mutant in targeted {
            if Instant::now() >= deadline {
                tracing::warn!("session budget exhausted during generation");
                break;
            }
            if task_tx.send(mutant.clone()).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let mut outcomes: HashMap<String, GenerationOutcome> = HashMap::new();
        while let Some(outcome) = result_rx.recv().await {
            outcomes.insert(outcome.mutant_id.clone(), outcome);
        }
        for handle in worker_handles {
            let _ = handle.await;
        }

        // Deterministic output order follows the targeted mutant order.
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut warnings = Vec::new();
        for mutant in targeted {
            if let Some(outcome) = outcomes.remove(&mutant.id) {
                accepted.extend(outcome.accepted);
                rejected.extend(outcome.rejected);
                warnings.extend(outcome.warnings);
            }
        }
        (accepted, rejected, warnings)
    }

    /// Merge accepted candidates into one test file in the real test tree.
    /// This is the session's only write outside its sandboxes.
    fn write_merged_tests(&self, accepted: &[Candidate]) -> Result<PathBuf> {
        let relative = self.test_dir.join(MERGED_TEST_FILE);
        let target = self.project_root.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut merged = String::from(
            "# Generated tests: each section kills one previously surviving mutant.\n",
        );
        for candidate in accepted {
            merged.push_str(&format!("\n\n# --- candidate {} ---\n", candidate.id));
            merged.push_str(candidate.source.trim_end());
            merged.push('\n');
        }

        std::fs::write(&target, merged)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        tracing::info!("merged {} accepted tests into {}", accepted.len(), target.display());
        Ok(relative)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        started: Instant,
        final_state: SessionState,
        budget_exhausted: bool,
        classified: Vec<Mutant>,
        targeted: usize,
        accepted: Vec<Candidate>,
        rejected: Vec<Candidate>,
        warnings: Vec<String>,
    ) -> SessionReport {
        let resolved_ids: std::collections::HashSet<&str> =
            accepted.iter().map(|c| c.mutant_id.as_str()).collect();

        let mutant_reports: Vec<MutantReport> = classified
            .iter()
            .map(|m| MutantReport {
                id: m.id.clone(),
                unit_id: m.unit_id.clone(),
                operator: m.operator.clone(),
                line: m.line,
                description: m.description.clone(),
                status: m.status,
                resolved: resolved_ids.contains(m.id.as_str()),
            })
            .collect();

        SessionReport {
            completed_at: chrono::Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            final_state,
            budget_exhausted,
            mutants_total: classified.len(),
            killed: count(&classified, MutantStatus::Killed),
            survived: count(&classified, MutantStatus::Survived),
            timed_out: count(&classified, MutantStatus::TimedOut),
            errored: count(&classified, MutantStatus::Errored),
            pending: count(&classified, MutantStatus::Pending),
            targeted,
            resolved: mutant_reports.iter().filter(|m| m.resolved).count(),
            mutants: mutant_reports,
            accepted,
            rejected,
            warnings,
            merged_test_file: None,
        }
    }
}

fn count(mutants: &[Mutant], status: MutantStatus) -> usize {
    mutants.iter().filter(|m| m.status == status).count()
}

async fn generation_worker(
    shared: Arc<GenerationShared>,
    receiver: Arc<TokioMutex<mpsc::Receiver<Mutant>>>,
    results: mpsc::Sender<GenerationOutcome>,
) {
    loop {
        let mutant = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let mutant = match mutant {
            Some(m) => m,
            None => break,
        };

        let outcome = generate_for_mutant(&shared, &mutant).await;
        if let Some(tx) = &shared.progress {
            let event = match &outcome.accepted {
                Some(c) => ProgressEvent::MutantResolved {
                    mutant_id: mutant.id.clone(),
                    candidate_id: c.id.clone(),
                },
                None => ProgressEvent::MutantUnresolved {
                    mutant_id: mutant.id.clone(),
                },
            };
            let _ = tx.send(event);
        }
        if results.send(outcome).await.is_err() {
            break;
        }
    }
}

/// Attempt loop for one surviving mutant.
async fn generate_for_mutant(shared: &GenerationShared, mutant: &Mutant) -> GenerationOutcome {
    let mut outcome = GenerationOutcome {
        mutant_id: mutant.id.clone(),
        accepted: None,
        rejected: Vec::new(),
        warnings: Vec::new(),
    };

    let unit = match shared
        .source_units
        .iter()
        .find(|u| u.identity() == mutant.unit_id)
    {
        Some(u) => u,
        None => {
            outcome
                .warnings
                .push(format!("unit {} vanished between scan and generation", mutant.unit_id));
            return outcome;
        }
    };

    let ctx = context::build(
        unit,
        mutant,
        &shared.source_units,
        &shared.test_units,
        shared.max_related,
        shared.max_context_bytes,
    );

    for attempt in 1..=shared.max_attempts {
        if Instant::now() >= shared.deadline {
            outcome
                .warnings
                .push(format!("budget exhausted while targeting mutant {}", mutant.short_id()));
            break;
        }

        let candidate = match shared.synthesizer.synthesize(&ctx, mutant, attempt).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("synthesis attempt {} for {} failed: {}", attempt, mutant.short_id(), e);
                outcome.warnings.push(e.to_string());
                continue;
            }
        };

        if candidate.verdict == Verdict::RejectedMalformed {
            outcome.rejected.push(candidate);
            continue;
        }

        let verdict = match shared.verifier.verify(&candidate, mutant).await {
            Ok(v) => v,
            Err(e) => {
                outcome.warnings.push(e.to_string());
                continue;
            }
        };

        let candidate = Candidate { verdict, ..candidate };
        if candidate.verdict == Verdict::Accepted {
            outcome.accepted = Some(candidate);
            break;
        }
        outcome.rejected.push(candidate);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::StubModel;

    const SOURCE: &str = "def clamp(x):\n    return x > 0\n";

    const VALID_TEST: &str =
        "from calc import clamp\n\n\ndef test_clamp_zero_boundary():\n    assert clamp(0) is False\n";

    fn fenced(code: &str) -> String {
        format!("```python\n{}\n```", code)
    }

    /// Project with one source file and a scripted suite runner. Without an
    /// argument the runner acts as the whole suite; with one it acts as a
    /// single-file test run, the way verification invokes it.
    fn project(runner: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src").join("calc.py"), SOURCE).unwrap();
        std::fs::create_dir(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join("runner.sh"), runner).unwrap();
        dir
    }

    fn config(max_attempts: u32) -> Config {
        let mut config = Config::default();
        config.run.test_command = "sh runner.sh".to_string();
        config.run.timeout_seconds = 10;
        config.budget.max_attempts_per_mutant = max_attempts;
        config.budget.max_concurrent = 2;
        config
    }

    fn session(dir: &tempfile::TempDir, config: Config, stub: StubModel) -> Session {
        Session::new(
            dir.path(),
            Path::new("src"),
            Path::new("tests"),
            config,
            ModelClient::Stub(stub),
        )
    }

    // A runner that passes as a suite, and as a single-file run passes on
    // the original source but fails whenever the comparison was mutated.
    const DISCRIMINATING_RUNNER: &str =
        "if [ -n \"$1\" ]; then grep -q 'x > 0' src/calc.py; else exit 0; fi\n";

    #[tokio::test]
    async fn test_survivor_resolved_end_to_end() {
        let dir = project(DISCRIMINATING_RUNNER);
        // Every synthesis call gets a valid test back
        let stub = StubModel::scripted(vec![fenced(VALID_TEST); 8]);
        let report = session(&dir, config(2), stub).run().await.unwrap();

        assert!(report.mutants_total > 0);
        assert_eq!(report.survived, report.mutants_total);
        assert!(report.resolved > 0, "report: {:?}", report.warnings);
        assert!(!report.accepted.is_empty());
        assert!(!report.budget_exhausted);
        assert_eq!(report.final_state, SessionState::Done);

        // Accepted tests land merged in the real test tree
        let merged = report.merged_test_file.expect("merged file");
        let merged_text = std::fs::read_to_string(dir.path().join(&merged)).unwrap();
        assert!(merged_text.contains("def test_clamp_zero_boundary"));

        // The source tree itself is untouched
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src").join("calc.py")).unwrap(),
            SOURCE
        );
    }

    #[tokio::test]
    async fn test_candidate_breaking_original_is_rejected() {
        // Single-file runs always fail: every candidate breaks the original.
        let dir = project("if [ -n \"$1\" ]; then exit 1; else exit 0; fi\n");
        let stub = StubModel::scripted(vec![fenced(VALID_TEST); 16]);
        let report = session(&dir, config(2), stub).run().await.unwrap();

        assert_eq!(report.resolved, 0);
        assert!(report.accepted.is_empty());
        assert!(!report.rejected.is_empty());
        assert!(report
            .rejected
            .iter()
            .all(|c| c.verdict == Verdict::RejectedBreaksOriginal));
        assert!(report.merged_test_file.is_none());
        // Attempts were exhausted per mutant
        assert_eq!(report.rejected.len(), report.targeted * 2);
    }

    #[tokio::test]
    async fn test_candidate_not_killing_is_rejected() {
        // Single-file runs always pass, even on the mutant.
        let dir = project("exit 0\n");
        let stub = StubModel::scripted(vec![fenced(VALID_TEST); 16]);
        let report = session(&dir, config(1), stub).run().await.unwrap();

        assert_eq!(report.resolved, 0);
        assert!(report
            .rejected
            .iter()
            .all(|c| c.verdict == Verdict::RejectedNoKill));
        assert!(report.merged_test_file.is_none());
    }

    #[tokio::test]
    async fn test_malformed_output_consumes_attempt() {
        let dir = project(DISCRIMINATING_RUNNER);
        // Both the response and its corrective retry are garbage, twice over
        let stub = StubModel::scripted(vec!["not code ((("; 16]);
        let mut config = config(1);
        config.budget.max_mutants = 1;
        let report = session(&dir, config, stub).run().await.unwrap();

        assert_eq!(report.targeted, 1);
        assert_eq!(report.resolved, 0);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].verdict, Verdict::RejectedMalformed);
    }

    #[tokio::test]
    async fn test_red_baseline_aborts_session() {
        let dir = project("exit 1\n");
        let stub = StubModel::scripted(Vec::<String>::new());
        let err = session(&dir, config(1), stub).run().await.unwrap_err();
        assert!(err.to_string().contains("baseline"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_still_reports() {
        let dir = project(DISCRIMINATING_RUNNER);
        let stub = StubModel::scripted(Vec::<String>::new());
        let mut config = config(1);
        config.budget.max_session_seconds = 0;
        let report = session(&dir, config, stub).run().await.unwrap();

        assert!(report.budget_exhausted);
        assert_eq!(report.final_state, SessionState::Aborted);
        assert_eq!(report.pending, report.mutants_total);
        assert_eq!(report.resolved, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_aborted_state() {
        let dir = project(DISCRIMINATING_RUNNER);
        let stub = StubModel::scripted(Vec::<String>::new());
        let mut config = config(1);
        config.budget.max_session_seconds = 0;
        let mut session = session(&dir, config, stub);
        let mut events = session.progress_events();
        let report = session.run().await.unwrap();

        assert_eq!(report.final_state, SessionState::Aborted);

        let mut last_state = None;
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::StateChanged(s) = event {
                last_state = Some(s);
            }
        }
        assert_eq!(last_state, Some(SessionState::Aborted));
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let dir = project(DISCRIMINATING_RUNNER);
        let stub = StubModel::scripted(vec![fenced(VALID_TEST); 8]);
        let mut session = session(&dir, config(1), stub);
        let mut events = session.progress_events();
        let report = session.run().await.unwrap();

        let mut states = Vec::new();
        let mut resolved = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ProgressEvent::StateChanged(s) => states.push(s),
                ProgressEvent::MutantResolved { .. } => resolved += 1,
                _ => {}
            }
        }
        assert!(states.contains(&SessionState::Classifying));
        assert!(states.contains(&SessionState::Generating));
        assert_eq!(states.last(), Some(&SessionState::Done));
        assert_eq!(resolved, report.resolved);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_for_resolved_mutants() {
        let dir = project(DISCRIMINATING_RUNNER);
        let stub = StubModel::scripted(vec![fenced(VALID_TEST); 8]);
        let first = session(&dir, config(1), stub).run().await.unwrap();
        assert!(first.resolved > 0);

        // Second run: the merged file is only a test-tree artifact; with the
        // same weak suite runner the same survivors are found again, and the
        // engine overwrites its own merged file rather than stacking copies.
        let stub = StubModel::scripted(vec![fenced(VALID_TEST); 8]);
        let second = session(&dir, config(1), stub).run().await.unwrap();
        assert_eq!(second.mutants_total, first.mutants_total);
        let merged = std::fs::read_to_string(
            dir.path().join("tests").join(MERGED_TEST_FILE),
        )
        .unwrap();
        assert_eq!(merged.matches("# --- candidate").count(), second.accepted.len());
    }

    #[tokio::test]
    async fn test_empty_source_tree_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join("tests")).unwrap();
        let stub = StubModel::scripted(Vec::<String>::new());
        let report = session(&dir, config(1), stub).run().await.unwrap();

        assert_eq!(report.mutants_total, 0);
        assert_eq!(report.resolved, 0);
        assert!(report.warnings.iter().any(|w| w.contains("nothing to do")));
    }
}
