//! Two-phase candidate verification.
//!
//! Phase one runs the candidate alone against the unmutated tree; it must
//! pass, otherwise the candidate encodes wrong expectations. Phase two runs
//! it against the mutated tree; it must fail, otherwise it does not actually
//! detect the mutation. The order is load-bearing: a candidate that breaks
//! the original is rejected without ever touching the mutant.

use crate::mutants::Mutant;
use crate::sandbox::{FileOverlay, Sandbox, SandboxRequest};
use crate::synth::{Candidate, Verdict};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct Verifier {
    sandbox: Sandbox,
    project_root: PathBuf,
    /// Test directory, relative to the project root
    test_dir: PathBuf,
    test_command: String,
    time_limit: Duration,
}

impl Verifier {
    pub fn new(
        sandbox: Sandbox,
        project_root: &Path,
        test_dir: &Path,
        test_command: &str,
        time_limit: Duration,
    ) -> Self {
        Self {
            sandbox,
            project_root: project_root.to_path_buf(),
            test_dir: test_dir.to_path_buf(),
            test_command: test_command.to_string(),
            time_limit,
        }
    }

    /// File the candidate is written to during verification, relative to the
    /// project root. Unique per mutant so parallel runs never collide.
    pub fn candidate_path(&self, mutant: &Mutant) -> PathBuf {
        self.test_dir
            .join(format!("test_forge_{}.py", mutant.short_id()))
    }

    /// Run both verification phases and return the final verdict.
    pub async fn verify(&self, candidate: &Candidate, mutant: &Mutant) -> Result<Verdict> {
        let candidate_path = self.candidate_path(mutant);
        let command = format!("{} {}", self.test_command, candidate_path.display());
        let candidate_overlay = FileOverlay {
            path: candidate_path,
            contents: candidate.source.clone(),
        };

        // Phase one: the candidate must pass on the original code.
        let original_run = self
            .sandbox
            .run(SandboxRequest {
                command: command.clone(),
                working_tree: self.project_root.clone(),
                overlays: vec![candidate_overlay.clone()],
                time_limit: self.time_limit,
            })
            .await;

        if !original_run.success() {
            tracing::debug!(
                "candidate {} fails on original (exit {}, limit_exceeded={})",
                candidate.id,
                original_run.exit_code,
                original_run.limit_exceeded
            );
            return Ok(Verdict::RejectedBreaksOriginal);
        }

        // Phase two: the same candidate must fail once the mutation is in.
        let file_content = std::fs::read_to_string(self.project_root.join(&mutant.file))
            .with_context(|| format!("Failed to read {}", mutant.file.display()))?;
        let mutant_overlay = FileOverlay {
            path: mutant.file.clone(),
            contents: mutant.apply_to(&file_content),
        };

        let mutated_run = self
            .sandbox
            .run(SandboxRequest {
                command,
                working_tree: self.project_root.clone(),
                overlays: vec![candidate_overlay, mutant_overlay],
                time_limit: self.time_limit,
            })
            .await;

        // A timeout or an unlaunchable run on the mutated tree is not
        // evidence of a kill.
        let verdict = if mutated_run.limit_exceeded
            || mutated_run.launch_failed()
            || mutated_run.exit_code == 0
        {
            Verdict::RejectedNoKill
        } else {
            Verdict::Accepted
        };

        tracing::debug!(
            "candidate {} verified as {} (mutated run exit {})",
            candidate.id,
            verdict,
            mutated_run.exit_code
        );
        Ok(verdict)
    }
}
