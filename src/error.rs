use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Only `SandboxLaunch` aborts a session. Everything else is captured
/// per-file, per-mutant, or per-candidate and surfaced in the session report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A source file could not be parsed. The file is skipped and recorded
    /// as a warning; the scan continues.
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// The execution environment is unusable (shell missing, working tree
    /// unreadable, or the baseline suite fails before any mutation).
    /// Session-fatal.
    #[error("sandbox launch failure: {0}")]
    SandboxLaunch(String),

    /// The model call failed or its output was unusable. Retried up to the
    /// per-mutant attempt cap, then the mutant is left unresolved.
    #[error("generation failed: {0}")]
    Generation(String),
}
