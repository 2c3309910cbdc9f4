//! Test synthesis: turns a generation context into candidate test code.
//!
//! The model is asked for a single fenced Python block containing pytest
//! tests. Output that does not parse, or parses but contains no test
//! function, gets one corrective re-prompt; a second failure produces a
//! candidate already marked malformed so the report still accounts for it.

use crate::context::GenerationContext;
use crate::error::EngineError;
use crate::mutants::Mutant;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tree_sitter::Parser;

/// Lifecycle of one candidate test. Set exactly once past `Unverified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Synthesized but not yet run
    Unverified,
    /// Passes on the original tree and fails on the mutant
    Accepted,
    /// Passed on both trees: does not detect the mutation
    RejectedNoKill,
    /// Failed (or timed out) on the unmutated tree
    RejectedBreaksOriginal,
    /// Model output was not usable test code after a corrective retry
    RejectedMalformed,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Unverified => "unverified",
            Verdict::Accepted => "accepted",
            Verdict::RejectedNoKill => "rejected_no_kill",
            Verdict::RejectedBreaksOriginal => "rejected_breaks_original",
            Verdict::RejectedMalformed => "rejected_malformed",
        };
        write!(f, "{}", s)
    }
}

/// One synthesized test file targeting one mutant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// `<mutant short id>-a<attempt>`
    pub id: String,
    pub mutant_id: String,
    /// Python source of the candidate test file
    pub source: String,
    /// 1-based synthesis attempt that produced this candidate
    pub attempt: u32,
    pub verdict: Verdict,
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to model endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Model API error: {} - {}", status, body);
        }

        let result: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse model response")?;

        Ok(result.response)
    }

    /// Check whether the endpoint answers at all.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        self.client.get(&url).send().await.is_ok()
    }
}

/// Deterministic model stand-in: replays a scripted sequence of responses.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct StubModel {
    responses: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<String>>>,
    pub prompts: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl StubModel {
    pub fn scripted<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            responses: std::sync::Arc::new(std::sync::Mutex::new(
                responses.into_iter().map(Into::into).collect(),
            )),
            prompts: Default::default(),
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("stub model has no more responses"))
    }
}

/// The generative backend. Enum dispatch keeps the futures `Send` so workers
/// can be spawned without boxing.
pub enum ModelClient {
    Ollama(OllamaClient),
    #[cfg(test)]
    Stub(StubModel),
}

impl ModelClient {
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        match self {
            ModelClient::Ollama(client) => client.generate(prompt).await,
            #[cfg(test)]
            ModelClient::Stub(stub) => stub.generate(prompt).await,
        }
    }
}

pub struct Synthesizer {
    client: std::sync::Arc<ModelClient>,
}

impl Synthesizer {
    pub fn new(client: ModelClient) -> Self {
        Self {
            client: std::sync::Arc::new(client),
        }
    }

    pub fn new_shared(client: std::sync::Arc<ModelClient>) -> Self {
        Self { client }
    }

    /// Produce one candidate for the mutant.
    ///
    /// Returns `Err` only when the model call itself fails; unusable output
    /// comes back as a candidate with verdict [`Verdict::RejectedMalformed`].
    pub async fn synthesize(
        &self,
        context: &GenerationContext,
        mutant: &Mutant,
        attempt: u32,
    ) -> Result<Candidate, EngineError> {
        let prompt = build_prompt(context);
        let response = self
            .client
            .generate(&prompt)
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        let code = extract_test_code(&response);
        let code = match validate_test_code(&code) {
            Ok(()) => code,
            Err(reason) => {
                tracing::debug!(
                    "candidate for mutant {} rejected ({}), re-prompting",
                    mutant.short_id(),
                    reason
                );
                let retry_prompt = corrective_prompt(&prompt, &code, &reason);
                let response = self
                    .client
                    .generate(&retry_prompt)
                    .await
                    .map_err(|e| EngineError::Generation(e.to_string()))?;
                let code = extract_test_code(&response);
                match validate_test_code(&code) {
                    Ok(()) => code,
                    Err(reason) => {
                        tracing::warn!(
                            "mutant {}: model output unusable after retry: {}",
                            mutant.short_id(),
                            reason
                        );
                        return Ok(Candidate {
                            id: format!("{}-a{}", mutant.short_id(), attempt),
                            mutant_id: mutant.id.clone(),
                            source: code,
                            attempt,
                            verdict: Verdict::RejectedMalformed,
                        });
                    }
                }
            }
        };

        Ok(Candidate {
            id: format!("{}-a{}", mutant.short_id(), attempt),
            mutant_id: mutant.id.clone(),
            source: code,
            attempt,
            verdict: Verdict::Unverified,
        })
    }
}

/// The main synthesis prompt for one surviving mutant.
fn build_prompt(context: &GenerationContext) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are improving a Python project's test suite. A small mutation was \
         applied to the code below and the existing tests did not catch it. \
         Write pytest tests that pass on the ORIGINAL code but FAIL on the \
         mutated code.\n\n",
    );

    prompt.push_str(&format!("Function under test ({}):\n", context.unit_id));
    prompt.push_str("```python\n");
    prompt.push_str(&context.unit_text);
    prompt.push_str("\n```\n\n");

    prompt.push_str(&format!("Applied mutation: {}\n", context.mutant_description));
    prompt.push_str("```diff\n");
    prompt.push_str(&context.diff);
    prompt.push_str("```\n\n");

    if !context.related_tests.is_empty() {
        prompt.push_str("Existing tests for this function (do not repeat them):\n");
        for test in &context.related_tests {
            prompt.push_str("```python\n");
            prompt.push_str(&test.text);
            prompt.push_str("\n```\n");
        }
        prompt.push('\n');
    }

    if !context.dependents.is_empty() {
        prompt.push_str("Callers, for context on how the function is used:\n");
        for dep in &context.dependents {
            prompt.push_str("```python\n");
            prompt.push_str(&dep.text);
            prompt.push_str("\n```\n");
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Requirements:\n\
         1. Respond with exactly ONE fenced Python code block and nothing else.\n\
         2. The block must be a complete, self-contained test file including imports.\n\
         3. Every test function name must start with `test_`.\n\
         4. Target the exact behavior the mutation changes (the diff above).\n\
         5. Do not modify or re-define the function under test.\n",
    );

    prompt
}

/// Retry prompt when the first response was not usable test code.
fn corrective_prompt(original_prompt: &str, bad_output: &str, reason: &str) -> String {
    format!(
        "{}\n\nYour previous response was rejected: {}.\n\
         Previous response:\n```\n{}\n```\n\
         Respond again with exactly one fenced Python code block containing \
         valid pytest tests.\n",
        original_prompt, reason, bad_output
    )
}

/// Pull the test code out of the model response.
///
/// Prefers the first fenced code block; a response with no fence at all is
/// taken verbatim and left to validation.
fn extract_test_code(response: &str) -> String {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // Skip the language tag on the opening fence
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
        return body.trim().to_string();
    }

    trimmed.to_string()
}

/// A usable candidate parses as Python and defines at least one test.
fn validate_test_code(code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("empty output".to_string());
    }

    let mut parser = Parser::new();
    let language = tree_sitter_python::LANGUAGE;
    parser
        .set_language(&language.into())
        .map_err(|e| format!("grammar load failure: {}", e))?;

    let tree = parser
        .parse(code, None)
        .ok_or_else(|| "parse failure".to_string())?;
    if tree.root_node().has_error() {
        return Err("not valid Python".to_string());
    }

    if !has_test_function(tree.root_node(), code.as_bytes()) {
        return Err("no function named test_* found".to_string());
    }

    Ok(())
}

fn has_test_function(node: tree_sitter::Node, source: &[u8]) -> bool {
    if node.kind() == "function_definition" {
        if let Some(name) = node.child_by_field_name("name") {
            if let Ok(text) = name.utf8_text(source) {
                if text.starts_with("test_") {
                    return true;
                }
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if has_test_function(child, source) {
            return true;
        }
    }
    false
}
