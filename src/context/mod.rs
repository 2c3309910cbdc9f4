//! Generation context: everything the model needs to write a killing test.
//!
//! For a surviving mutant this gathers the unit under mutation, the mutated
//! form, a unified diff between the two, existing tests that already touch
//! the unit, and the unit's direct dependents. The whole bundle is capped in
//! size; the unit and diff always survive truncation because a prompt without
//! them is useless.

use crate::mutants::Mutant;
use crate::source::SourceUnit;
use similar::TextDiff;

/// A related unit included for grounding, identified for traceability.
#[derive(Debug, Clone)]
pub struct RelatedSnippet {
    pub unit_id: String,
    pub text: String,
}

/// The assembled context for one mutant.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub unit_id: String,
    pub unit_text: String,
    pub mutated_text: String,
    /// Unified diff from the original unit to its mutated form
    pub diff: String,
    pub mutant_description: String,
    /// Existing tests that reference the unit
    pub related_tests: Vec<RelatedSnippet>,
    /// Non-test units that call the unit
    pub dependents: Vec<RelatedSnippet>,
    /// True when related material was dropped to honor the size cap
    pub truncated: bool,
}

impl GenerationContext {
    /// Total bytes of source material carried in this context.
    pub fn size_bytes(&self) -> usize {
        self.unit_text.len()
            + self.mutated_text.len()
            + self.diff.len()
            + self
                .related_tests
                .iter()
                .chain(self.dependents.iter())
                .map(|s| s.text.len())
                .sum::<usize>()
    }
}

/// Assemble the context for one surviving mutant.
///
/// `source_units` and `test_units` come from the session's scans. At most
/// `max_related` tests and `max_related` dependents are considered, and the
/// total is trimmed to `max_context_bytes` (related material first, tests
/// kept in preference to dependents).
pub fn build(
    unit: &SourceUnit,
    mutant: &Mutant,
    source_units: &[SourceUnit],
    test_units: &[SourceUnit],
    max_related: usize,
    max_context_bytes: usize,
) -> GenerationContext {
    let mutated_text = mutate_unit_text(unit, mutant);
    let diff = unified_diff(&unit.qualified_name, &unit.text, &mutated_text);

    let name = unit.bare_name();

    let mut related_tests: Vec<RelatedSnippet> = test_units
        .iter()
        .filter(|t| t.identity() != unit.identity())
        .filter(|t| t.dependencies.contains(name) || t.text.contains(name))
        .take(max_related)
        .map(|t| RelatedSnippet {
            unit_id: t.identity(),
            text: t.text.clone(),
        })
        .collect();

    let mut dependents: Vec<RelatedSnippet> = source_units
        .iter()
        .filter(|u| !u.is_test && u.identity() != unit.identity())
        .filter(|u| u.dependencies.contains(name))
        .take(max_related)
        .map(|u| RelatedSnippet {
            unit_id: u.identity(),
            text: u.text.clone(),
        })
        .collect();

    // The unit, its mutation, and the diff are never dropped. Related
    // material goes first when over budget: dependents before tests.
    let base = unit.text.len() + mutated_text.len() + diff.len();
    let mut truncated = false;
    let mut remaining = max_context_bytes.saturating_sub(base);

    fit_to_budget(&mut related_tests, &mut remaining, &mut truncated);
    fit_to_budget(&mut dependents, &mut remaining, &mut truncated);

    tracing::debug!(
        "context for mutant {}: {} tests, {} dependents, truncated={}",
        mutant.short_id(),
        related_tests.len(),
        dependents.len(),
        truncated
    );

    GenerationContext {
        unit_id: unit.identity(),
        unit_text: unit.text.clone(),
        mutated_text,
        diff,
        mutant_description: mutant.description.clone(),
        related_tests,
        dependents,
        truncated,
    }
}

fn fit_to_budget(snippets: &mut Vec<RelatedSnippet>, remaining: &mut usize, truncated: &mut bool) {
    let mut kept = Vec::new();
    for snippet in snippets.drain(..) {
        if snippet.text.len() <= *remaining {
            *remaining -= snippet.text.len();
            kept.push(snippet);
        } else {
            *truncated = true;
        }
    }
    *snippets = kept;
}

/// Apply the mutant's replacement inside the unit's own text.
/// Mutant byte offsets are file-absolute; the unit knows its file range.
fn mutate_unit_text(unit: &SourceUnit, mutant: &Mutant) -> String {
    let start = mutant.start_byte.saturating_sub(unit.start_byte);
    let end = mutant.end_byte.saturating_sub(unit.start_byte);
    if end > unit.text.len() || start > end {
        // Out-of-range mutants fall back to the unmodified unit
        return unit.text.clone();
    }
    let mut out = String::with_capacity(unit.text.len() + mutant.replacement.len());
    out.push_str(&unit.text[..start]);
    out.push_str(&mutant.replacement);
    out.push_str(&unit.text[end..]);
    out
}

fn unified_diff(name: &str, original: &str, mutated: &str) -> String {
    TextDiff::from_lines(original, mutated)
        .unified_diff()
        .context_radius(2)
        .header(&format!("a/{}", name), &format!("b/{}", name))
        .to_string()
}
