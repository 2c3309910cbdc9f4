//! Mutant store: generates mutants from source units via mutation operators
//! and assigns each a stable identity.
//!
//! Identities are content-derived (sha256 of unit identity, operator, site
//! offset, and replacement), so re-running generation on unchanged source
//! yields the identical mutant set.

pub mod operators;

pub use operators::builtin_operators;

use crate::source::SourceUnit;
use operators::{MutationOperator, MutationSite};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use tree_sitter::{Node, Parser};

/// Classification status of a mutant. Set exactly once by the classifier;
/// terminal within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    Pending,
    Killed,
    Survived,
    TimedOut,
    Errored,
}

impl std::fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Killed => write!(f, "killed"),
            Self::Survived => write!(f, "survived"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// A single behavioral change to one source unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutant {
    /// Deterministic identity (hex sha256)
    pub id: String,
    /// Identity of the parent source unit
    pub unit_id: String,
    /// File path relative to the project root
    pub file: PathBuf,
    /// Name of the operator that produced this mutant
    pub operator: String,
    /// Byte range of the mutated site within the file
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based line of the site
    pub line: usize,
    /// Original text at the site
    pub original: String,
    /// Replacement text
    pub replacement: String,
    /// Human-readable description (e.g. "relational_swap: `>` -> `<=`")
    pub description: String,
    pub status: MutantStatus,
}

impl Mutant {
    /// Short prefix of the identity, for log lines and candidate ids.
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }

    /// Apply this mutant to the content of its file.
    pub fn apply_to(&self, file_content: &str) -> String {
        let mut mutated = String::with_capacity(file_content.len() + self.replacement.len());
        mutated.push_str(&file_content[..self.start_byte]);
        mutated.push_str(&self.replacement);
        mutated.push_str(&file_content[self.end_byte..]);
        mutated
    }
}

/// Content-derived mutant identity.
pub fn mutant_id(unit_id: &str, operator: &str, start_byte: usize, replacement: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unit_id.as_bytes());
    hasher.update(b"|");
    hasher.update(operator.as_bytes());
    hasher.update(b"|");
    hasher.update(start_byte.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(replacement.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn snippet(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.len() > 40 {
        // Back off to a char boundary; byte 40 may fall inside a
        // multibyte character.
        let mut end = 40;
        while end > 0 && !first_line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &first_line[..end])
    } else if text.lines().count() > 1 {
        format!("{}...", first_line)
    } else {
        first_line.to_string()
    }
}

/// Generate all mutants for the given units and operator set.
///
/// Exactly one mutant per (unit, operator, applicable site); duplicate
/// identities are dropped. Test units are never mutated.
pub fn generate(units: &[SourceUnit], operators: &[Box<dyn MutationOperator>]) -> Vec<Mutant> {
    let mut parser = match python_parser() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Mutant generation unavailable: {}", e);
            return Vec::new();
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut mutants = Vec::new();

    for unit in units.iter().filter(|u| !u.is_test) {
        let sites = match collect_sites(&mut parser, &unit.text) {
            Some(s) => s,
            None => {
                tracing::debug!("Skipping unit {}: unit text did not re-parse", unit.identity());
                continue;
            }
        };

        for site in &sites {
            for operator in operators {
                let replacement = match operator.apply(site) {
                    Some(r) => r,
                    None => continue,
                };
                if replacement == site.text {
                    continue;
                }

                let unit_id = unit.identity();
                let file_start = unit.start_byte + site.start_byte;
                let id = mutant_id(&unit_id, operator.name(), file_start, &replacement);
                if !seen.insert(id.clone()) {
                    tracing::debug!("Duplicate mutant identity {} dropped", &id[..12]);
                    continue;
                }

                mutants.push(Mutant {
                    id,
                    unit_id,
                    file: unit.file.clone(),
                    operator: operator.name().to_string(),
                    start_byte: file_start,
                    end_byte: unit.start_byte + site.end_byte,
                    line: unit.start_line + site.row,
                    original: site.text.clone(),
                    replacement: replacement.clone(),
                    description: format!(
                        "{}: `{}` -> `{}`",
                        operator.name(),
                        snippet(&site.text),
                        snippet(&replacement)
                    ),
                    status: MutantStatus::Pending,
                });
            }
        }
    }

    mutants
}

fn python_parser() -> anyhow::Result<Parser> {
    let mut parser = Parser::new();
    let language = tree_sitter_python::LANGUAGE;
    parser
        .set_language(&language.into())
        .map_err(|e| anyhow::anyhow!("Failed to load Python grammar: {}", e))?;
    Ok(parser)
}

/// Collect mutation-eligible sites from one unit's text.
///
/// Sites are emitted in source order, which keeps generation deterministic.
fn collect_sites(parser: &mut Parser, unit_text: &str) -> Option<Vec<MutationSite>> {
    let tree = parser.parse(unit_text, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut sites = Vec::new();
    walk_for_sites(root, unit_text, &mut sites);
    Some(sites)
}

fn walk_for_sites(node: Node<'_>, source: &str, sites: &mut Vec<MutationSite>) {
    // Docstrings are not behavior
    if node.kind() == "expression_statement" && node.child_count() == 1 {
        if let Some(child) = node.child(0) {
            if child.kind() == "string" {
                return;
            }
        }
    }

    match node.kind() {
        "comparison_operator" => {
            let count = node.child_count();
            for i in 0..count {
                if let Some(child) = node.child(i) {
                    if matches!(child.kind(), "<" | ">" | "<=" | ">=" | "==" | "!=") {
                        push_site(child, source, sites);
                    }
                }
            }
        }
        "boolean_operator" => {
            let count = node.child_count();
            for i in 0..count {
                if let Some(child) = node.child(i) {
                    if matches!(child.kind(), "and" | "or") {
                        push_site(child, source, sites);
                    }
                }
            }
        }
        "true" | "false" | "integer" => {
            push_site(node, source, sites);
        }
        "return_statement" => {
            push_site(node, source, sites);
        }
        "if_statement" => {
            if let Some(body) = node.child_by_field_name("consequence") {
                push_site(body, source, sites);
            }
        }
        _ => {}
    }

    let count = node.child_count();
    for i in 0..count {
        if let Some(child) = node.child(i) {
            walk_for_sites(child, source, sites);
        }
    }
}

fn push_site(node: Node<'_>, source: &str, sites: &mut Vec<MutationSite>) {
    sites.push(MutationSite {
        kind: node.kind(),
        text: source[node.start_byte()..node.end_byte()].to_string(),
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
        row: node.start_position().row,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use operators::builtin_operators;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn unit(file: &str, name: &str, text: &str) -> SourceUnit {
        SourceUnit {
            file: Path::new(file).to_path_buf(),
            qualified_name: name.to_string(),
            start_byte: 0,
            end_byte: text.len(),
            start_line: 1,
            text: text.to_string(),
            dependencies: BTreeSet::new(),
            is_test: false,
        }
    }

    #[test]
    fn test_generate_relational_sites() {
        let u = unit("calc.py", "positive", "def positive(x):\n    return x > 0\n");
        let mutants = generate(&[u], &builtin_operators());

        // `>` yields relational_swap and boundary_shift; `0` yields
        // boundary_shift; `return x > 0` yields statement_deletion.
        let operators: Vec<&str> = mutants.iter().map(|m| m.operator.as_str()).collect();
        assert!(operators.contains(&"relational_swap"));
        assert!(operators.contains(&"boundary_shift"));
        assert!(operators.contains(&"statement_deletion"));
        assert_eq!(mutants.len(), 4);
    }

    #[test]
    fn test_generate_deterministic_identities() {
        let u = unit("calc.py", "clamp", "def clamp(x):\n    if x < 0:\n        return 0\n    return x\n");
        let first: Vec<String> = generate(&[u.clone()], &builtin_operators())
            .into_iter()
            .map(|m| m.id)
            .collect();
        let second: Vec<String> = generate(&[u], &builtin_operators())
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_generate_no_duplicate_identities() {
        let u = unit(
            "calc.py",
            "both",
            "def both(a, b):\n    return a < b and b < a\n",
        );
        let mutants = generate(&[u], &builtin_operators());
        let unique: HashSet<&str> = mutants.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(unique.len(), mutants.len());
    }

    #[test]
    fn test_generate_skips_test_units() {
        let mut u = unit("test_calc.py", "test_positive", "def test_positive():\n    assert 1 > 0\n");
        u.is_test = true;
        let mutants = generate(&[u], &builtin_operators());
        assert!(mutants.is_empty());
    }

    #[test]
    fn test_apply_to_replaces_site() {
        let text = "def positive(x):\n    return x > 0\n";
        let u = unit("calc.py", "positive", text);
        let mutants = generate(&[u], &builtin_operators());

        let swap = mutants
            .iter()
            .find(|m| m.operator == "relational_swap")
            .unwrap();
        let mutated = swap.apply_to(text);
        assert!(mutated.contains("return x <= 0"));
        assert!(!mutated.contains("return x > 0"));
    }

    #[test]
    fn test_apply_to_with_file_offset() {
        // The unit starts partway into the file; offsets must still land on
        // the right bytes.
        let file_content = "import os\n\ndef flag():\n    return True\n";
        let unit_start = file_content.find("def flag").unwrap();
        let mut u = unit("flags.py", "flag", &file_content[unit_start..]);
        u.start_byte = unit_start;
        u.end_byte = file_content.len();
        u.start_line = 3;

        let mutants = generate(&[u], &builtin_operators());
        let flip = mutants
            .iter()
            .find(|m| m.operator == "boolean_negation")
            .unwrap();
        assert_eq!(flip.line, 4);

        let mutated = flip.apply_to(file_content);
        assert!(mutated.contains("return False"));
        assert!(mutated.starts_with("import os"));
    }

    #[test]
    fn test_if_body_deletion_produces_valid_python() {
        let text = "def guard(x):\n    if x > 10:\n        return x\n    return 0\n";
        let u = unit("calc.py", "guard", text);
        let mutants = generate(&[u], &builtin_operators());

        let deletion = mutants
            .iter()
            .find(|m| m.operator == "statement_deletion" && m.replacement == "pass")
            .unwrap();
        let mutated = deletion.apply_to(text);
        assert!(mutated.contains("if x > 10:\n        pass"));
    }

    #[test]
    fn test_docstrings_not_mutated() {
        let text = "def doc():\n    \"\"\"Returns 1 if x > 0 and y < 2.\"\"\"\n    return 1\n";
        let u = unit("calc.py", "doc", text);
        let mutants = generate(&[u], &builtin_operators());
        assert!(mutants
            .iter()
            .all(|m| !m.original.contains("Returns 1")));
    }

    #[test]
    fn test_description_truncates_multibyte_source() {
        // The returned string literal pushes the site's first line past 40
        // bytes with a Cyrillic character straddling the cutoff.
        let text = "def label():\n    return \"статус: проверка границы значения\"\n";
        let u = unit("calc.py", "label", text);
        let mutants = generate(&[u], &builtin_operators());

        let deletion = mutants
            .iter()
            .find(|m| m.operator == "statement_deletion")
            .unwrap();
        assert!(deletion.description.starts_with("statement_deletion"));
        assert!(deletion.description.contains("..."));
    }

    #[test]
    fn test_status_starts_pending() {
        let u = unit("calc.py", "one", "def one():\n    return 1\n");
        let mutants = generate(&[u], &builtin_operators());
        assert!(mutants.iter().all(|m| m.status == MutantStatus::Pending));
    }

    #[test]
    fn test_mutant_status_display() {
        assert_eq!(MutantStatus::Killed.to_string(), "killed");
        assert_eq!(MutantStatus::TimedOut.to_string(), "timed_out");
    }
}
