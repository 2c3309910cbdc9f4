//! Mutation operator capability set.
//!
//! Operators are pluggable: each one inspects a syntax site and either
//! produces a mutated replacement or reports "not applicable". New operators
//! can be registered without touching the store or its callers.

/// A syntax site eligible for mutation, located within one unit's text.
#[derive(Debug, Clone)]
pub struct MutationSite {
    /// Tree-sitter node kind at the site
    pub kind: &'static str,
    /// Source text at the site
    pub text: String,
    /// Byte range within the unit's text
    pub start_byte: usize,
    pub end_byte: usize,
    /// 0-based row within the unit's text
    pub row: usize,
}

/// An operator that can mutate a syntax site.
pub trait MutationOperator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replacement text for the site, or `None` when the operator does not
    /// apply there.
    fn apply(&self, site: &MutationSite) -> Option<String>;
}

/// `a < b` becomes `a >= b`: swaps a relational operator for its negation.
pub struct RelationalSwap;

impl MutationOperator for RelationalSwap {
    fn name(&self) -> &'static str {
        "relational_swap"
    }

    fn apply(&self, site: &MutationSite) -> Option<String> {
        let replacement = match site.kind {
            "<" => ">=",
            ">" => "<=",
            "<=" => ">",
            ">=" => "<",
            "==" => "!=",
            "!=" => "==",
            _ => return None,
        };
        Some(replacement.to_string())
    }
}

/// `a < b` becomes `a <= b`, `n` becomes `n + 1`: shifts a boundary by one.
pub struct BoundaryShift;

impl MutationOperator for BoundaryShift {
    fn name(&self) -> &'static str {
        "boundary_shift"
    }

    fn apply(&self, site: &MutationSite) -> Option<String> {
        match site.kind {
            "<" => Some("<=".to_string()),
            "<=" => Some("<".to_string()),
            ">" => Some(">=".to_string()),
            ">=" => Some(">".to_string()),
            "integer" => {
                let n: i64 = site.text.parse().ok()?;
                Some((n + 1).to_string())
            }
            _ => None,
        }
    }
}

/// `True` becomes `False`, `and` becomes `or`: flips boolean logic.
pub struct BooleanNegation;

impl MutationOperator for BooleanNegation {
    fn name(&self) -> &'static str {
        "boolean_negation"
    }

    fn apply(&self, site: &MutationSite) -> Option<String> {
        let replacement = match site.kind {
            "true" => "False",
            "false" => "True",
            "and" => "or",
            "or" => "and",
            _ => return None,
        };
        Some(replacement.to_string())
    }
}

/// Replaces an if-body with `pass` or a return value with `None`.
pub struct StatementDeletion;

impl MutationOperator for StatementDeletion {
    fn name(&self) -> &'static str {
        "statement_deletion"
    }

    fn apply(&self, site: &MutationSite) -> Option<String> {
        match site.kind {
            "block" => {
                if site.text.trim() == "pass" {
                    return None;
                }
                Some("pass".to_string())
            }
            "return_statement" => {
                let expr = site.text.strip_prefix("return")?.trim();
                // A bare `return` already yields None; mutating it would be
                // behaviorally equivalent.
                if expr.is_empty() || expr == "None" {
                    return None;
                }
                Some("return None".to_string())
            }
            _ => None,
        }
    }
}

/// The default operator set.
pub fn builtin_operators() -> Vec<Box<dyn MutationOperator>> {
    vec![
        Box::new(RelationalSwap),
        Box::new(BoundaryShift),
        Box::new(BooleanNegation),
        Box::new(StatementDeletion),
    ]
}
