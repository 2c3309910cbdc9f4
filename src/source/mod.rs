//! Source model: parses a Python source tree into addressable units.
//!
//! Units are functions, methods, and their enclosing metadata (code range,
//! dependency identifiers). Ordering is deterministic (file path, then
//! declaration order) so downstream mutant identities are stable across runs
//! on unchanged source.

use crate::error::EngineError;
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Parser};

/// One addressable unit of the scanned tree: a function or a method.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// File path, relative to the project root
    pub file: PathBuf,
    /// `function` for top-level functions, `Class.method` for methods
    pub qualified_name: String,
    /// Byte range of the definition within the file
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based line of the definition
    pub start_line: usize,
    /// Full text of the definition
    pub text: String,
    /// Names this unit calls plus the file's imports
    pub dependencies: BTreeSet<String>,
    /// Whether this unit belongs to the test tree or is itself a test
    pub is_test: bool,
}

impl SourceUnit {
    /// Stable identity used for mutant hashing and report aggregation.
    pub fn identity(&self) -> String {
        format!("{}::{}", self.file.display(), self.qualified_name)
    }

    /// Bare name without the class qualifier.
    pub fn bare_name(&self) -> &str {
        self.qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.qualified_name)
    }
}

/// Result of scanning one directory tree.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub units: Vec<SourceUnit>,
    /// Human-readable warnings for files that were skipped
    pub warnings: Vec<String>,
}

fn python_parser() -> Result<Parser> {
    let mut parser = Parser::new();
    let language = tree_sitter_python::LANGUAGE;
    parser
        .set_language(&language.into())
        .map_err(|e| anyhow::anyhow!("Failed to load Python grammar: {}", e))?;
    Ok(parser)
}

const SKIP_DIRS: &[&str] = &[
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
    "target",
    "dist",
    "build",
];

/// Scan `dir` (relative to `project_root`) for Python units.
///
/// A file that fails to parse is skipped and recorded as a warning; the scan
/// never aborts on a single bad file. When `force_test` is set, every unit is
/// flagged as a test unit regardless of naming (used for the test tree).
pub fn scan(project_root: &Path, dir: &Path, force_test: bool) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    let scan_root = project_root.join(dir);

    if !scan_root.is_dir() {
        anyhow::bail!("Directory does not exist: {}", scan_root.display());
    }

    let mut parser = python_parser()?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(&scan_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.path() == scan_root {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
        })
    {
        // Unreadable entries are skipped like unparsable files, not fatal
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let message = format!("skipping unreadable entry: {}", e);
                tracing::warn!("{}", message);
                result.warnings.push(message);
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "py") {
            files.push(path.to_path_buf());
        }
    }

    for path in files {
        let relative = path
            .strip_prefix(project_root)
            .unwrap_or(&path)
            .to_path_buf();

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                let err = EngineError::Parse {
                    path: relative.display().to_string(),
                    message: e.to_string(),
                };
                tracing::warn!("{}", err);
                result.warnings.push(err.to_string());
                continue;
            }
        };

        match parse_file(&mut parser, &relative, &content, force_test) {
            Ok(mut units) => result.units.append(&mut units),
            Err(err) => {
                tracing::warn!("{}", err);
                result.warnings.push(err.to_string());
            }
        }
    }

    Ok(result)
}

/// Parse one file's content into units. Fails with `EngineError::Parse` when
/// the file has syntax errors.
fn parse_file(
    parser: &mut Parser,
    relative: &Path,
    content: &str,
    force_test: bool,
) -> std::result::Result<Vec<SourceUnit>, EngineError> {
    let tree = parser.parse(content, None).ok_or_else(|| EngineError::Parse {
        path: relative.display().to_string(),
        message: "parser returned no tree".to_string(),
    })?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(EngineError::Parse {
            path: relative.display().to_string(),
            message: "syntax error".to_string(),
        });
    }

    let file_is_test = force_test || file_looks_like_test(relative);
    let imports = collect_imports(root, content);

    let mut units = Vec::new();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        collect_units_from_statement(child, content, relative, &imports, file_is_test, &mut units);
    }

    Ok(units)
}

fn file_looks_like_test(path: &Path) -> bool {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    stem.starts_with("test_") || stem.ends_with("_test")
}

/// Unwrap a `decorated_definition` down to the definition it decorates.
fn inner_definition(node: Node<'_>) -> Node<'_> {
    if node.kind() == "decorated_definition" {
        if let Some(def) = node.child_by_field_name("definition") {
            return def;
        }
    }
    node
}

fn collect_units_from_statement(
    node: Node<'_>,
    content: &str,
    relative: &Path,
    imports: &BTreeSet<String>,
    file_is_test: bool,
    units: &mut Vec<SourceUnit>,
) {
    let def = inner_definition(node);

    match def.kind() {
        "function_definition" => {
            if let Some(name) = definition_name(def, content) {
                units.push(make_unit(node, def, content, relative, name, imports, file_is_test));
            }
        }
        "class_definition" => {
            let class_name = match definition_name(def, content) {
                Some(n) => n,
                None => return,
            };
            if let Some(body) = def.child_by_field_name("body") {
                let mut cursor = body.walk();
                for member in body.children(&mut cursor) {
                    let member_def = inner_definition(member);
                    if member_def.kind() == "function_definition" {
                        if let Some(name) = definition_name(member_def, content) {
                            let qualified = format!("{}.{}", class_name, name);
                            units.push(make_unit(
                                member,
                                member_def,
                                content,
                                relative,
                                qualified,
                                imports,
                                file_is_test,
                            ));
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

fn definition_name(def: Node<'_>, content: &str) -> Option<String> {
    def.child_by_field_name("name")
        .map(|n| node_text(n, content).to_string())
}

fn make_unit(
    outer: Node<'_>,
    def: Node<'_>,
    content: &str,
    relative: &Path,
    qualified_name: String,
    imports: &BTreeSet<String>,
    file_is_test: bool,
) -> SourceUnit {
    let bare = qualified_name.rsplit('.').next().unwrap_or("");
    let is_test = file_is_test || bare.starts_with("test_");

    let mut dependencies = imports.clone();
    collect_callees(def, content, &mut dependencies);

    SourceUnit {
        file: relative.to_path_buf(),
        qualified_name,
        start_byte: outer.start_byte(),
        end_byte: outer.end_byte(),
        start_line: outer.start_position().row + 1,
        text: content[outer.start_byte()..outer.end_byte()].to_string(),
        dependencies,
        is_test,
    }
}

/// Names called within a definition: plain identifiers and dotted attribute
/// paths of call expressions.
fn collect_callees(node: Node<'_>, content: &str, out: &mut BTreeSet<String>) {
    if node.kind() == "call" {
        if let Some(func) = node.child_by_field_name("function") {
            match func.kind() {
                "identifier" | "attribute" => {
                    out.insert(node_text(func, content).to_string());
                }
                _ => {}
            }
        }
    }
    let count = node.child_count();
    for i in 0..count {
        if let Some(child) = node.child(i) {
            collect_callees(child, content, out);
        }
    }
}

/// Module-level imported names (`import x.y`, `from m import a, b`).
fn collect_imports(root: Node<'_>, content: &str) -> BTreeSet<String> {
    let mut imports = BTreeSet::new();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        if child.kind() == "import_statement" || child.kind() == "import_from_statement" {
            collect_import_names(child, content, &mut imports);
        }
    }
    imports
}

fn collect_import_names(node: Node<'_>, content: &str, out: &mut BTreeSet<String>) {
    match node.kind() {
        "dotted_name" => {
            out.insert(node_text(node, content).to_string());
            return;
        }
        "aliased_import" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                out.insert(node_text(alias, content).to_string());
            }
        }
        _ => {}
    }
    let count = node.child_count();
    for i in 0..count {
        if let Some(child) = node.child(i) {
            collect_import_names(child, content, out);
        }
    }
}

pub(crate) fn node_text<'a>(node: Node<'a>, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scan_fixture(files: &[(&str, &str)]) -> ScanResult {
        let temp = TempDir::new().unwrap();
        for (name, content) in files {
            let path = temp.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        scan(temp.path(), Path::new(""), false).unwrap()
    }

    #[test]
    fn test_scan_top_level_functions() {
        let result = scan_fixture(&[(
            "calc.py",
            "def add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b\n",
        )]);

        assert_eq!(result.units.len(), 2);
        assert_eq!(result.units[0].qualified_name, "add");
        assert_eq!(result.units[1].qualified_name, "sub");
        assert_eq!(result.units[0].start_line, 1);
        assert!(result.units[0].text.contains("return a + b"));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_scan_class_methods_qualified() {
        let result = scan_fixture(&[(
            "shapes.py",
            "class Circle:\n    def area(self):\n        return 3\n\n    def name(self):\n        return \"circle\"\n",
        )]);

        let names: Vec<&str> = result
            .units
            .iter()
            .map(|u| u.qualified_name.as_str())
            .collect();
        assert_eq!(names, vec!["Circle.area", "Circle.name"]);
        assert_eq!(result.units[0].bare_name(), "area");
    }

    #[test]
    fn test_scan_dependencies_include_callees_and_imports() {
        let result = scan_fixture(&[(
            "app.py",
            "import math\n\ndef hypot(a, b):\n    return math.sqrt(a * a + b * b)\n",
        )]);

        let unit = &result.units[0];
        assert!(unit.dependencies.contains("math"));
        assert!(unit.dependencies.contains("math.sqrt"));
    }

    #[test]
    fn test_scan_skips_unparsable_file_with_warning() {
        let result = scan_fixture(&[
            ("good.py", "def ok():\n    return 1\n"),
            ("bad.py", "def broken(:\n    ???\n"),
        ]);

        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].qualified_name, "ok");
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("bad.py"));
    }

    #[test]
    fn test_scan_flags_test_units() {
        let result = scan_fixture(&[
            ("test_calc.py", "def test_add():\n    assert True\n"),
            ("calc.py", "def add(a, b):\n    return a + b\n"),
        ]);

        let test_unit = result
            .units
            .iter()
            .find(|u| u.qualified_name == "test_add")
            .unwrap();
        assert!(test_unit.is_test);

        let src_unit = result.units.iter().find(|u| u.qualified_name == "add").unwrap();
        assert!(!src_unit.is_test);
    }

    #[test]
    fn test_scan_force_test_marks_everything() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("helpers.py"), "def make():\n    return 1\n").unwrap();

        let result = scan(temp.path(), Path::new(""), true).unwrap();
        assert!(result.units.iter().all(|u| u.is_test));
    }

    #[test]
    fn test_scan_deterministic_ordering() {
        let files = &[
            ("b.py", "def beta():\n    return 2\n"),
            ("a.py", "def alpha():\n    return 1\n"),
        ];
        let first = scan_fixture(files);
        let second = scan_fixture(files);

        let ids_first: Vec<String> = first.units.iter().map(|u| u.identity()).collect();
        let ids_second: Vec<String> = second.units.iter().map(|u| u.identity()).collect();
        assert_eq!(ids_first, ids_second);
        // Sorted file walk puts a.py before b.py
        assert!(ids_first[0].starts_with("a.py"));
    }

    #[test]
    fn test_scan_skips_cache_dirs() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("__pycache__");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("stale.py"), "def stale():\n    return 0\n").unwrap();
        std::fs::write(temp.path().join("live.py"), "def live():\n    return 1\n").unwrap();

        let result = scan(temp.path(), Path::new(""), false).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].qualified_name, "live");
    }

    #[test]
    fn test_scan_survives_unreadable_subdir() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("ok.py"), "def ok():\n    return 1\n").unwrap();
        let locked = temp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("hidden.py"), "def hidden():\n    return 2\n").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Must not abort, whether or not the process can read the directory
        // (root can; everyone else gets a warning).
        let result = scan(temp.path(), Path::new(""), false).unwrap();
        assert!(result.units.iter().any(|u| u.qualified_name == "ok"));

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_scan_missing_dir_errors() {
        let temp = TempDir::new().unwrap();
        let result = scan(temp.path(), Path::new("nope"), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_decorated_function_included() {
        let result = scan_fixture(&[(
            "svc.py",
            "import functools\n\n@functools.cache\ndef cached(x):\n    return x * 2\n",
        )]);

        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].qualified_name, "cached");
        // Range covers the decorator so mutants inside the body offset correctly
        assert!(result.units[0].text.starts_with("@functools.cache"));
    }
}
