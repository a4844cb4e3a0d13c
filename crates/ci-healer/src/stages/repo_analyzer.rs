//! Stage 2 — Repository Analyzer (spec §4.1).
//!
//! Detects language mode by probing marker files in strict priority order,
//! enumerates source/test/config files with `ignore::WalkBuilder` (pruning a
//! fixed ignore set rather than respecting `.gitignore`, since a freshly
//! cloned repo's own excludes are exactly what we want to walk *into*), and
//! builds a best-effort Python import-dependency graph.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use ignore::WalkBuilder;
use regex::Regex;

use crate::types::{Language, RunState};

const IGNORED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    "venv",
    ".venv",
    "dist",
    "build",
    "target",
    ".gradle",
    ".next",
    "coverage",
];

const PYTHON_EXTS: &[&str] = &["py"];
const NODE_EXTS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];
const JAVA_EXTS: &[&str] = &["java"];

/// Detect language + test tool per spec §4.1's strict priority order.
pub fn detect_language(repo_root: &Path) -> (Language, String) {
    if repo_root.join("package.json").exists() {
        let tool = if repo_root.join("yarn.lock").exists() {
            "yarn test"
        } else {
            "npm test"
        };
        return (Language::Node, tool.to_string());
    }
    if repo_root.join("pom.xml").exists() {
        return (Language::Java, "mvn test".to_string());
    }
    if repo_root.join("build.gradle").exists() || repo_root.join("build.gradle.kts").exists() {
        return (Language::Java, "gradle test".to_string());
    }
    let python_markers = [
        "requirements.txt",
        "pyproject.toml",
        "setup.py",
        "setup.cfg",
        "Pipfile",
    ];
    if python_markers.iter().any(|m| repo_root.join(m).exists()) {
        return (Language::Python, "pytest".to_string());
    }

    // Fallback: count files by extension, Java > Node > Python on ties.
    let mut java_count = 0usize;
    let mut node_count = 0usize;
    let mut python_count = 0usize;

    for entry in walk(repo_root) {
        let Some(ext) = entry.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if JAVA_EXTS.contains(&ext) {
            java_count += 1;
        } else if NODE_EXTS.contains(&ext) {
            node_count += 1;
        } else if PYTHON_EXTS.contains(&ext) {
            python_count += 1;
        }
    }

    let max = java_count.max(node_count).max(python_count);
    if max == 0 {
        return (Language::Unknown, String::new());
    }
    if java_count == max {
        (Language::Java, "mvn test".to_string())
    } else if node_count == max {
        (Language::Node, "npm test".to_string())
    } else {
        (Language::Python, "pytest".to_string())
    }
}

fn walk(repo_root: &Path) -> Vec<std::path::PathBuf> {
    let mut builder = WalkBuilder::new(repo_root);
    builder
        .hidden(true)
        .git_ignore(false)
        .git_exclude(false)
        .ignore(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !IGNORED_DIRS.contains(&name.as_ref())
        });

    builder
        .build()
        .filter_map(|r| r.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.into_path())
        .collect()
}

fn relative(repo_root: &Path, path: &Path) -> String {
    path.strip_prefix(repo_root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn is_test_file(language: Language, rel_path: &str) -> bool {
    let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match language {
        Language::Python => file_name.starts_with("test_") || file_name.ends_with("_test.py"),
        Language::Node => {
            file_name.contains(".test.") || file_name.contains(".spec.") || {
                rel_path.contains("__tests__/") || rel_path.contains("tests/")
            }
        }
        Language::Java => {
            let stem = file_name.trim_end_matches(".java");
            stem.starts_with("Test") || stem.ends_with("Test") || stem.ends_with("Tests") || stem.ends_with("Spec")
        }
        Language::Unknown => false,
    }
}

fn is_config_file(rel_path: &str) -> bool {
    const CONFIG_NAMES: &[&str] = &[
        "package.json",
        "pom.xml",
        "build.gradle",
        "build.gradle.kts",
        "requirements.txt",
        "pyproject.toml",
        "setup.py",
        "setup.cfg",
        "Pipfile",
        "tsconfig.json",
        "jest.config.js",
        "pytest.ini",
    ];
    let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    CONFIG_NAMES.contains(&file_name)
}

fn extensions_for(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => PYTHON_EXTS,
        Language::Node => NODE_EXTS,
        Language::Java => JAVA_EXTS,
        Language::Unknown => &[],
    }
}

/// Build a best-effort Python import-dependency graph: file -> files it
/// imports. Other languages get an empty map keyed by every file (spec
/// §4.1). Resolution is a best-suffix match of the imported module name
/// against discovered source file stems.
fn build_python_dependency_graph(
    repo_root: &Path,
    source_files: &[String],
) -> HashMap<String, Vec<String>> {
    let import_re = Regex::new(r"^\s*(?:from\s+([\w\.]+)\s+import|import\s+([\w\.]+))").unwrap();

    // module-name candidate -> file path, built from every source file's
    // dotted module path relative to repo root.
    let mut module_index: HashMap<String, String> = HashMap::new();
    for f in source_files {
        let without_ext = f.trim_end_matches(".py");
        let dotted = without_ext.replace('/', ".");
        module_index.insert(dotted.clone(), f.clone());
        if let Some(last) = dotted.rsplit('.').next() {
            module_index.entry(last.to_string()).or_insert_with(|| f.clone());
        }
    }

    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for f in source_files {
        let mut imports = Vec::new();
        let full_path = repo_root.join(f);
        if let Ok(contents) = std::fs::read_to_string(&full_path) {
            let mut seen = HashSet::new();
            for line in contents.lines() {
                if let Some(cap) = import_re.captures(line) {
                    let module = cap
                        .get(1)
                        .or_else(|| cap.get(2))
                        .map(|m| m.as_str().to_string());
                    if let Some(module) = module {
                        let candidate = module.split('.').next().unwrap_or(&module).to_string();
                        if let Some(target) = module_index
                            .get(&module)
                            .or_else(|| module_index.get(&candidate))
                        {
                            if target != f && seen.insert(target.clone()) {
                                imports.push(target.clone());
                            }
                        }
                    }
                }
            }
        }
        graph.insert(f.clone(), imports);
    }
    graph
}

/// Stage entry point: populates `language`, `test_tool`, file lists, and the
/// dependency graph on `RunState`.
pub fn run(state: &mut RunState) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.failures.len() as u32;

    let (language, test_tool) = detect_language(&state.repo_path);
    state.language = language;
    state.test_tool = test_tool;

    let exts = extensions_for(language);
    let mut source_files = Vec::new();
    let mut test_files = Vec::new();
    let mut config_files = Vec::new();

    for path in walk(&state.repo_path) {
        let rel = relative(&state.repo_path, &path);
        if is_config_file(&rel) {
            config_files.push(rel.clone());
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !exts.contains(&ext) {
            continue;
        }
        if is_test_file(language, &rel) {
            test_files.push(rel);
        } else {
            source_files.push(rel);
        }
    }

    state.dependency_graph = if language == Language::Python {
        build_python_dependency_graph(&state.repo_path, &source_files)
    } else {
        let mut all = source_files.clone();
        all.extend(test_files.clone());
        all.into_iter().map(|f| (f, Vec::new())).collect()
    };

    state.source_files = source_files;
    state.test_files = test_files;
    state.config_files = config_files;

    let description = format!(
        "Detected {} project ({} source files, {} test files)",
        state.language,
        state.source_files.len(),
        state.test_files.len()
    );
    tracing::info!(run_id = %state.run_id, language = %state.language, "repository analyzed");
    state.push_event(
        "REPO_ANALYZED",
        description,
        before,
        before,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}
