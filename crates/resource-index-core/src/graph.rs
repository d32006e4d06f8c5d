//! Import graph of a set of source files.
//!
//! Imports are read line by line with per-language patterns (Python, Rust,
//! JavaScript/TypeScript, Go); nothing is parsed. An import that names a
//! file of the same set becomes an internal edge, everything else is kept
//! as an external module name.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// One file and what it imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileImports {
    pub path: String,
    /// Imported module names as written, sorted and deduplicated.
    pub imports: Vec<String>,
    /// Files of the same graph those imports resolve to.
    pub internal: Vec<String>,
    /// Imports that resolve to no file of the graph.
    pub external: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportGraph {
    pub files: Vec<FileImports>,
}

impl ImportGraph {
    /// Build the graph of `files` (path to text). Files in a language
    /// without import patterns are still nodes, with no edges.
    pub fn build(files: &BTreeMap<String, String>) -> Self {
        let paths: BTreeSet<&str> = files.keys().map(String::as_str).collect();
        let files = files
            .iter()
            .map(|(path, text)| {
                let imports = extract_imports(path, text);
                let mut internal = BTreeSet::new();
                let mut external = Vec::new();
                for import in &imports {
                    match resolve_import(path, import, &paths) {
                        Some(target) if &target == path => {}
                        Some(target) => {
                            internal.insert(target);
                        }
                        None => external.push(import.clone()),
                    }
                }
                FileImports {
                    path: path.clone(),
                    imports,
                    internal: internal.into_iter().collect(),
                    external,
                }
            })
            .collect();
        Self { files }
    }

    pub fn edge_count(&self) -> usize {
        self.files.iter().map(|f| f.internal.len()).sum()
    }

    /// Graphviz rendering. Internal edges are solid; imports that left the
    /// file set point at dashed module nodes.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph imports {\n    rankdir=LR;\n    node [shape=box];\n");
        let mut external = BTreeSet::new();
        for file in &self.files {
            out.push_str(&format!("    {};\n", quote(&file.path)));
        }
        for file in &self.files {
            for target in &file.internal {
                out.push_str(&format!("    {} -> {};\n", quote(&file.path), quote(target)));
            }
            for import in &file.external {
                external.insert(import.clone());
                out.push_str(&format!(
                    "    {} -> {} [style=dashed];\n",
                    quote(&file.path),
                    quote(import)
                ));
            }
        }
        for module in external {
            out.push_str(&format!("    {} [shape=ellipse, style=dashed];\n", quote(&module)));
        }
        out.push_str("}\n");
        out
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn extension(path: &str) -> &str {
    path.rsplit_once('.').map_or("", |(_, ext)| ext)
}

fn dir_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn join(dir: &str, rest: &str) -> String {
    if dir.is_empty() {
        rest.to_string()
    } else {
        format!("{dir}/{rest}")
    }
}

struct Patterns {
    py_import: Regex,
    py_from: Regex,
    rs_use: Regex,
    rs_mod: Regex,
    js_from: Regex,
    js_require: Regex,
    go_single: Regex,
    go_quoted: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let re = |p: &str| Regex::new(p).ok();
            Some(Patterns {
                py_import: re(r"^\s*import\s+([\w.]+(?:\s+as\s+\w+)?(?:\s*,\s*[\w.]+(?:\s+as\s+\w+)?)*)")?,
                py_from: re(r"^\s*from\s+(\.*[\w.]*)\s+import\s")?,
                rs_use: re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+((?:::)?\w+(?:::\w+)*)")?,
                rs_mod: re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)\s*;")?,
                js_from: re(r#"^\s*(?:import|export)\b[^'"]*?\bfrom\s+['"]([^'"]+)['"]|^\s*import\s+['"]([^'"]+)['"]"#)?,
                js_require: re(r#"\brequire\(\s*['"]([^'"]+)['"]\s*\)"#)?,
                go_single: re(r#"^\s*import\s+(?:\w+\s+)?"([^"]+)""#)?,
                go_quoted: re(r#"^\s*(?:\w+\s+)?"([^"]+)"\s*$"#)?,
            })
        })
        .as_ref()
}

/// Module names imported by one file, sorted and deduplicated.
pub fn extract_imports(path: &str, text: &str) -> Vec<String> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    let mut found = BTreeSet::new();
    match extension(path) {
        "py" | "pyi" => {
            for line in text.lines() {
                if let Some(caps) = p.py_from.captures(line) {
                    found.insert(caps[1].to_string());
                } else if let Some(caps) = p.py_import.captures(line) {
                    for part in caps[1].split(',') {
                        if let Some(name) = part.split_whitespace().next() {
                            found.insert(name.to_string());
                        }
                    }
                }
            }
        }
        "rs" => {
            for line in text.lines() {
                if let Some(caps) = p.rs_mod.captures(line) {
                    found.insert(format!("self::{}", &caps[1]));
                } else if let Some(caps) = p.rs_use.captures(line) {
                    found.insert(caps[1].trim_start_matches("::").to_string());
                }
            }
        }
        "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "mts" | "cts" => {
            for line in text.lines() {
                if let Some(caps) = p.js_from.captures(line) {
                    if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                        found.insert(m.as_str().to_string());
                    }
                }
                for caps in p.js_require.captures_iter(line) {
                    found.insert(caps[1].to_string());
                }
            }
        }
        "go" => {
            let mut in_block = false;
            for line in text.lines() {
                let trimmed = line.trim();
                if in_block {
                    if trimmed.starts_with(')') {
                        in_block = false;
                    } else if let Some(caps) = p.go_quoted.captures(line) {
                        found.insert(caps[1].to_string());
                    }
                } else if trimmed.starts_with("import (") || trimmed == "import(" {
                    in_block = true;
                } else if let Some(caps) = p.go_single.captures(line) {
                    found.insert(caps[1].to_string());
                }
            }
        }
        _ => {}
    }
    found.into_iter().collect()
}

/// The file of `paths` that `import`, written in `from`, refers to.
pub fn resolve_import(from: &str, import: &str, paths: &BTreeSet<&str>) -> Option<String> {
    let candidates = match extension(from) {
        "py" | "pyi" => python_candidates(from, import),
        "rs" => rust_candidates(from, import),
        "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "mts" | "cts" => js_candidates(from, import),
        _ => Vec::new(),
    };
    for candidate in &candidates {
        if paths.contains(candidate.as_str()) {
            return Some(candidate.clone());
        }
    }
    // Absolute Python imports are rooted at a package directory somewhere
    // below the resource root.
    if matches!(extension(from), "py" | "pyi") && !import.starts_with('.') {
        for candidate in &candidates {
            let suffix = format!("/{candidate}");
            if let Some(found) = paths.iter().find(|p| p.ends_with(&suffix)) {
                return Some(found.to_string());
            }
        }
    }
    None
}

fn python_candidates(from: &str, import: &str) -> Vec<String> {
    let dots = import.chars().take_while(|c| *c == '.').count();
    let rest = import[dots..].replace('.', "/");
    let base = if dots == 0 {
        String::new()
    } else {
        let mut dir = dir_of(from).to_string();
        for _ in 1..dots {
            dir = dir_of(&dir).to_string();
        }
        dir
    };
    let stem = match (base.is_empty(), rest.is_empty()) {
        (_, true) => base,
        (true, false) => rest,
        (false, false) => format!("{base}/{rest}"),
    };
    if stem.is_empty() {
        return vec!["__init__.py".to_string()];
    }
    vec![format!("{stem}.py"), format!("{stem}/__init__.py")]
}

/// Directory holding the children of the module defined by `from`.
fn rust_module_dir(from: &str) -> String {
    let dir = dir_of(from);
    let file = from.rsplit('/').next().unwrap_or(from);
    match file {
        "mod.rs" | "lib.rs" | "main.rs" => dir.to_string(),
        _ => join(dir, file.trim_end_matches(".rs")),
    }
}

/// Nearest enclosing `src` directory, the crate root for `crate::` paths.
fn rust_crate_root(from: &str) -> String {
    let mut dir = dir_of(from);
    loop {
        if dir == "src" || dir.ends_with("/src") {
            return dir.to_string();
        }
        match dir.rsplit_once('/') {
            Some((parent, _)) => dir = parent,
            None => return String::new(),
        }
    }
}

fn rust_candidates(from: &str, import: &str) -> Vec<String> {
    let mut segments: Vec<&str> = import.split("::").collect();
    let base = match segments.first().copied() {
        Some("self") => rust_module_dir(from),
        Some("crate") => rust_crate_root(from),
        Some("super") => dir_of(&rust_module_dir(from)).to_string(),
        _ => return Vec::new(),
    };
    segments.remove(0);

    // Longest module path first: `crate::a::b::Item` tries `a/b` then `a`.
    let mut candidates = Vec::new();
    for len in (1..=segments.len()).rev() {
        let stem = join(&base, &segments[..len].join("/"));
        candidates.push(format!("{stem}.rs"));
        candidates.push(format!("{stem}/mod.rs"));
    }
    candidates
}

fn js_candidates(from: &str, import: &str) -> Vec<String> {
    if !(import.starts_with("./") || import.starts_with("../")) {
        return Vec::new();
    }
    let mut parts: Vec<&str> = dir_of(from).split('/').filter(|s| !s.is_empty()).collect();
    for segment in import.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                if parts.pop().is_none() {
                    return Vec::new();
                }
            }
            other => parts.push(other),
        }
    }
    let stem = parts.join("/");
    let mut candidates = vec![stem.clone()];
    for ext in ["ts", "tsx", "js", "jsx", "mjs"] {
        candidates.push(format!("{stem}.{ext}"));
    }
    for ext in ["ts", "js"] {
        candidates.push(format!("{stem}/index.{ext}"));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, t)| (p.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_python_imports() {
        let text = "import os, sys as system\nfrom . import util\nfrom .core import retry\nfrom pkg.sub import x\n    import json\n# import nothing\n";
        assert_eq!(
            extract_imports("pkg/main.py", text),
            vec![".", ".core", "json", "os", "pkg.sub", "sys"]
        );
    }

    #[test]
    fn test_rust_imports() {
        let text = "mod lexer;\npub mod parser;\nuse std::collections::HashMap;\nuse crate::lexer::{Token, Lexer};\npub(crate) use super::ast::Expr;\nmod tests {\n";
        assert_eq!(
            extract_imports("src/lib.rs", text),
            vec![
                "crate::lexer",
                "self::lexer",
                "self::parser",
                "std::collections::HashMap",
                "super::ast::Expr"
            ]
        );
    }

    #[test]
    fn test_js_and_go_imports() {
        let js = "import React from 'react';\nimport { a } from \"./util\";\nimport './styles.css';\nconst fs = require('fs');\nexport * from '../shared/index';\n";
        assert_eq!(
            extract_imports("web/src/app.tsx", js),
            vec!["../shared/index", "./styles.css", "./util", "fs", "react"]
        );

        let go = "package main\n\nimport \"fmt\"\nimport (\n    \"os\"\n    log \"github.com/x/log\"\n)\n";
        assert_eq!(extract_imports("main.go", go), vec!["fmt", "github.com/x/log", "os"]);
    }

    #[test]
    fn test_unknown_language_has_no_imports() {
        assert!(extract_imports("README.md", "import x\nuse y;\n").is_empty());
    }

    #[test]
    fn test_build_resolves_internal_edges() {
        let graph = ImportGraph::build(&files(&[
            ("src/lib.rs", "mod lexer;\nmod parser;\nuse std::fmt;\n"),
            ("src/lexer.rs", "pub struct Token;\n"),
            ("src/parser.rs", "use crate::lexer::Token;\nuse super::missing;\n"),
            ("httpkit/__init__.py", "from .core import retry\n"),
            ("httpkit/core.py", "import httpkit.sub.headers\nimport requests\n"),
            ("httpkit/sub/headers.py", "from .. import core\n"),
            ("web/app.ts", "import { x } from './lib/x';\n"),
            ("web/lib/x.ts", "export const x = 1;\n"),
        ]));

        let by_path: BTreeMap<&str, &FileImports> =
            graph.files.iter().map(|f| (f.path.as_str(), f)).collect();
        assert_eq!(by_path["src/lib.rs"].internal, vec!["src/lexer.rs", "src/parser.rs"]);
        assert_eq!(by_path["src/parser.rs"].internal, vec!["src/lexer.rs"]);
        assert!(by_path["src/lexer.rs"].internal.is_empty());
        assert_eq!(by_path["src/parser.rs"].external, vec!["super::missing"]);
        assert_eq!(by_path["httpkit/core.py"].external, vec!["requests"]);
        assert_eq!(by_path["httpkit/__init__.py"].internal, vec!["httpkit/core.py"]);
        assert_eq!(by_path["httpkit/core.py"].internal, vec!["httpkit/sub/headers.py"]);
        assert_eq!(by_path["httpkit/sub/headers.py"].internal, vec!["httpkit/__init__.py"]);
        assert_eq!(by_path["web/app.ts"].internal, vec!["web/lib/x.ts"]);
        assert_eq!(graph.edge_count(), 7);
    }

    #[test]
    fn test_to_dot() {
        let graph = ImportGraph::build(&files(&[
            ("a.py", "import b\nimport os\n"),
            ("b.py", ""),
        ]));
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph imports {"));
        assert!(dot.contains("\"a.py\" -> \"b.py\";"));
        assert!(dot.contains("\"a.py\" -> \"os\" [style=dashed];"));
        assert!(!dot.contains("\"a.py\" -> \"b\" [style=dashed]"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
