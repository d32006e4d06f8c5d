use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rix_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rix");
    path
}

fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let repo = root.join("compiler");
    fs::create_dir_all(repo.join("src")).unwrap();
    fs::write(
        repo.join("src/lexer.rs"),
        "pub fn tokenize_input(input: &str) -> Vec<String> {\n    input.split_whitespace().map(String::from).collect()\n}\n",
    )
    .unwrap();
    fs::write(
        repo.join("README.md"),
        "# Toy compiler\n\nNotes about deployment and infrastructure.\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
dir = "{}/work"

[retrieval]
final_limit = 5

[packages]
discover_site_packages = false
"#,
        root.display()
    );
    let config_path = root.join("rix.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, repo)
}

fn run_rix(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rix_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rix binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_catalog() {
    let (tmp, config, _) = setup_test_env();
    let (stdout, stderr, ok) = run_rix(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Initialized"));
    assert!(tmp.path().join("work/index.sqlite").exists());

    // Idempotent
    let (_, stderr, ok) = run_rix(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_index_and_search() {
    let (_tmp, config, repo) = setup_test_env();
    let (stdout, stderr, ok) = run_rix(&config, &["index", "repo", repo.to_str().unwrap()]);
    assert!(ok, "index failed: {}", stderr);
    assert!(stdout.contains("Registered 'compiler'"));
    assert!(stdout.contains("succeeded"));

    let (stdout, stderr, ok) = run_rix(&config, &["search", "tokenize_input"]);
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.starts_with("1. ["), "unexpected output: {}", stdout);
    assert!(stdout.contains("compiler / src/lexer.rs"));

    let (stdout, _, ok) = run_rix(&config, &["search", "tokenize_input", "--docs"]);
    assert!(ok);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_json_is_deterministic() {
    let (_tmp, config, repo) = setup_test_env();
    let (_, stderr, ok) = run_rix(&config, &["index", "repo", repo.to_str().unwrap()]);
    assert!(ok, "index failed: {}", stderr);

    let (first, _, ok) = run_rix(&config, &["--json", "search", "deployment infrastructure"]);
    assert!(ok);
    let (second, _, _) = run_rix(&config, &["--json", "search", "deployment infrastructure"]);
    assert_eq!(first, second);

    let hits: serde_json::Value = serde_json::from_str(&first).unwrap();
    let hits = hits.as_array().unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["source_path"], "README.md");
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config, _) = setup_test_env();
    let (_, stderr, ok) = run_rix(&config, &["search", "  "]);
    assert!(!ok);
    assert!(stderr.contains("query cannot be empty"));
}

#[test]
fn test_list_status_rename_delete() {
    let (_tmp, config, repo) = setup_test_env();
    let (_, stderr, ok) = run_rix(&config, &["index", "repo", repo.to_str().unwrap()]);
    assert!(ok, "index failed: {}", stderr);

    let (stdout, _, ok) = run_rix(&config, &["--json", "list"]);
    assert!(ok);
    let list: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let id = list[0]["id"].as_str().unwrap().to_string();
    assert_eq!(list[0]["display_name"], "compiler");
    assert_eq!(list[0]["state"], "ready");

    let (stdout, _, ok) = run_rix(
        &config,
        &["status", "--kind", "repository", "--name", "compiler"],
    );
    assert!(ok);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("generation: 1"));

    let (stdout, stderr, ok) = run_rix(&config, &["rename", &id, "toy"]);
    assert!(ok, "rename failed: {}", stderr);
    assert!(stdout.contains("'toy'"));

    let (_, _, ok) = run_rix(&config, &["delete", &id]);
    assert!(ok);
    let (stdout, _, ok) = run_rix(&config, &["list"]);
    assert!(ok);
    assert!(stdout.contains("No resources."));

    let (_, stderr, ok) = run_rix(&config, &["status", &id]);
    assert!(!ok);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_reindex_reports_diff() {
    let (_tmp, config, repo) = setup_test_env();
    let (_, stderr, ok) = run_rix(&config, &["index", "repo", repo.to_str().unwrap()]);
    assert!(ok, "index failed: {}", stderr);
    let (stdout, _, _) = run_rix(&config, &["--json", "list"]);
    let list: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let id = list[0]["id"].as_str().unwrap().to_string();

    fs::write(repo.join("src/emit.rs"), "pub fn emit() {}\n").unwrap();
    let (stdout, stderr, ok) = run_rix(&config, &["--json", "reindex", &id]);
    assert!(ok, "reindex failed: {}", stderr);
    let job: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["diff"]["added"][0], "src/emit.rs");
    assert_eq!(job["progress"]["files_unchanged"], 2);
}

#[test]
fn test_source_and_graph() {
    let (_tmp, config, repo) = setup_test_env();
    fs::write(repo.join("src/lib.rs"), "pub mod lexer;\n").unwrap();
    let (_, stderr, ok) = run_rix(&config, &["index", "repo", repo.to_str().unwrap()]);
    assert!(ok, "index failed: {}", stderr);
    let (stdout, _, _) = run_rix(&config, &["--json", "list"]);
    let list: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let id = list[0]["id"].as_str().unwrap().to_string();

    let (stdout, stderr, ok) = run_rix(&config, &["source", &id]);
    assert!(ok, "source failed: {}", stderr);
    assert!(stdout.contains("src/lexer.rs"));
    assert!(stdout.contains("README.md"));

    let (stdout, _, ok) = run_rix(&config, &["source", &id, "src/lexer.rs"]);
    assert!(ok);
    assert_eq!(stdout, fs::read_to_string(repo.join("src/lexer.rs")).unwrap());

    let (_, stderr, ok) = run_rix(&config, &["source", &id, "src/nope.rs"]);
    assert!(!ok);
    assert!(stderr.contains("not found"));

    let (stdout, _, ok) = run_rix(&config, &["graph", &id]);
    assert!(ok);
    assert!(stdout.contains("src/lib.rs -> src/lexer.rs"));

    let (stdout, _, ok) = run_rix(&config, &["graph", &id, "--dot"]);
    assert!(ok);
    assert!(stdout.starts_with("digraph"));
    assert!(stdout.contains("\"src/lib.rs\" -> \"src/lexer.rs\";"));
}

#[test]
fn test_index_missing_path_fails() {
    let (tmp, config, _) = setup_test_env();
    let missing = tmp.path().join("nope");
    let (_, stderr, ok) = run_rix(&config, &["index", "repo", missing.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn test_purge_requires_confirmation() {
    let (_tmp, config, repo) = setup_test_env();
    let (_, stderr, ok) = run_rix(&config, &["purge"]);
    assert!(!ok);
    assert!(stderr.contains("--yes"));

    let (_, _, ok) = run_rix(&config, &["index", "repo", repo.to_str().unwrap()]);
    assert!(ok);
    let (stdout, stderr, ok) = run_rix(&config, &["purge", "--yes"]);
    assert!(ok, "purge failed: {}", stderr);
    assert!(stdout.contains("Purged 1 resources"));
}

#[test]
fn test_gc_and_server_status() {
    let (_tmp, config, _) = setup_test_env();
    let (stdout, stderr, ok) = run_rix(&config, &["gc"]);
    assert!(ok, "gc failed: {}", stderr);
    assert!(stdout.contains("Removed 0 chunk texts"));

    let (stdout, _, ok) = run_rix(&config, &["--json", "server-status"]);
    assert!(ok);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["embedding_provider"], "hash");
    assert_eq!(status["resources"], 0);
}

#[test]
fn test_unknown_job() {
    let (_tmp, config, _) = setup_test_env();
    let (_, stderr, ok) = run_rix(&config, &["job", "does-not-exist"]);
    assert!(!ok);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_completions() {
    let (_tmp, config, _) = setup_test_env();
    let (stdout, _, ok) = run_rix(&config, &["completions", "bash"]);
    assert!(ok);
    assert!(stdout.contains("rix"));
}

#[test]
fn test_missing_explicit_config() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_rix(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}
