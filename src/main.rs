//! # rix
//!
//! Command-line front end of the resource index.
//!
//! ```bash
//! rix index repo https://github.com/tokio-rs/tokio --ref master
//! rix index docs https://docs.rs/serde/latest/serde/ --max-depth 2
//! rix index package pypi requests --version 2.32.3
//! rix search "retry with backoff" --limit 5
//! rix search "derive attribute" --docs
//! rix list --kind repository
//! rix package grep npm left-pad "function" --mode count
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rix init` | Create the working directory and catalog |
//! | `rix index repo\|docs\|package` | Register a resource and index it |
//! | `rix reindex <id>` | Index a known resource again |
//! | `rix search <query>` | Hybrid search over indexed resources |
//! | `rix status`, `rix list` | Inspect resources |
//! | `rix rename`, `rix delete` | Manage resources |
//! | `rix source <id> [path]` | List indexed files or print one |
//! | `rix graph <id>` | Import graph of a code resource |
//! | `rix job`, `rix cancel` | Inspect and cancel jobs |
//! | `rix package grep\|hybrid\|read` | Search a package without indexing it |
//! | `rix server-status`, `rix gc`, `rix purge` | Maintenance |
//!
//! Every command accepts `--json` for machine-readable output on stdout.
//! Job progress is written to stderr.

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use resource_index::config::{self, Config};
use resource_index::engine::{Engine, IndexReceipt, ResourceStatus};
use resource_index::logging::init_tracing;
use resource_index::packages::tools::{GrepOutput, GrepOutputMode};
use resource_index::progress::{self, ProgressMode};
use resource_index::query::SearchRequest;
use resource_index_core::models::{
    CrawlOptions, IndexJob, JobState, PackageRegistry, ResourceKind, SearchHit,
};

const DEFAULT_CONFIG: &str = "./rix.toml";

/// Index repositories, documentation sites, and packages, then search them
/// with combined keyword and semantic retrieval.
#[derive(Parser)]
#[command(name = "rix", version)]
struct Cli {
    /// Path to the configuration file (TOML). A missing default file means
    /// built-in defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Working directory for the catalog, segments, and caches. Overrides
    /// `storage.dir`.
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Job progress on stderr. Defaults to `human` on a terminal, `off`
    /// otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the working directory and catalog. Idempotent.
    Init,

    /// Register a resource and index it, following the job to completion.
    Index {
        #[command(subcommand)]
        target: IndexTarget,

        /// Give up following the job after this many seconds.
        #[arg(long, global = true)]
        timeout: Option<u64>,
    },

    /// Index a known resource again.
    Reindex {
        resource_id: String,

        /// Ignore the previous generation and re-chunk every file.
        #[arg(long)]
        full: bool,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Search indexed resources.
    Search {
        query: String,

        /// Search documentation resources instead of code.
        #[arg(long)]
        docs: bool,

        /// Restrict to these resource ids. Repeatable.
        #[arg(long = "resource")]
        resources: Vec<String>,

        /// Regex for lexical matching instead of the query terms.
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one resource, by id or by kind and name.
    Status {
        resource_id: Option<String>,

        #[arg(long, requires = "name")]
        kind: Option<ResourceKind>,

        #[arg(long, requires = "kind")]
        name: Option<String>,
    },

    /// List resources.
    List {
        #[arg(long)]
        kind: Option<ResourceKind>,
    },

    /// Give a resource a new display name.
    Rename { resource_id: String, name: String },

    /// Delete a resource and everything indexed for it.
    Delete { resource_id: String },

    /// List the files of a resource's current index, or print one of them.
    Source {
        resource_id: String,
        path: Option<String>,
    },

    /// Show the import graph of a repository or package resource.
    Graph {
        resource_id: String,

        /// Print Graphviz DOT instead of an edge list.
        #[arg(long)]
        dot: bool,
    },

    /// Show a job, optionally waiting for it to finish.
    Job {
        job_id: String,

        #[arg(long)]
        wait: bool,
    },

    /// Cancel a pending or running job.
    Cancel { job_id: String },

    /// Search a package without registering it.
    Package {
        #[command(subcommand)]
        action: PackageAction,
    },

    /// Engine and catalog summary.
    ServerStatus,

    /// Remove unreferenced chunk texts, embeddings, and segments.
    Gc,

    /// Delete every resource and cached artifact.
    Purge {
        /// Required; purging cannot be undone.
        #[arg(long)]
        yes: bool,
    },

    /// Print a shell completion script.
    Completions { shell: clap_complete::Shell },
}

#[derive(Subcommand)]
enum IndexTarget {
    /// A git URL or a local directory.
    Repo {
        url: String,

        /// Branch or tag to clone.
        #[arg(long = "ref")]
        git_ref: Option<String>,
    },

    /// A documentation site, crawled from `url`.
    Docs {
        url: String,

        /// Only index pages whose URL matches. Repeatable glob.
        #[arg(long = "url-pattern")]
        url_patterns: Vec<String>,

        /// Neither index nor follow pages whose URL matches. Repeatable glob.
        #[arg(long = "exclude-pattern")]
        exclude_patterns: Vec<String>,

        #[arg(long)]
        max_depth: Option<usize>,

        #[arg(long)]
        max_pages: Option<usize>,

        /// Keep only `<main>` / `<article>` content.
        #[arg(long)]
        main_only: bool,
    },

    /// A package from a registry or the local environment.
    Package {
        registry: PackageRegistry,
        name: String,

        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Subcommand)]
enum PackageAction {
    /// Regex search over the package files.
    Grep {
        registry: PackageRegistry,
        name: String,
        pattern: String,

        #[arg(long)]
        version: Option<String>,

        /// `content`, `files_with_matches`, or `count`.
        #[arg(long, default_value = "content")]
        mode: GrepOutputMode,
    },

    /// Hybrid search over a throwaway index of the package.
    Hybrid {
        registry: PackageRegistry,
        name: String,

        #[arg(required_unless_present = "pattern")]
        queries: Vec<String>,

        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        version: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print a line range of one package file.
    Read {
        registry: PackageRegistry,
        name: String,
        file: String,

        #[arg(long, default_value_t = 1)]
        start: usize,

        #[arg(long)]
        end: Option<usize>,

        #[arg(long)]
        version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't need the engine
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "rix", &mut std::io::stdout());
        return Ok(());
    }
    if let Commands::Purge { yes: false } = &cli.command {
        bail!("purge deletes every resource; pass --yes to confirm");
    }

    let mut cfg = if cli.config.exists() || cli.config != PathBuf::from(DEFAULT_CONFIG) {
        config::load_config(&cli.config)?
    } else {
        Config::default()
    };
    if let Some(dir) = &cli.workdir {
        cfg.storage.dir = dir.clone();
    }
    init_tracing(&cfg.logging.level);

    let job_timeout = Duration::from_secs(cfg.jobs.job_timeout_secs);
    let reporter = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();
    let engine = Engine::open(cfg).await?;
    let json = cli.json;

    let outcome = run(&engine, cli.command, json, reporter.as_ref(), job_timeout).await;
    engine.shutdown(Duration::from_secs(5)).await;
    outcome
}

async fn run(
    engine: &Engine,
    command: Commands,
    json: bool,
    reporter: &dyn progress::JobProgressReporter,
    job_timeout: Duration,
) -> Result<()> {
    match command {
        Commands::Init => {
            let status = engine.server_status().await?;
            if json {
                print_json(&status)?;
            } else {
                println!("Initialized {}", status.workdir.display());
            }
        }
        Commands::Index { target, timeout } => {
            let receipt = match target {
                IndexTarget::Repo { url, git_ref } => {
                    engine.index_repository(&url, git_ref.as_deref()).await?
                }
                IndexTarget::Docs {
                    url,
                    url_patterns,
                    exclude_patterns,
                    max_depth,
                    max_pages,
                    main_only,
                } => {
                    let crawl = CrawlOptions {
                        url_patterns,
                        exclude_patterns,
                        max_depth,
                        max_pages,
                        only_main_content: main_only,
                    };
                    engine.index_documentation(&url, crawl).await?
                }
                IndexTarget::Package {
                    registry,
                    name,
                    version,
                } => {
                    engine
                        .index_package(registry, &name, version.as_deref())
                        .await?
                }
            };
            let limit = timeout.map(Duration::from_secs).unwrap_or(job_timeout);
            let job = progress::follow(engine, &receipt.job_id, reporter, limit).await?;
            report_index(&receipt, &job, json)?;
        }
        Commands::Reindex {
            resource_id,
            full,
            timeout,
        } => {
            let job_id = engine.reindex(&resource_id, full).await?;
            let limit = timeout.map(Duration::from_secs).unwrap_or(job_timeout);
            let job = progress::follow(engine, &job_id, reporter, limit).await?;
            print_job(&job, json)?;
            if job.state == JobState::Failed {
                bail!("job {} failed", job.job_id);
            }
        }
        Commands::Search {
            query,
            docs,
            resources,
            pattern,
            limit,
        } => {
            let mut request = SearchRequest::new(query).resources(resources);
            request.top_k = limit;
            request.pattern = pattern;
            let hits = if docs {
                engine.search_documentation(&request).await?
            } else {
                engine.search_codebase(&request).await?
            };
            if json {
                print_json(&hits)?;
            } else {
                print_hits(engine, &hits).await?;
            }
        }
        Commands::Status {
            resource_id,
            kind,
            name,
        } => {
            let status = match (resource_id, kind, name) {
                (Some(id), _, _) => engine.resource_status(&id).await?,
                (None, Some(kind), Some(name)) => engine.check_resource_status(kind, &name).await?,
                _ => bail!("pass a resource id, or --kind and --name"),
            };
            if json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }
        Commands::List { kind } => {
            let resources = engine.list_resources(kind).await?;
            if json {
                print_json(&resources)?;
            } else if resources.is_empty() {
                println!("No resources.");
            } else {
                println!("{:<36}  {:<13}  {:<13}  {:>4}  NAME", "ID", "KIND", "STATE", "GEN");
                for r in &resources {
                    println!(
                        "{:<36}  {:<13}  {:<13}  {:>4}  {}",
                        r.id,
                        r.kind.as_str(),
                        r.state.as_str(),
                        r.current_generation.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
                        r.display_name
                    );
                }
            }
        }
        Commands::Rename { resource_id, name } => {
            let resource = engine.rename_resource(&resource_id, &name).await?;
            if json {
                print_json(&resource)?;
            } else {
                println!("Renamed {} to '{}'", resource.id, resource.display_name);
            }
        }
        Commands::Delete { resource_id } => {
            engine.delete_resource(&resource_id).await?;
            if json {
                print_json(&serde_json::json!({ "deleted": resource_id }))?;
            } else {
                println!("Deleted {}", resource_id);
            }
        }
        Commands::Source { resource_id, path } => match path {
            Some(path) => {
                let content = engine.read_source_content(&resource_id, &path).await?;
                if json {
                    print_json(&content)?;
                } else {
                    println!("{}", content.text);
                }
            }
            None => {
                let files = engine.list_source_files(&resource_id).await?;
                if json {
                    print_json(&files)?;
                } else {
                    for f in &files {
                        println!("{:>6} lines  {:>4} chunks  {}", f.lines, f.chunks, f.path);
                    }
                }
            }
        },
        Commands::Graph { resource_id, dot } => {
            let graph = engine.visualize_codebase(&resource_id).await?;
            if json {
                print_json(&graph)?;
            } else if dot {
                print!("{}", graph.graph.to_dot());
            } else {
                println!(
                    "generation {}: {} files, {} internal edges",
                    graph.generation,
                    graph.graph.files.len(),
                    graph.edges
                );
                for file in &graph.graph.files {
                    for target in &file.internal {
                        println!("{} -> {}", file.path, target);
                    }
                    if !file.external.is_empty() {
                        println!("{} uses {}", file.path, file.external.join(", "));
                    }
                }
            }
        }
        Commands::Job { job_id, wait } => {
            let job = if wait {
                progress::follow(engine, &job_id, reporter, job_timeout).await?
            } else {
                engine.job_status(&job_id).await?
            };
            print_job(&job, json)?;
        }
        Commands::Cancel { job_id } => {
            engine.cancel_job(&job_id).await?;
            if json {
                print_json(&serde_json::json!({ "cancelled": job_id }))?;
            } else {
                println!("Cancellation requested for job {}", job_id);
            }
        }
        Commands::Package { action } => run_package(engine, action, json).await?,
        Commands::ServerStatus => {
            let status = engine.server_status().await?;
            if json {
                print_json(&status)?;
            } else {
                println!("version:     {}", status.version);
                println!("workdir:     {}", status.workdir.display());
                println!("resources:   {}", status.resources);
                println!("active jobs: {}", status.active_jobs);
                println!(
                    "embedding:   {} / {} ({} dims)",
                    status.embedding_provider, status.embedding_model, status.embedding_dims
                );
            }
        }
        Commands::Gc => {
            let report = engine.collect_garbage().await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Removed {} chunk texts, {} embeddings, {} segment directories",
                    report.chunk_texts_removed,
                    report.embeddings_removed,
                    report.segment_dirs_removed
                );
            }
        }
        Commands::Purge { .. } => {
            let report = engine.purge().await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Purged {} resources", report.resources_removed);
            }
        }
        Commands::Completions { .. } => {
            // Handled above (before the engine is opened)
        }
    }
    Ok(())
}

async fn run_package(engine: &Engine, action: PackageAction, json: bool) -> Result<()> {
    match action {
        PackageAction::Grep {
            registry,
            name,
            pattern,
            version,
            mode,
        } => {
            let out = engine
                .package_search_grep(registry, &name, version.as_deref(), &pattern, mode)
                .await?;
            if json {
                return print_json(&out);
            }
            match out {
                GrepOutput::Content { matches, truncated } => {
                    if matches.is_empty() {
                        println!("No matches.");
                    }
                    for m in &matches {
                        println!("{}:{}: {}", m.path, m.line_number, m.line);
                    }
                    if truncated {
                        println!("(output truncated)");
                    }
                }
                GrepOutput::FilesWithMatches { files } => {
                    for f in &files {
                        println!("{}", f);
                    }
                }
                GrepOutput::Count { counts, total } => {
                    for c in &counts {
                        println!("{}: {}", c.path, c.count);
                    }
                    println!("total: {}", total);
                }
            }
        }
        PackageAction::Hybrid {
            registry,
            name,
            queries,
            pattern,
            version,
            limit,
        } => {
            let hits = engine
                .package_search_hybrid(
                    registry,
                    &name,
                    version.as_deref(),
                    &queries,
                    pattern.as_deref(),
                    limit,
                )
                .await?;
            if json {
                return print_json(&hits);
            }
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                print_hit(i, hit, &hit.resource_id);
            }
        }
        PackageAction::Read {
            registry,
            name,
            file,
            start,
            end,
            version,
        } => {
            let slice = engine
                .package_search_read_file(registry, &name, version.as_deref(), &file, start, end)
                .await?;
            if json {
                return print_json(&slice);
            }
            for (offset, line) in slice.text.lines().enumerate() {
                println!("{:>6}  {}", slice.start_line + offset, line);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_index(receipt: &IndexReceipt, job: &IndexJob, json: bool) -> Result<()> {
    if json {
        print_json(&serde_json::json!({ "receipt": receipt, "job": job }))?;
    } else {
        println!(
            "{} '{}' ({})",
            if receipt.created { "Registered" } else { "Updated" },
            receipt.display_name,
            receipt.resource_id
        );
        print_job(job, false)?;
    }
    if job.state == JobState::Failed {
        bail!(
            "indexing failed: {}",
            job.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_job(job: &IndexJob, json: bool) -> Result<()> {
    if json {
        return print_json(job);
    }
    let p = &job.progress;
    println!("job {}  {}", job.job_id, job.state.as_str());
    println!(
        "    files: {} seen, {} changed, {} unchanged, {} removed",
        p.files_seen, p.files_changed, p.files_unchanged, p.files_removed
    );
    println!(
        "    chunks: {} new, {} reused; {} embeddings computed",
        p.chunks_written, p.chunks_reused, p.embeddings_computed
    );
    for warning in &p.warnings {
        println!("    warning: {}", warning);
    }
    if let Some(error) = &job.error {
        println!("    error: {}", error);
    }
    Ok(())
}

fn print_status(status: &ResourceStatus) {
    let r = &status.resource;
    println!("id:         {}", r.id);
    println!("name:       {}", r.display_name);
    println!("kind:       {}", r.kind);
    println!("locator:    {}", r.source_locator);
    println!("state:      {}", r.state);
    if let Some(g) = &status.generation {
        println!(
            "generation: {} ({} chunks, {} files, {})",
            g.generation,
            g.chunk_count,
            g.file_count,
            g.committed_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(rev) = &g.revision {
            println!("revision:   {}", rev);
        }
    }
    if let Some(error) = &r.last_error {
        println!("last error: {}", error);
    }
    if let Some(job) = &status.latest_job {
        println!("latest job: {} ({})", job.job_id, job.state);
    }
}

async fn print_hits(engine: &Engine, hits: &[SearchHit]) -> Result<()> {
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    let names: HashMap<String, String> = engine
        .list_resources(None)
        .await?
        .into_iter()
        .map(|r| (r.id, r.display_name))
        .collect();
    for (i, hit) in hits.iter().enumerate() {
        let name = names.get(&hit.resource_id).unwrap_or(&hit.resource_id);
        print_hit(i, hit, name);
    }
    Ok(())
}

fn print_hit(i: usize, hit: &SearchHit, resource: &str) {
    println!(
        "{}. [{:.2}] {} / {}:{}-{} ({:?})",
        i + 1,
        hit.score,
        resource,
        hit.source_path,
        hit.span.start_line,
        hit.span.end_line,
        hit.match_kind
    );
    let excerpt: String = hit.text.chars().take(200).collect();
    println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
    println!();
}
