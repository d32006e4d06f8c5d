//! # Resource Index
//!
//! A local-first indexing and retrieval engine for code and documentation.
//!
//! Resources (git repositories, documentation sites, and registry packages)
//! are registered once and indexed in the background. Each successful job
//! commits a new immutable *generation*: a chunk manifest in SQLite plus a
//! sealed vector segment. Queries always read one committed generation, so
//! re-indexing never disturbs readers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Sources   │──▶│ Scheduler │──▶│   Pipeline   │──▶│ SQLite +     │
//! │ repo/docs/  │   │ 1 job per │   │ diff, chunk, │   │ vector       │
//! │ package     │   │ resource  │   │ embed, commit│   │ segments     │
//! └─────────────┘   └───────────┘   └──────────────┘   └──────┬───────┘
//!                                                             │
//!                                     ┌───────────────────────┤
//!                                     ▼                       ▼
//!                               ┌──────────┐           ┌─────────────┐
//!                               │  Query   │           │ Package     │
//!                               │ (hybrid) │           │ grep / read │
//!                               └──────────┘           └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rix init
//! rix index repo https://github.com/serde-rs/serde
//! rix search "custom deserializer"
//! rix package grep pypi requests "def request"
//! rix graph <resource-id> --dot
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Public facade over everything below |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Engine error type |
//! | [`registry`] | Resource catalog and lifecycle transitions |
//! | [`jobs`] | Persisted job history |
//! | [`scheduler`] | Job queue, worker pool, cancellation |
//! | [`pipeline`] | Fetch, diff, chunk, embed, commit |
//! | [`sources`] | Repository, documentation, and package fetchers |
//! | [`packages`] | Package resolution and ad-hoc package search |
//! | [`providers`] | Embedding providers and retry policy |
//! | [`cas`] | Content-addressed chunk texts and embeddings |
//! | [`segments`] | On-disk vector segments |
//! | [`query`] | Hybrid search over committed generations |
//! | [`inspect`] | Stored file text and import graphs |
//! | [`progress`] | Job progress reporting for the CLI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod cas;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod jobs;
pub mod logging;
pub mod migrate;
pub mod packages;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod segments;
pub mod sources;

pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
