//! # resource-index core
//!
//! Runtime-independent logic for the resource index: data models, chunkers,
//! incremental file diffing, the embedding trait and vector utilities, the
//! vector segment abstraction, hybrid ranking, and import graphs.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! `resource-index` application crate supplies the SQLite catalog, the
//! on-disk segment store, source fetchers, and embedding backends.

pub mod chunk;
pub mod diff;
pub mod embedding;
pub mod graph;
pub mod models;
pub mod search;
pub mod store;
