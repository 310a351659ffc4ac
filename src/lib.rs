//! # forcewatch
//!
//! Tracks "forced" bits on industrial controllers: signals an operator has manually
//! overridden.
//!
//! ## Overview
//!
//! Each controller periodically yields one raw dump per resource. forcewatch decodes those dumps,
//! enriches every entry with naming and type metadata from the controller's reference store,
//! decodes the raw hex values by declared type, and reconciles the result into a persistent
//! force store that knows which bits are forced *right now* and keeps the full history of
//! forcing and deforcing episodes with operator-supplied reasons.
//!
//! ## Architecture
//!
//! Leaf-first:
//!
//! - **[`codec`]**: dump parsing ([`codec::DumpParser`]), identifier decoding
//!   ([`codec::CanonicalName`]) and typed value decoding ([`codec::decode`])
//! - **[`metadata`]**: chunked `IN (...)` lookups against the reference store
//!   ([`metadata::MetadataMatcher`], [`metadata::MetadataSource`])
//! - **[`reconcile`]**: the per-scope Active/Inactive diff ([`reconcile::plan`])
//! - **[`db`]**: the SQLite force store ([`db::DbConnection`]) applying diffs atomically
//! - **[`scopes`]**: per-scope locks and removal of scopes dropped from the configuration
//! - **[`transport`]**: getting dumps into the local cache ([`transport::DumpTransport`])
//! - **[`pipeline`]**: [`pipeline::ForcePipeline`], tying the above into one cycle
//! - **[`commands`]**: read/annotate interface for front ends
//!
//! A *scope* is one `(controller, resource)` pair: one dump file, one reconciliation unit.
//! Scopes are processed independently and concurrently, but never two batches of the same
//! scope at once.
//!
//! ## Error policy
//!
//! One bad row never blocks a batch. Undecodable identifiers pass through and match nothing,
//! undecodable values are kept as [`codec::DecodedValue::Invalid`], and a failed metadata
//! chunk is skipped and counted. Only store and transport failures surface as
//! [`ForceError`], failing the scope's batch without touching its persisted state.
//!
//! ## Features
//!
//! - **default**: the library
//! - **bin**: the `forcewatch` command-line tool

pub mod codec;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod metadata;
pub mod pipeline;
pub mod properties;
pub mod reconcile;
pub mod scopes;
pub mod transport;

pub use error::*;
