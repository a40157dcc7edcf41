//! # panic-triage
//!
//! Crash-artifact triage: accept a device crash artifact (structured log,
//! free-form text dump, or a photograph of a panic screen), detect the
//! device model and crash signature, and return matching repair guidance
//! from a curated, language-partitioned Knowledge Base.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │   Artifact   │──▶│ Signature  │──▶│    Code    │──▶│  Solution  │
//! │ log/txt/img  │   │ Extractor  │   │  Resolver  │   │  Resolver  │
//! └──────────────┘   └────────────┘   └─────┬──────┘   └─────┬──────┘
//!        ▲                                  │                │
//!        │ gate (entry/exit)          ┌─────▼──────┐   ┌─────▼──────┐
//! ┌──────┴───────┐                    │ Inference  │   │ Knowledge  │
//! │   Attempt    │                    │   Client   │   │    Base    │
//! │   Limiter    │                    │ (retries)  │   │   (XLSX)   │
//! └──────────────┘                    └────────────┘   └────────────┘
//! ```
//!
//! A resolution request runs the pipeline left to right: the limiter gates
//! entry, extraction normalizes whatever the user sent, the resolver runs
//! inference stages only when the signature text does not already carry a
//! known code, and the solution resolver tiers the Knowledge Base answer
//! (condensed "mini" first, detailed "full" behind a flag).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`workbook`] | Positional XLSX reader |
//! | [`kb`] | Knowledge Base lookups and known-code snapshot |
//! | [`extract`] | Signature extraction strategies |
//! | [`inference`] | Chat backend + bounded retry engine |
//! | [`resolver`] | Multi-stage code resolution |
//! | [`solution`] | Mini/full solution tiering |
//! | [`limiter`] | Attempt-limiter state machine |
//! | [`history`] | Analysis history records |
//! | [`pipeline`] | Per-request orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod extract;
pub mod history;
pub mod inference;
pub mod kb;
pub mod limiter;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod resolver;
pub mod solution;
pub mod workbook;
