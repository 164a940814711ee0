//! BioVault — autonomous clinical document processing agent.
//!
//! A single daemon: an HTTP intake boundary feeds a SQLite-backed document
//! queue, a background agent thread runs each document through extraction,
//! standardization, FHIR bundle building and deterministic safety validation,
//! and critical flags are escalated to a webhook.

pub mod agent;
pub mod alerts;
pub mod api;
pub mod config;
pub mod core_state;
pub mod db;
pub mod pipeline;
