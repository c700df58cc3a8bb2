//! ftserver library
//!
//! TCP ingest of instrument files: framed announcements followed by raw
//! payloads, a single serialized disk writer, rotating storage volumes with
//! age-based eviction, and completion notices to one downstream consumer.

pub mod cli;
pub mod config;
pub mod downstream;
pub mod error;
pub mod eviction;
pub mod logger;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod receiver;
pub mod registrar;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod storage;
pub mod transfer;
pub mod writer;
