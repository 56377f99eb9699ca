//! Inbound mail: webhook ingestion, extraction, threading and replies.

pub mod config;
pub mod conversation;
pub mod error;
pub mod ingest;
pub mod queue;
pub mod responder;
pub mod store;
pub mod webhook;
