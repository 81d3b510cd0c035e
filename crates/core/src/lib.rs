//! Core types and shared functionality for rescache.
//!
//! This crate provides:
//! - The low-level resource cache ([`llcache`])
//! - Backing store contract with null, in-memory and SQLite implementations
//! - Fetch transport contract
//! - Unified error types
//! - Configuration structures

pub mod backing;
pub mod config;
pub mod error;
pub mod llcache;
pub mod transport;

pub use backing::{BackingStore, MemoryStore, NullStore, SqliteStore, StoreFlags, StoreParams};
pub use error::Error;
pub use llcache::{
    Cache, CacheEvent, CacheParams, Delivery, ErrorCode, FetchState, HandleCallback, HandleId, RetrieveFlags,
};
pub use transport::{CertChain, CertError, Certificate, FetchId, FetchMsg, FetchRequest, Fetcher, PostData};
