//! Fetch transports for rescache.
//!
//! This crate provides the concrete transports the cache drives: HTTP(S)
//! over `reqwest`, `data:` URLs, and a router combining them, plus
//! normalisation of user-typed addresses for the CLI.

pub mod fetch;

pub use fetch::{DataFetcher, FetchConfig, HttpFetcher, SchemeRouter, UrlError, canonicalize};
