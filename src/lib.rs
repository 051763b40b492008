//! Boxfeed - a self-hosted news client
//!
//! Sources are grouped into colored boxes. Articles come from a remote news
//! API as an NDJSON stream, are cached per source, and are shown in a single
//! merged grid. An AI endpoint on the same API writes social posts about them.

pub mod ai;
pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod loader;
pub mod ndjson;
pub mod news;
pub mod routes;

#[cfg(test)]
mod test_support;
