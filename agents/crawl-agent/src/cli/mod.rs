//! Command line support
//!
//! Configuration shared by the `crawl-agent` binary and `crawlctl`.

pub mod config;
