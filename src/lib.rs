//! carhive - used-car listing acquisition and search indexing.
//!
//! Drives a browser automation session across paginated listing pages,
//! recovers from anti-bot countermeasures (dialogs, content markers,
//! session invalidation) with bounded retry at item, page, and run scope,
//! and upserts merged listing+detail records into a search index.

pub mod browser;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod export;
pub mod index;
pub mod models;
pub mod site;
