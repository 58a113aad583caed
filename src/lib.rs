//! # sitesnap
//!
//! A CLI utility that discovers the links on a seed page via a CSS
//! selector and saves each linked page as a self-contained HTML file:
//! stylesheet rules are inlined into a `<style>` block and images are
//! embedded as base64 data URIs, so the saved pages work offline.
//!
//! ## Usage
//!
//! ```bash
//! sitesnap https://example.org --path docs/ --selector 'a.doc-link' -o archive
//! ```

mod config;
mod crawler;
mod fetcher;
mod filename;

pub use config::CrawlConfig;
pub use crawler::{Crawler, LinkSet, RunSummary};
pub use fetcher::{FetchError, FetchedResource, ResourceFetcher};
pub use filename::derive_filename;
