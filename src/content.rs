//! Outward-facing content plumbing: listing-page scraping that produces
//! candidate batches, and article retrieval with text extraction.

pub mod fetch;
pub mod listing;
