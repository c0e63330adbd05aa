//! Notice document source + tolerant field extraction.

mod extract;
mod source;

pub use extract::{extract_notice, parse_flexible_timestamp, ExtractError};
pub use source::{DocumentOrigin, DocumentSource, Documents, RawDocument, SourceError};

pub const CRATE_NAME: &str = "appalti-adapters";
