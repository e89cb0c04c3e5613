//! Remote archive discovery and report payload decoding for compatdb.

pub mod listing;
pub mod payload;

pub use listing::{ArchiveSelector, GitHubTreeLister, ListError, RemoteLister, Selection};
pub use payload::{parse_payload, ParseError};

pub const CRATE_NAME: &str = "compatdb-adapters";
