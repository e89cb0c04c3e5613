//! Archive download/extraction, HTTP fetch utilities and document persistence for compatdb.

pub mod archive;
pub mod http;
pub mod postgres;
pub mod store;

pub use archive::{
    extract_tar_gz, find_json_file, sha256_hex, ArchiveError, ArchiveFetcher, ExtractStats,
    FetchedArchive, TransientDir,
};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetch, HttpFetcher, RetryDisposition,
};
pub use postgres::PgDocumentStore;
pub use store::{DocumentStore, MemoryStore, StoreError};

pub const CRATE_NAME: &str = "compatdb-storage";
