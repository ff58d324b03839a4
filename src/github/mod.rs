//! Remote query boundary
//!
//! Everything the pipeline knows about GitHub lives here: the record model,
//! the failure taxonomy, the `PageSource` seam and its GraphQL implementation.

mod client;
mod decode;
mod error;
mod model;

pub use client::{build_http_client, classify_status, quota_from_headers, GithubClient, PageSource};
pub use decode::{decode_response, Decoded, SEARCH_QUERY};
pub use error::{classify_transport_error, QueryError};
pub use model::{split_star_range, Cursor, Page, PartitionSpec, Record};
