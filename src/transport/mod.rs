//! Outbound HTTP transport.

mod http;

pub use http::HttpFetcher;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
