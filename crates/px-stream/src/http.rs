//! Shared HTTP helpers.

use px_core::config::DownloadConfig;
use px_core::{Error, Result, SourceDescriptor};
use reqwest::{Client, Method, RequestBuilder, StatusCode};

/// Build the HTTP client used for every source request.
pub fn build_client(config: &DownloadConfig) -> Result<Client> {
    Client::builder()
        .connect_timeout(config.timeout())
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))
}

/// A request for `source`, carrying its bearer credential when present.
pub(crate) fn request(client: &Client, method: Method, source: &SourceDescriptor) -> RequestBuilder {
    let builder = client.request(method, &source.stream_url);
    match &source.auth_credential {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

pub(crate) fn network(url: &str, e: reqwest::Error) -> Error {
    Error::Network(format!("request to {url} failed: {e}"))
}

pub(crate) fn bad_status(url: &str, status: StatusCode) -> Error {
    Error::Network(format!("HTTP {status} from {url}"))
}
