use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING};
use reqwest::redirect::Policy;
use reqwest::Client;

use crate::core::config::EngineConfig;

const APP_USER_AGENT: &str = concat!("Patchline/", env!("CARGO_PKG_VERSION"));

/// Client for downloads and API calls. `identity` encoding keeps byte
/// offsets on disk equal to offsets on the wire, which range resume needs.
/// The read timeout turns a server that goes silent mid-body into a
/// retryable error instead of a hang.
pub fn build_http_client(config: &EngineConfig) -> Result<Client, reqwest::Error> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .user_agent(APP_USER_AGENT)
        .default_headers(default_headers)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(config.read_timeout())
        .build()
}

/// Client for existence probes: short timeout, redirects are not followed so
/// a CDN redirect to an error page is never read as "exists".
pub fn build_probe_client(config: &EngineConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(Duration::from_secs(config.probe_timeout_secs))
        .redirect(Policy::none())
        .build()
}
