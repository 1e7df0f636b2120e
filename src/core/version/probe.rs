// ─── Version Probe ───
// Existence check for one published version. The HTTP probe issues a HEAD
// against the legacy full-patch URL; tests swap in an oracle.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::core::error::LauncherError;
use crate::core::paths::Platform;

/// Discovery outcome shared between coalesced callers, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("cannot reach patch server for {branch} ({platform}): {detail}")]
    Unreachable {
        branch: String,
        platform: String,
        detail: String,
    },

    #[error("no versions published for {branch} on {platform}")]
    NoVersionsPublished { branch: String, platform: String },
}

impl From<DiscoveryError> for LauncherError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Unreachable {
                branch,
                platform,
                detail,
            } => LauncherError::ServerUnreachable {
                branch,
                platform,
                detail,
            },
            DiscoveryError::NoVersionsPublished { branch, platform } => {
                LauncherError::NoVersionsPublished { branch, platform }
            }
        }
    }
}

#[async_trait]
pub trait VersionProbe: Send + Sync {
    /// `Ok(false)` means the server answered and the version is absent.
    /// An unreachable server is an error, never "absent".
    async fn exists(&self, branch: &str, version: u32) -> Result<bool, DiscoveryError>;
}

pub struct HttpVersionProbe {
    client: Client,
    origin: String,
    platform: Platform,
}

impl HttpVersionProbe {
    /// `client` should not follow redirects (see `build_probe_client`).
    pub fn new(client: Client, origin: impl Into<String>, platform: Platform) -> Self {
        Self {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
            platform,
        }
    }

    pub fn url_for(&self, branch: &str, version: u32) -> String {
        format!(
            "{}/patches/{}/{}/{}/0/{}.pwr",
            self.origin, self.platform.os, self.platform.arch, branch, version
        )
    }

    fn unreachable(&self, branch: &str, detail: String) -> DiscoveryError {
        DiscoveryError::Unreachable {
            branch: branch.to_string(),
            platform: self.platform.to_string(),
            detail,
        }
    }
}

#[async_trait]
impl VersionProbe for HttpVersionProbe {
    async fn exists(&self, branch: &str, version: u32) -> Result<bool, DiscoveryError> {
        let url = self.url_for(branch, version);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(branch, e.to_string()))?;
        let status = response.status();
        debug!("probe {} -> {}", url, status);

        if status == StatusCode::OK {
            Ok(true)
        } else if status.is_server_error() {
            Err(self.unreachable(branch, format!("HTTP {status} from {url}")))
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::http::build_probe_client;
    use crate::core::test_support::serve;
    use axum::extract::Path;
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    async fn patch_server() -> String {
        let router = Router::new().route(
            "/patches/linux/amd64/release/0/:file",
            get(|Path(file): Path<String>| async move {
                match file.trim_end_matches(".pwr").parse::<u32>() {
                    Ok(v) if v <= 7 => AxumStatus::OK.into_response(),
                    Ok(99) => (
                        AxumStatus::FOUND,
                        [(header::LOCATION, "/patches/linux/amd64/release/0/1.pwr")],
                    )
                        .into_response(),
                    Ok(500) => AxumStatus::BAD_GATEWAY.into_response(),
                    _ => AxumStatus::NOT_FOUND.into_response(),
                }
            }),
        );
        serve(router).await
    }

    fn probe(origin: &str) -> HttpVersionProbe {
        let client = build_probe_client(&EngineConfig::default()).unwrap();
        HttpVersionProbe::new(client, origin, Platform::new("linux", "amd64"))
    }

    #[test]
    fn url_layout() {
        let p = probe("https://patches.example/");
        assert_eq!(
            p.url_for("pre-release", 12),
            "https://patches.example/patches/linux/amd64/pre-release/0/12.pwr"
        );
    }

    #[tokio::test]
    async fn ok_means_present_and_404_absent() {
        let p = probe(&patch_server().await);
        assert!(p.exists("release", 7).await.unwrap());
        assert!(!p.exists("release", 8).await.unwrap());
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let p = probe(&patch_server().await);
        assert!(!p.exists("release", 99).await.unwrap());
    }

    #[tokio::test]
    async fn server_errors_and_dead_hosts_are_unreachable() {
        let p = probe(&patch_server().await);
        assert!(matches!(
            p.exists("release", 500).await,
            Err(DiscoveryError::Unreachable { .. })
        ));

        // Nothing listens on port 9 of localhost in a test sandbox.
        let dead = probe("http://127.0.0.1:9");
        let err = dead.exists("release", 1).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Unreachable { .. }));
        assert!(matches!(
            LauncherError::from(err),
            LauncherError::ServerUnreachable { .. }
        ));
    }
}
