use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::error::{LauncherError, LauncherResult};
use crate::core::paths::Platform;

/// One incremental transform `from -> to`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatchStep {
    pub from: u32,
    pub to: u32,
    /// Patch file URL.
    pub pwr: String,
    #[serde(rename = "pwrHead", default)]
    pub pwr_head: Option<String>,
    /// Detached signature URL.
    pub sig: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl PatchStep {
    /// Cache file stem shared by the patch and its signature.
    pub fn file_stem(&self) -> String {
        format!("{}_to_{}", self.from, self.to)
    }
}

#[derive(Debug, Serialize)]
struct StepsRequest<'a> {
    os: &'a str,
    arch: &'a str,
    branch: &'a str,
    version: String,
}

#[derive(Debug, Deserialize)]
struct StepsResponse {
    #[serde(default)]
    steps: Vec<PatchStep>,
}

/// Where patch steps come from.
#[async_trait]
pub trait PatchSource: Send + Sync {
    /// Steps published for `branch` starting at `from`, in server order.
    async fn steps(&self, branch: &str, from: u32) -> LauncherResult<Vec<PatchStep>>;
}

/// Patch-steps endpoint: GET with a JSON body `{os, arch, branch, version}`.
pub struct HttpPatchSource {
    client: Client,
    url: String,
    platform: Platform,
    timeout: Duration,
}

impl HttpPatchSource {
    pub fn new(client: Client, url: impl Into<String>, platform: Platform, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            platform,
            timeout,
        }
    }
}

#[async_trait]
impl PatchSource for HttpPatchSource {
    async fn steps(&self, branch: &str, from: u32) -> LauncherResult<Vec<PatchStep>> {
        let request = StepsRequest {
            os: &self.platform.os,
            arch: &self.platform.arch,
            branch,
            version: from.to_string(),
        };
        debug!("Requesting patch steps: {:?}", request);

        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::DownloadFailed {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        let body: StepsResponse = response.json().await?;
        info!(
            "Patch server returned {} step(s) for {} from {}",
            body.steps.len(),
            branch,
            from
        );
        Ok(body.steps)
    }
}

/// Pick the steps that bridge `from -> to`.
///
/// Steps already behind `from` are skipped and consumption stops at the
/// first step starting at or past `to`. The result must be contiguous and
/// land exactly on `to`.
pub fn select_chain(steps: &[PatchStep], from: u32, to: u32) -> LauncherResult<Vec<PatchStep>> {
    let mut chain = Vec::new();
    let mut current = from;
    for step in steps {
        if step.from >= to {
            break;
        }
        if step.to <= current {
            continue;
        }
        if step.from != current {
            return Err(LauncherError::BrokenChain {
                from,
                to,
                detail: format!("gap between {} and {}", current, step.from),
            });
        }
        if step.to > to {
            return Err(LauncherError::BrokenChain {
                from,
                to,
                detail: format!("step {} -> {} overshoots the target", step.from, step.to),
            });
        }
        current = step.to;
        chain.push(step.clone());
    }
    if current != to {
        return Err(LauncherError::BrokenChain {
            from,
            to,
            detail: format!("available steps end at {current}"),
        });
    }
    Ok(chain)
}
