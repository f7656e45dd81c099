//! Remote build catalog client.

use std::io::Write;
use std::time::Duration;

use log::debug;

use super::{ArtifactKind, BuildId, FirmwareBuild, Mode};
use crate::error::Result;

/// Production build server.
pub const DEFAULT_CATALOG_URL: &str = "https://dinocore-telemetry-production.up.railway.app";

const LIST_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of firmware builds.
pub trait BuildCatalog: Send + Sync {
    /// List all builds on the channel for `mode`.
    fn list_builds(&self, mode: Mode) -> Result<Vec<FirmwareBuild>>;

    /// Stream one artifact of `build` into `sink`, returning the byte count.
    fn download_artifact(
        &self,
        mode: Mode,
        build: &BuildId,
        kind: ArtifactKind,
        sink: &mut dyn Write,
    ) -> Result<u64>;
}

/// Catalog served over HTTP.
pub struct HttpCatalog {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpCatalog {
    /// Create a client for `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("dinoflash/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn builds_url(&self, mode: Mode) -> String {
        format!("{}/api/{}", self.base_url, mode.channel())
    }

    fn artifact_url(&self, mode: Mode, build: &BuildId, kind: ArtifactKind) -> String {
        format!(
            "{}/api/{}/{build}/files/{}/download",
            self.base_url,
            mode.channel(),
            kind.api_type()
        )
    }
}

impl BuildCatalog for HttpCatalog {
    fn list_builds(&self, mode: Mode) -> Result<Vec<FirmwareBuild>> {
        let url = self.builds_url(mode);
        debug!("GET {url}");
        let builds = self
            .client
            .get(&url)
            .timeout(LIST_TIMEOUT)
            .send()?
            .error_for_status()?
            .json::<Vec<FirmwareBuild>>()?;
        debug!("Catalog returned {} builds", builds.len());
        Ok(builds)
    }

    fn download_artifact(
        &self,
        mode: Mode,
        build: &BuildId,
        kind: ArtifactKind,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let url = self.artifact_url(mode, build, kind);
        debug!("GET {url}");
        let mut response = self
            .client
            .get(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()?
            .error_for_status()?;
        Ok(std::io::copy(&mut response, sink)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let catalog = HttpCatalog::new("https://builds.example.com/").unwrap();
        assert_eq!(
            catalog.builds_url(Mode::Testing),
            "https://builds.example.com/api/testing-builds"
        );
        assert_eq!(
            catalog.artifact_url(Mode::Production, &BuildId::Number(42), ArtifactKind::PartitionTable),
            "https://builds.example.com/api/builds/42/files/partition_table/download"
        );
    }
}
