use std::path::PathBuf;

use arachne_core::error::LoadError;
use arachne_core::traits::{Fetcher, PackageSource};
use url::Url;

use crate::http::HttpClient;

/// Reads packages from http(s) URLs through the [`HttpClient`] chain and
/// from `file://` URLs or plain paths on the local filesystem.
#[derive(Clone)]
pub struct ClientPackageSource {
    client: HttpClient,
}

impl ClientPackageSource {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

enum Location {
    Remote,
    Local(PathBuf),
}

fn locate(uri: &str) -> Result<Location, LoadError> {
    match Url::parse(uri) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(Location::Remote),
            "file" => url
                .to_file_path()
                .map(Location::Local)
                .map_err(|_| LoadError::SourceUnavailable(format!("Bad file URL '{uri}'"))),
            // Single-letter schemes are Windows drive letters.
            scheme if scheme.len() == 1 => Ok(Location::Local(PathBuf::from(uri))),
            scheme => Err(LoadError::SourceUnavailable(format!(
                "Unsupported scheme '{scheme}' in '{uri}'"
            ))),
        },
        Err(_) => Ok(Location::Local(PathBuf::from(uri))),
    }
}

impl PackageSource for ClientPackageSource {
    async fn read(&self, uri: &str) -> Result<Vec<u8>, LoadError> {
        match locate(uri)? {
            Location::Remote => self
                .client
                .fetch_bytes(uri)
                .await
                .map_err(|e| LoadError::SourceUnavailable(format!("{uri}: {e}"))),
            Location::Local(path) => tokio::fs::read(&path).await.map_err(|e| {
                LoadError::SourceUnavailable(format!("{}: {e}", path.display()))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{FixtureReply, FixtureTransport};

    fn source(transport: &FixtureTransport) -> ClientPackageSource {
        let client = HttpClient::builder()
            .retry(arachne_core::retry::RetryPolicy::none())
            .transport(transport.clone())
            .build()
            .unwrap();
        ClientPackageSource::new(client)
    }

    #[tokio::test]
    async fn test_reads_http_through_client() {
        let transport = FixtureTransport::new();
        transport.insert("https://packs.example/demo.json", FixtureReply::ok("{}"));
        let bytes = source(&transport)
            .read("https://packs.example/demo.json")
            .await
            .unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[tokio::test]
    async fn test_http_error_is_source_unavailable() {
        let transport = FixtureTransport::new();
        let err = source(&transport)
            .read("https://packs.example/missing.json")
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable(ref m) if m.contains("404")));
    }

    #[tokio::test]
    async fn test_reads_plain_path_and_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.json");
        std::fs::write(&path, b"local").unwrap();
        let src = source(&FixtureTransport::new());

        assert_eq!(src.read(path.to_str().unwrap()).await.unwrap(), b"local");
        let url = Url::from_file_path(&path).unwrap();
        assert_eq!(src.read(url.as_str()).await.unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_missing_file_and_unknown_scheme() {
        let src = source(&FixtureTransport::new());
        assert!(matches!(
            src.read("/definitely/not/here.json").await,
            Err(LoadError::SourceUnavailable(_))
        ));
        assert!(matches!(
            src.read("ftp://packs.example/a.json").await,
            Err(LoadError::SourceUnavailable(_))
        ));
    }
}
