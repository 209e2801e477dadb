//! Description Provider: loads device-description, SCPD and icon bytes off disk,
//! relative to a single root directory, and hands them back verbatim for caching by
//! [`super::TreeBuilder`] and later serving by the HTTP server.

use std::path::{Path, PathBuf};

use crate::error::HostError;

pub struct DescriptionProvider {
    root: PathBuf,
}

impl DescriptionProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads `relative_path` under the provider's root. Paths are taken as given by the
    /// device description document (already relative, `/`-separated); this does not resolve
    /// `..` specially, matching the description author's responsibility for well-formed
    /// relative URLs.
    pub async fn load(&self, relative_path: &str) -> Result<Vec<u8>, HostError> {
        let path = self.root.join(relative_path.trim_start_matches('/'));
        tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                HostError::not_found(format!("{relative_path}: {err}"))
            } else {
                HostError::from(err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_file_relative_to_root() {
        let dir = std::env::temp_dir().join(format!("upnp-host-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("description.xml"), b"<root/>")
            .await
            .unwrap();

        let provider = DescriptionProvider::new(&dir);
        let bytes = provider.load("description.xml").await.unwrap();
        assert_eq!(bytes, b"<root/>");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_maps_to_not_found() {
        let provider = DescriptionProvider::new(std::env::temp_dir());
        let err = provider.load("does-not-exist.xml").await.unwrap_err();
        assert_eq!(err.kind, crate::error::HostErrorKind::NotFound);
    }
}
