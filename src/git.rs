//! GitRepository archive sources
//!
//! A Template whose source carries a `gitRepository` reference does not
//! select cluster objects; its sources are files inside the tar.gz artifact
//! advertised on the referenced fluxcd GitRepository's status. The archive
//! is downloaded, decompressed, and every entry matching the glob becomes a
//! synthetic source carrying `filename` and `content`.

use std::io::Read;

use flate2::read::GzDecoder;
use kube::core::GroupVersionKind;
use tar::Archive;
use tracing::debug;

use crate::crd::GitRepositoryRef;
use crate::dynamic::DynamicClient;
use crate::{Error, Result};

/// A file extracted from the repository artifact
#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryFile {
    /// Path of the entry inside the archive
    pub filename: String,
    /// UTF-8 file content
    pub content: String,
}

/// Download the artifact of the referenced GitRepository and return the
/// files matching its glob.
pub async fn fetch_repository_files(
    dynamic: &DynamicClient,
    reference: &GitRepositoryRef,
) -> Result<Vec<RepositoryFile>> {
    let gvk = GroupVersionKind {
        group: "source.toolkit.fluxcd.io".to_string(),
        version: "v1beta1".to_string(),
        kind: "GitRepository".to_string(),
    };
    let repository = dynamic
        .get(&gvk, Some(&reference.namespace), &reference.name)
        .await?;

    let url = repository.value()["status"]["artifact"]["url"]
        .as_str()
        .ok_or_else(|| {
            Error::git(format!(
                "gitRepository {}/{} has no status.artifact.url",
                reference.namespace, reference.name
            ))
        })?;

    debug!(url = %url, "downloading gitRepository artifact");
    // Artifact endpoints are in-cluster services with self-signed certs.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::git(format!(
            "failed to download gitRepository archive: status {}",
            response.status()
        )));
    }
    let bytes = response.bytes().await?;

    extract_matching(bytes.as_ref(), &reference.glob)
}

/// Extract the files of a tar.gz archive whose paths match the glob.
///
/// Paths are matched with a leading `/` so absolute-looking globs
/// (`/manifests/*.yaml`) behave as expected. An empty glob matches every
/// file.
pub fn extract_matching(archive: impl Read, pattern: &str) -> Result<Vec<RepositoryFile>> {
    let pattern = if pattern.is_empty() { "**" } else { pattern };
    let matcher = glob::Pattern::new(pattern)
        .map_err(|e| Error::git(format!("failed to compile glob pattern {}: {}", pattern, e)))?;

    let mut archive = Archive::new(GzDecoder::new(archive));
    let mut files = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Error::git(format!("failed to read tar archive: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| Error::git(format!("failed to advance tar archive: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| Error::git(format!("failed to read entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();

        if !matcher.matches(&format!("/{}", path)) {
            continue;
        }

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| Error::git(format!("failed to read file {} from archive: {}", path, e)))?;
        files.push(RepositoryFile {
            filename: path,
            content,
        });
    }

    Ok(files)
}
