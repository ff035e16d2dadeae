//! Legacy (docker-save) manifest and image-config documents.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// One entry of a legacy image manifest. The file itself is a JSON array;
/// [`parse_manifest`] enforces the exactly-one-entry invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Config blob file name inside the image tarball, `sha256:<64 hex>`.
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    /// Layer blob file names, bottom-most first.
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Parse a manifest file, rejecting multi-manifest files and empty layer
/// lists.
pub fn parse_manifest(path: &Path) -> Result<ManifestEntry> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("could not read manifest {}", path.display()))?;
    let mut entries: Vec<ManifestEntry> = serde_json::from_str(&data)
        .with_context(|| format!("unable to parse manifest {}", path.display()))?;
    if entries.len() > 1 {
        bail!("manifest {} has more than one entry", path.display());
    }
    let Some(entry) = entries.pop() else {
        bail!("manifest {} is empty", path.display());
    };
    if entry.layers.is_empty() {
        bail!("could not find any layer in {}", path.display());
    }
    Ok(entry)
}

/// First 12 hex digits of a digest, tolerating a `sha256:` prefix.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

/// The slice of an OCI image config the runtime cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfigDetails {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "config", default)]
    pub config: ImageConfigDetails,
}

// ─── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("manifest.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_parse_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(
            tmp.path(),
            r#"[{"Config":"sha256:abc","RepoTags":["alpine:latest"],"Layers":["aaa","bbb"]}]"#,
        );
        let entry = parse_manifest(&path).unwrap();
        assert_eq!(entry.config, "sha256:abc");
        assert_eq!(entry.layers, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_multi_manifest_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(
            tmp.path(),
            r#"[{"Config":"a","Layers":["x"]},{"Config":"b","Layers":["y"]}]"#,
        );
        assert!(parse_manifest(&path).is_err());
    }

    #[test]
    fn test_empty_layers_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(tmp.path(), r#"[{"Config":"a","Layers":[]}]"#);
        assert!(parse_manifest(&path).is_err());
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(short_digest("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_image_config_parse() {
        let parsed: ImageConfig = serde_json::from_str(
            r#"{"architecture":"amd64","config":{"Env":["PATH=/bin"],"Cmd":["/bin/sh"]}}"#,
        )
        .unwrap();
        assert_eq!(parsed.config.env, vec!["PATH=/bin"]);
        assert_eq!(parsed.config.cmd, vec!["/bin/sh"]);
    }
}
