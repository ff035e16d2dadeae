//! OCI registry client.
//!
//! The rest of the image subsystem consumes this through a narrow
//! "pull to a local path" contract: fetch a manifest, then save the whole
//! image as one legacy-format tarball the store extracts and processes.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use oci_client::{
    Client, Reference,
    client::ClientConfig,
    manifest::{ImageIndexEntry, OciImageManifest},
    secrets::RegistryAuth,
};
use tracing::info;

use crate::manifest::ManifestEntry;

pub struct Registry {
    client: Client,
}

impl Registry {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: oci_client::client::ClientProtocol::HttpsExcept(vec![
                "localhost:5000".to_string(),
            ]),
            // Multi-arch indexes must resolve to a linux/<host_arch> entry;
            // everything this runtime executes is a Linux image.
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }

    /// Fetch the (platform-resolved) manifest for `name:tag`. Returns the
    /// manifest and the config digest hex, which keys the image store.
    pub async fn fetch_manifest(&self, name: &str, tag: &str) -> Result<(OciImageManifest, String)> {
        let reference = image_reference(name, tag)?;
        let (manifest, _digest) = self
            .client
            .pull_image_manifest(&reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| anyhow!("Failed to pull manifest for {}:{}: {}", name, tag, e))?;

        let config_hex = manifest
            .config
            .digest
            .strip_prefix("sha256:")
            .ok_or_else(|| {
                anyhow!("unexpected config digest format: {}", manifest.config.digest)
            })?
            .to_string();
        Ok((manifest, config_hex))
    }

    /// Download config and layer blobs and write them as a single
    /// legacy-format tar at `dest`: a `manifest.json`, the config blob
    /// under its `sha256:<hex>` name, and one still-gzipped blob per
    /// layer named by its bare digest.
    pub async fn save(
        &self,
        name: &str,
        tag: &str,
        manifest: &OciImageManifest,
        config_hex: &str,
        dest: &Path,
    ) -> Result<()> {
        let reference = image_reference(name, tag)?;

        let mut config_data = Vec::new();
        self.client
            .pull_blob(&reference, &manifest.config, &mut config_data)
            .await
            .map_err(|e| anyhow!("Failed to pull config: {}", e))?;

        let file = std::fs::File::create(dest)
            .with_context(|| format!("unable to create {}", dest.display()))?;
        let mut tarball = tar::Builder::new(file);

        let mut layer_names = Vec::new();
        for (i, layer) in manifest.layers.iter().enumerate() {
            info!(
                "Pulling layer {}/{}: {}",
                i + 1,
                manifest.layers.len(),
                layer.digest
            );
            let mut data = Vec::new();
            self.client
                .pull_blob(&reference, layer, &mut data)
                .await
                .map_err(|e| anyhow!("Failed to pull layer {}: {}", layer.digest, e))?;

            let file_name = layer
                .digest
                .strip_prefix("sha256:")
                .unwrap_or(&layer.digest)
                .to_string();
            append_blob(&mut tarball, &file_name, &data)?;
            layer_names.push(file_name);
        }

        append_blob(&mut tarball, &format!("sha256:{}", config_hex), &config_data)?;

        let legacy_manifest = serde_json::to_vec(&[ManifestEntry {
            config: format!("sha256:{}", config_hex),
            repo_tags: vec![format!("{}:{}", name, tag)],
            layers: layer_names,
        }])?;
        append_blob(&mut tarball, "manifest.json", &legacy_manifest)?;

        tarball.finish()?;
        info!("Successfully downloaded {}:{}", name, tag);
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn append_blob(tarball: &mut tar::Builder<std::fs::File>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    tarball
        .append_data(&mut header, name, data)
        .with_context(|| format!("unable to append {} to image tarball", name))?;
    Ok(())
}

fn image_reference(name: &str, tag: &str) -> Result<Reference> {
    format!("{}:{}", name, tag)
        .parse()
        .map_err(|e| anyhow!("Invalid image reference '{}:{}': {}", name, tag, e))
}

/// Platform resolver that picks the first `linux/<host_arch>` entry from
/// an OCI Image Index, falling back to any linux entry.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        other => other,
    };

    for entry in manifests {
        if let Some(platform) = &entry.platform
            && platform.os == "linux"
            && platform.architecture == arch
        {
            return Some(entry.digest.clone());
        }
    }

    for entry in manifests {
        if let Some(platform) = &entry.platform
            && platform.os == "linux"
        {
            return Some(entry.digest.clone());
        }
    }

    None
}
