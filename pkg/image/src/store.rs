//! The on-disk image store.
//!
//! Layout under the lib root (`/var/lib/container` in production):
//!
//! ```text
//! images/<hash>/<hash>.json     manifest copy
//! images/<hash>/<hash>          config copy
//! images/<hash>/<layer12>/fs/   unpacked layer root
//! images/images.json            catalog
//! tmp/<hash>/                   staging area, deleted on success
//! ```
//!
//! `<hash>` is the first 12 hex digits of the image's config digest, so
//! two tags of the same image share one directory and one download.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use crate::catalog::Catalog;
use crate::manifest::{self, ImageConfig, ManifestEntry};
use crate::registry::Registry;

pub struct ImageStore {
    images_dir: PathBuf,
    tmp_dir: PathBuf,
    catalog: Catalog,
    registry: Registry,
}

impl ImageStore {
    /// Store rooted at the contractual `/var/lib/container` layout.
    pub fn open() -> Self {
        Self::at(Path::new(pkg_constants::paths::LIB_DIR))
    }

    /// Store rooted at an arbitrary lib directory.
    pub fn at(lib_dir: &Path) -> Self {
        let images_dir = lib_dir.join("images");
        Self {
            catalog: Catalog::new(&images_dir.join("images.json")),
            tmp_dir: lib_dir.join("tmp"),
            images_dir,
            registry: Registry::new(),
        }
    }

    // ─── Pull ───────────────────────────────────────────────────

    /// Resolve `name:tag` to an image hash, downloading and materializing
    /// the image if the catalog does not know it yet. Idempotent: a
    /// second call returns the recorded hash without touching the
    /// registry's blobs.
    pub async fn pull_if_needed(&self, name: &str, tag: &str) -> Result<String> {
        if let Some(hash) = self.catalog.hash_for(name, tag)? {
            info!("Image {}:{} already exists. Not downloading.", name, tag);
            return Ok(hash);
        }

        info!("Downloading metadata for {}:{}, please wait...", name, tag);
        let (oci_manifest, config_hex) = self.registry.fetch_manifest(name, tag).await?;
        let hash = manifest::short_digest(&config_hex).to_string();

        // The same image may already be on disk under another tag
        // (ubuntu:latest vs ubuntu:20.04); a new catalog entry suffices.
        if let Some((other_name, other_tag)) = self.catalog.name_tag_for(&hash)? {
            info!(
                "{}:{} is the same image as {}:{}",
                name, tag, other_name, other_tag
            );
            self.catalog.insert(name, tag, &hash)?;
            return Ok(hash);
        }

        info!("Image doesn't exist. Downloading...");
        let staging = self.tmp_dir.join(&hash);
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("unable to create {}", staging.display()))?;

        let tarball = staging.join("package.tar");
        self.registry
            .save(name, tag, &oci_manifest, &config_hex, &tarball)
            .await?;
        pkg_archive::extract(&tarball, &staging, false)?;

        self.process_layers(&hash, &config_hex)?;
        self.catalog.insert(name, tag, &hash)?;

        std::fs::remove_dir_all(&staging)
            .with_context(|| "Unable to remove temporary image files")?;
        Ok(hash)
    }

    /// Unpack the staged layer blobs into the image directory and copy the
    /// manifest and config documents next to them.
    pub fn process_layers(&self, hash: &str, config_hex: &str) -> Result<()> {
        let staging = self.tmp_dir.join(hash);
        let entry = manifest::parse_manifest(&staging.join("manifest.json"))?;

        let image_dir = self.images_dir.join(hash);
        for layer in &entry.layers {
            let layer_dir = self.layer_fs_dir(hash, layer);
            info!("Uncompressing layer to: {}", layer_dir.display());
            std::fs::create_dir_all(&layer_dir)
                .with_context(|| format!("unable to create {}", layer_dir.display()))?;
            pkg_archive::extract(&staging.join(layer), &layer_dir, true)
                .with_context(|| format!("Unable to untar layer file: {}", layer))?;
        }

        std::fs::copy(
            staging.join("manifest.json"),
            image_dir.join(format!("{}.json", hash)),
        )
        .with_context(|| "unable to copy image manifest")?;
        std::fs::copy(
            staging.join(format!("sha256:{}", config_hex)),
            image_dir.join(hash),
        )
        .with_context(|| "unable to copy image config")?;
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────

    /// Hash recorded for `name:tag`, if the image was pulled before.
    pub fn exists_by_tag(&self, name: &str, tag: &str) -> Result<Option<String>> {
        self.catalog.hash_for(name, tag)
    }

    /// `(name, tag)` currently mapping to `hash`.
    pub fn name_tag_for(&self, hash: &str) -> Result<Option<(String, String)>> {
        self.catalog.name_tag_for(hash)
    }

    /// `(name, tag, hash)` rows for the `images` table.
    pub fn list(&self) -> Result<Vec<(String, String, String)>> {
        self.catalog.entries()
    }

    /// Parsed manifest copy of a materialized image.
    pub fn manifest(&self, hash: &str) -> Result<ManifestEntry> {
        manifest::parse_manifest(&self.images_dir.join(hash).join(format!("{}.json", hash)))
    }

    /// Parsed config copy (`Env` and `Cmd`) of a materialized image.
    pub fn config(&self, hash: &str) -> Result<ImageConfig> {
        let path = self.images_dir.join(hash).join(hash);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Could not read image config file {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| "Unable to parse image config data")
    }

    /// Unpacked root of one layer: `images/<hash>/<layer12>/fs`.
    pub fn layer_fs_dir(&self, hash: &str, layer_digest: &str) -> PathBuf {
        self.images_dir
            .join(hash)
            .join(manifest::short_digest(layer_digest))
            .join("fs")
    }

    // ─── Removal ────────────────────────────────────────────────

    /// Delete an image and its catalog entries. `referenced_by` reports
    /// the id of a running container using the given `name:tag`, if any;
    /// the caller supplies it so this crate stays ignorant of containers.
    pub fn remove(
        &self,
        hash: &str,
        referenced_by: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        let Some((name, tag)) = self.catalog.name_tag_for(hash)? else {
            bail!("No such image: {}", hash);
        };
        if let Some(container_id) = referenced_by(&format!("{}:{}", name, tag)) {
            bail!(
                "Cannot delete image {} because it is in use by: {}",
                hash,
                container_id
            );
        }

        std::fs::remove_dir_all(self.images_dir.join(hash))
            .map_err(|e| anyhow!("Unable to remove image directory: {}", e))?;
        self.catalog.remove_hash(hash)?;
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const HASH: &str = "0123456789ab";
    const CONFIG_HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const LAYER: &str = "aaaa567890abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    /// Build `tmp/<hash>/` the way an extracted `package.tar` leaves it.
    fn stage_image(lib_dir: &Path) {
        let staging = lib_dir.join("tmp").join(HASH);
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(lib_dir.join("images")).unwrap();

        let manifest = format!(
            r#"[{{"Config":"sha256:{}","RepoTags":["alpine:latest"],"Layers":["{}"]}}]"#,
            CONFIG_HEX, LAYER
        );
        std::fs::write(staging.join("manifest.json"), manifest).unwrap();
        std::fs::write(
            staging.join(format!("sha256:{}", CONFIG_HEX)),
            r#"{"config":{"Env":["PATH=/bin"],"Cmd":["/bin/sh"]}}"#,
        )
        .unwrap();

        // One gzipped layer blob with a single file in it.
        let enc = GzEncoder::new(
            std::fs::File::create(staging.join(LAYER)).unwrap(),
            Compression::default(),
        );
        let mut tar = tar::Builder::new(enc);
        let mut header = tar::Header::new_gnu();
        let data = b"#!/bin/true\n";
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        tar.append_data(&mut header, "bin/sh", &data[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn test_process_layers_materializes_image() {
        let tmp = tempfile::tempdir().unwrap();
        stage_image(tmp.path());
        let store = ImageStore::at(tmp.path());

        store.process_layers(HASH, CONFIG_HEX).unwrap();

        let image_dir = tmp.path().join("images").join(HASH);
        assert!(image_dir.join(format!("{}.json", HASH)).exists());
        assert!(image_dir.join(HASH).exists());
        assert!(
            image_dir
                .join(&LAYER[..12])
                .join("fs")
                .join("bin/sh")
                .exists()
        );

        let config = store.config(HASH).unwrap();
        assert_eq!(config.config.env, vec!["PATH=/bin"]);
        assert_eq!(config.config.cmd, vec!["/bin/sh"]);

        let entry = store.manifest(HASH).unwrap();
        assert_eq!(entry.layers, vec![LAYER]);
    }

    #[test]
    fn test_remove_deletes_directory_and_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        stage_image(tmp.path());
        let store = ImageStore::at(tmp.path());
        store.process_layers(HASH, CONFIG_HEX).unwrap();
        store.catalog.insert("alpine", "latest", HASH).unwrap();
        store.catalog.insert("alpine", "3.19", HASH).unwrap();

        store.remove(HASH, |_| None).unwrap();

        assert!(!tmp.path().join("images").join(HASH).exists());
        assert_eq!(store.exists_by_tag("alpine", "latest").unwrap(), None);
        assert_eq!(store.exists_by_tag("alpine", "3.19").unwrap(), None);
    }

    #[test]
    fn test_remove_refuses_while_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        stage_image(tmp.path());
        let store = ImageStore::at(tmp.path());
        store.process_layers(HASH, CONFIG_HEX).unwrap();
        store.catalog.insert("alpine", "latest", HASH).unwrap();

        let err = store
            .remove(HASH, |image| {
                (image == "alpine:latest").then(|| "cafebabe1234".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("in use by"), "got: {err}");

        // Nothing was deleted.
        assert!(tmp.path().join("images").join(HASH).exists());
        assert_eq!(
            store.exists_by_tag("alpine", "latest").unwrap().as_deref(),
            Some(HASH)
        );
    }

    #[test]
    fn test_remove_unknown_hash_fails() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("images")).unwrap();
        let store = ImageStore::at(tmp.path());
        assert!(store.remove("deadbeef0000", |_| None).is_err());
    }

    #[test]
    fn test_layer_fs_dir_uses_short_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::at(tmp.path());
        let dir = store.layer_fs_dir(HASH, &format!("sha256:{}", LAYER));
        assert!(dir.ends_with(format!("images/{}/{}/fs", HASH, &LAYER[..12])));
    }
}
