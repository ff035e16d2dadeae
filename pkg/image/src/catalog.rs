//! The persisted image catalog: `image name → (tag → 12-hex hash)`.
//!
//! Stored as a single JSON document. Mutations re-read and re-write the
//! whole file under an exclusive advisory lock so two concurrent pulls
//! cannot lose each other's entries.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::fcntl::{Flock, FlockArg};

type Entries = BTreeMap<String, BTreeMap<String, String>>;

/// Handle on the catalog file. Cheap to construct; every operation opens
/// the file fresh so there is no stale in-memory state between commands.
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn read_entries(&self) -> Result<Entries> {
        if !self.path.exists() {
            std::fs::write(&self.path, "{}")
                .with_context(|| format!("could not create catalog {}", self.path.display()))?;
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("could not read catalog {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("unable to parse catalog {}", self.path.display()))
    }

    /// Hash recorded for `name:tag`, if any.
    pub fn hash_for(&self, name: &str, tag: &str) -> Result<Option<String>> {
        Ok(self
            .read_entries()?
            .get(name)
            .and_then(|tags| tags.get(tag))
            .cloned())
    }

    /// Any `(name, tag)` currently mapping to `hash`. Multiple tags may
    /// share one hash; the first in catalog order wins.
    pub fn name_tag_for(&self, hash: &str) -> Result<Option<(String, String)>> {
        for (name, tag, h) in self.entries()? {
            if h == hash {
                return Ok(Some((name, tag)));
            }
        }
        Ok(None)
    }

    /// Flattened `(name, tag, hash)` rows for the `images` table.
    pub fn entries(&self) -> Result<Vec<(String, String, String)>> {
        let mut rows = Vec::new();
        for (name, tags) in self.read_entries()? {
            for (tag, hash) in tags {
                rows.push((name.clone(), tag, hash));
            }
        }
        Ok(rows)
    }

    pub fn insert(&self, name: &str, tag: &str, hash: &str) -> Result<()> {
        self.update(|entries| {
            entries
                .entry(name.to_string())
                .or_default()
                .insert(tag.to_string(), hash.to_string());
        })
    }

    /// Drop every entry whose value equals `hash`; names left without any
    /// tag are dropped entirely.
    pub fn remove_hash(&self, hash: &str) -> Result<()> {
        self.update(|entries| {
            for tags in entries.values_mut() {
                tags.retain(|_, h| h != hash);
            }
            entries.retain(|_, tags| !tags.is_empty());
        })
    }

    /// Read-modify-write under an exclusive flock on the catalog file.
    fn update(&self, mutate: impl FnOnce(&mut Entries)) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("could not open catalog {}", self.path.display()))?;
        let mut locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| anyhow!("unable to lock image catalog: {}", errno))?;

        let mut data = String::new();
        locked.read_to_string(&mut data)?;
        let mut entries: Entries = if data.trim().is_empty() {
            Entries::new()
        } else {
            serde_json::from_str(&data)
                .with_context(|| format!("unable to parse catalog {}", self.path.display()))?
        };

        mutate(&mut entries);

        let serialized = serde_json::to_vec(&entries)?;
        locked.set_len(0)?;
        locked.seek(SeekFrom::Start(0))?;
        locked.write_all(&serialized)?;
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────
