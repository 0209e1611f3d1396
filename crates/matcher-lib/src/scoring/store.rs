//! On-disk persistence of scoring parameter snapshots
//!
//! Each snapshot is written as a checksummed JSON envelope. Writes go to a
//! temp file that is renamed into place, and only the newest
//! `versions_to_keep` files are retained.

use super::ScoringParameters;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "parameters_v";
const FILE_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    checksum: String,
    payload: String,
}

/// Directory of persisted parameter snapshots
#[derive(Debug, Clone)]
pub struct ParameterStore {
    dir: PathBuf,
    versions_to_keep: usize,
}

impl ParameterStore {
    pub fn new(dir: impl Into<PathBuf>, versions_to_keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create parameter directory {:?}", dir))?;

        Ok(Self {
            dir,
            versions_to_keep: versions_to_keep.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a snapshot and prune old versions
    pub fn save(&self, parameters: &ScoringParameters) -> Result<PathBuf> {
        let payload =
            serde_json::to_string(parameters).context("Failed to serialize scoring parameters")?;
        let envelope = Envelope {
            version: parameters.version,
            checksum: compute_checksum(payload.as_bytes()),
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).context("Failed to encode envelope")?;

        let path = self.path_for(parameters.version);
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp parameter file {:?}", temp_path))?;
        file.write_all(&bytes)
            .context("Failed to write scoring parameters")?;
        file.sync_all().context("Failed to sync parameter file")?;

        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        debug!(
            version = parameters.version,
            path = %path.display(),
            "Scoring parameters written"
        );

        self.prune()?;
        Ok(path)
    }

    /// Read and verify one snapshot file
    pub fn load(&self, path: &Path) -> Result<ScoringParameters> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read parameter file {:?}", path))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed parameter file {:?}", path))?;

        let computed = compute_checksum(envelope.payload.as_bytes());
        if computed != envelope.checksum {
            anyhow::bail!(
                "Checksum mismatch in {:?}: expected {}, got {}",
                path,
                envelope.checksum,
                computed
            );
        }

        let parameters: ScoringParameters = serde_json::from_str(&envelope.payload)
            .with_context(|| format!("Failed to decode parameters in {:?}", path))?;

        if parameters.version != envelope.version {
            anyhow::bail!(
                "Version mismatch in {:?}: envelope {}, payload {}",
                path,
                envelope.version,
                parameters.version
            );
        }

        Ok(parameters)
    }

    /// Newest snapshot that passes verification; corrupt files are skipped
    pub fn load_latest(&self) -> Result<Option<ScoringParameters>> {
        for (version, path) in self.list()?.into_iter().rev() {
            match self.load(&path) {
                Ok(parameters) => {
                    info!(version, path = %path.display(), "Loaded scoring parameters");
                    return Ok(Some(parameters));
                }
                Err(e) => {
                    warn!(version, error = %e, "Skipping unreadable parameter snapshot");
                }
            }
        }
        Ok(None)
    }

    /// Persisted versions in ascending order
    pub fn versions(&self) -> Result<Vec<u64>> {
        Ok(self.list()?.into_iter().map(|(v, _)| v).collect())
    }

    fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list parameter directory {:?}", self.dir))?;

        let mut files: Vec<(u64, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter_map(|path| parse_version(&path).map(|v| (v, path)))
            .collect();
        files.sort_by_key(|(v, _)| *v);
        Ok(files)
    }

    fn prune(&self) -> Result<()> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(self.versions_to_keep);

        for (version, path) in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(
                    version,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove old parameter file"
                );
            }
        }
        Ok(())
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:012}.{}", FILE_PREFIX, version, FILE_EXTENSION))
    }
}

fn parse_version(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != FILE_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(FILE_PREFIX)?
        .parse()
        .ok()
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
