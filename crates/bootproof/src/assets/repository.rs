use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use super::Asset;
use crate::error::{Error, Result};
use crate::model::ScreenshotResult;
use crate::store::{atomic_write_text, validate_key};

pub trait AssetRepository: Send + Sync {
    fn keys(&self) -> Result<Vec<String>>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn get(&self, key: &str) -> Result<Asset>;
    fn save(&self, asset: &Asset) -> Result<()>;
    /// Ask the backing source to re-scan the asset's recovery points.
    fn refresh(&self, key: &str) -> Result<()>;

    fn record_screenshot(&self, key: &str, result: &ScreenshotResult) -> Result<()> {
        let mut asset = self.get(key)?;
        let epoch = result.snapshot_epoch;
        let point = asset
            .recovery_point_mut(epoch)
            .ok_or_else(|| Error::not_found("recovery point", format!("{key}@{epoch}")))?;
        point.screenshot = Some(result.clone());
        self.save(&asset)
    }
}

/// One `<key>.json` document per asset.
#[derive(Debug, Clone)]
pub struct FileAssetRepository {
    dir: PathBuf,
}

impl FileAssetRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl AssetRepository for FileAssetRepository {
    fn keys(&self) -> Result<Vec<String>> {
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to list assets in {}: {e}",
                    self.dir.display()
                )));
            }
        };
        let mut keys = Vec::new();
        for ent in rd {
            let p = ent?.path();
            if p.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = p.file_stem().and_then(|s| s.to_str())
                && validate_key(stem).is_ok()
            {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.is_file())
    }

    fn get(&self, key: &str) -> Result<Asset> {
        let p = self.path(key)?;
        let raw = match fs::read_to_string(&p) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("asset", key));
            }
            Err(e) => return Err(Error::msg(format!("failed to read {}: {e}", p.display()))),
        };
        let asset: Asset = serde_json::from_str(&raw)
            .map_err(|e| Error::msg(format!("failed to parse {}: {e}", p.display())))?;
        if asset.key_name != key {
            return Err(Error::msg(format!(
                "{} holds asset '{}', expected '{key}'",
                p.display(),
                asset.key_name
            )));
        }
        Ok(asset)
    }

    fn save(&self, asset: &Asset) -> Result<()> {
        let p = self.path(&asset.key_name)?;
        let mut body = serde_json::to_string_pretty(asset)?;
        body.push('\n');
        atomic_write_text(&p, &body)
    }

    fn refresh(&self, key: &str) -> Result<()> {
        // Points are written by the snapshot subsystem; re-reading on `get`
        // is all a file-backed catalog needs.
        if !self.exists(key)? {
            return Err(Error::not_found("asset", key));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAssetRepository {
    assets: Mutex<BTreeMap<String, Asset>>,
    refreshes: Mutex<Vec<String>>,
}

impl MemoryAssetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: impl IntoIterator<Item = Asset>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.assets.lock().unwrap_or_else(|e| e.into_inner());
            for a in assets {
                map.insert(a.key_name.clone(), a);
            }
        }
        repo
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.refreshes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remove(&self, key: &str) {
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

impl AssetRepository for MemoryAssetRepository {
    fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Asset> {
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("asset", key))
    }

    fn save(&self, asset: &Asset) -> Result<()> {
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(asset.key_name.clone(), asset.clone());
        Ok(())
    }

    fn refresh(&self, key: &str) -> Result<()> {
        self.refreshes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        Ok(())
    }
}
