//! In-process collaborators for tests.

use async_trait::async_trait;
use gobuild_schema::{ModuleCoordinate, ModuleDownload};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tempfile::TempDir;

use crate::fetch::{FetchError, ModuleFetcher};
use crate::hash::{HashError, HashPrefetcher};

/// Serves manifests from a table keyed by `path@version` and counts fetches.
pub(crate) struct FakeFetcher {
    dir: TempDir,
    manifests: HashMap<String, String>,
    fetches: Mutex<BTreeMap<String, usize>>,
}

impl FakeFetcher {
    pub(crate) fn new(manifests: &[(&str, &str)]) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            manifests: manifests
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            fetches: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn fetch_counts(&self) -> BTreeMap<String, usize> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleFetcher for FakeFetcher {
    async fn download(&self, coordinate: &ModuleCoordinate) -> Result<ModuleDownload, FetchError> {
        let key = coordinate.key();
        *self.fetches.lock().unwrap().entry(key.clone()).or_default() += 1;
        tokio::task::yield_now().await;

        let Some(contents) = self.manifests.get(&key) else {
            return Err(FetchError::Module {
                coordinate: key,
                message: "not found".to_string(),
            });
        };
        let manifest_path = self.dir.path().join(key.replace('/', "_") + ".mod");
        std::fs::write(&manifest_path, contents).unwrap();

        Ok(ModuleDownload {
            path: coordinate.path.clone(),
            version: coordinate.version.clone(),
            info_path: None,
            manifest_path: Some(manifest_path),
            archive_path: None,
            extracted_dir: None,
            content_sum: None,
            manifest_sum: None,
            error: None,
        })
    }
}

/// Returns `sha256-<path>-<version>` and counts calls; fails for listed keys.
#[derive(Default)]
pub(crate) struct FakePrefetcher {
    failing: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl FakePrefetcher {
    pub(crate) fn failing(keys: &[&str]) -> Self {
        Self {
            failing: keys.iter().map(|k| (*k).to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl HashPrefetcher for FakePrefetcher {
    async fn prefetch(&self, coordinate: &ModuleCoordinate) -> Result<String, HashError> {
        let key = coordinate.key();
        self.calls.lock().unwrap().push(key.clone());
        if self.failing.contains(&key) {
            return Err(HashError::PatternNotFound);
        }
        Ok(format!("sha256-{}-{}", coordinate.path, coordinate.version))
    }
}
