use crate::scope::{analyze_source, AnalyzeOptions, FreeIdentifiers};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub free: FreeIdentifiers,
}

/// Free-identifier analyses keyed by content hash, so reconverting a package
/// only re-parses files that changed. Entries live in memory and, when a
/// directory is configured, on disk across runs.
#[derive(Default)]
pub struct AnalysisCache {
    cache_dir: Option<PathBuf>,
    memory: Mutex<HashMap<String, FreeIdentifiers>>,
}

impl AnalysisCache {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            cache_dir,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn compute_hash(source: &str, options: AnalyzeOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update([options.legacy_module as u8]);
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn get_cache_path(&self, file_path: &str) -> Option<PathBuf> {
        let safe_name = file_path
            .replace("/", "_")
            .replace("\\", "_")
            .replace(":", "_");
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", safe_name)))
    }

    fn remembered(&self, hash: &str) -> Option<FreeIdentifiers> {
        self.memory.lock().ok()?.get(hash).cloned()
    }

    fn remember(&self, hash: &str, free: &FreeIdentifiers) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(hash.to_string(), free.clone());
        }
    }

    pub async fn get(&self, file_path: &str, hash: &str) -> Option<FreeIdentifiers> {
        if let Some(free) = self.remembered(hash) {
            return Some(free);
        }

        let cache_path = self.get_cache_path(file_path)?;
        let data = tokio::fs::read_to_string(&cache_path).await.ok()?;
        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(file = file_path, error = %e, "discarding unreadable cache entry");
                tokio::fs::remove_file(cache_path).await.ok();
                return None;
            }
        };
        (entry.hash == hash).then_some(entry.free)
    }

    pub async fn set(&self, file_path: &str, hash: &str, free: &FreeIdentifiers) {
        self.remember(hash, free);
        let Some(cache_path) = self.get_cache_path(file_path) else {
            return;
        };
        let entry = CacheEntry {
            hash: hash.to_string(),
            free: free.clone(),
        };
        let Ok(data) = serde_json::to_string(&entry) else {
            return;
        };
        if let Some(dir) = cache_path.parent() {
            tokio::fs::create_dir_all(dir).await.ok();
        }
        if let Err(e) = tokio::fs::write(&cache_path, data).await {
            tracing::debug!(file = file_path, error = %e, "cache entry not stored");
        }
    }

    /// Analyze `source`, reusing a cached result for identical content.
    pub async fn analyze(
        &self,
        source: &str,
        file_path: &str,
        options: AnalyzeOptions,
    ) -> Result<FreeIdentifiers> {
        let hash = Self::compute_hash(source, options);
        if let Some(free) = self.get(file_path, &hash).await {
            tracing::debug!(file = file_path, "analysis cache hit");
            return Ok(free);
        }
        let free = analyze_source(source, file_path, options)?.free;
        self.set(file_path, &hash, &free).await;
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_depends_on_module_flag() {
        let plain = AnalysisCache::compute_hash("x", AnalyzeOptions { legacy_module: false });
        let module = AnalysisCache::compute_hash("x", AnalyzeOptions { legacy_module: true });
        assert_ne!(plain, module);
    }

    #[tokio::test]
    async fn test_disk_entries_survive_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let options = AnalyzeOptions::default();
        let first = AnalysisCache::new(Some(dir.path().to_path_buf()));
        let free = first.analyze("Foo = Bar;", "pkg/a.js", options).await.unwrap();
        assert!(free.contains("Foo"));

        let second = AnalysisCache::new(Some(dir.path().to_path_buf()));
        let hash = AnalysisCache::compute_hash("Foo = Bar;", options);
        assert_eq!(second.get("pkg/a.js", &hash).await, Some(free));
        let stale = AnalysisCache::compute_hash("Foo = Baz;", options);
        assert_eq!(second.get("pkg/a.js", &stale).await, None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AnalysisCache::new(Some(dir.path().to_path_buf()));
        let path = dir.path().join("pkg_a.js.json");
        std::fs::write(&path, "{ broken").unwrap();
        assert_eq!(cache.get("pkg/a.js", "whatever").await, None);
        assert!(!path.exists());
    }
}
