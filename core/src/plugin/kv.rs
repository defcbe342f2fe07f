//! 按插件 id 隔离的键值存储，供沙箱 storage 桥使用。
//!
//! 每个插件一个 JSON 文件（`<safe_id>.kv.json`），带内存缓存；
//! 读失败降级为空表，写失败仅告警不中断脚本。

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::plugin::storage::safe_filename_component;

pub struct PluginKeyValueStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl PluginKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_data_dir() -> Self {
        Self::new(crate::app_paths::yomu_data_dir().join("plugin-kv"))
    }

    fn file_path(&self, plugin_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.kv.json", safe_filename_component(plugin_id)))
    }

    fn load(&self, plugin_id: &str) -> HashMap<String, String> {
        fs::read_to_string(self.file_path(plugin_id))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn with_map<T>(
        &self,
        plugin_id: &str,
        mutate: bool,
        f: impl FnOnce(&mut HashMap<String, String>) -> T,
    ) -> T {
        let mut cache = match self.cache.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        if !cache.contains_key(plugin_id) {
            let loaded = self.load(plugin_id);
            cache.insert(plugin_id.to_string(), loaded);
        }
        let map = cache.entry(plugin_id.to_string()).or_default();
        let out = f(&mut *map);
        if mutate {
            if let Err(e) = self.persist(plugin_id, &*map) {
                eprintln!("[plugin-kv] 持久化失败 ({}): {}", plugin_id, e);
            }
        }
        out
    }

    fn persist(&self, plugin_id: &str, map: &HashMap<String, String>) -> Result<(), String> {
        fs::create_dir_all(&self.dir).map_err(|e| format!("create dir: {}", e))?;
        let content =
            serde_json::to_string_pretty(map).map_err(|e| format!("serialize: {}", e))?;
        fs::write(self.file_path(plugin_id), content).map_err(|e| format!("write: {}", e))
    }

    pub fn get(&self, plugin_id: &str, key: &str) -> Option<String> {
        self.with_map(plugin_id, false, |map| map.get(key).cloned())
    }

    pub fn set(&self, plugin_id: &str, key: &str, value: &str) {
        self.with_map(plugin_id, true, |map| {
            map.insert(key.to_string(), value.to_string());
        });
    }

    pub fn remove(&self, plugin_id: &str, key: &str) {
        self.with_map(plugin_id, true, |map| {
            map.remove(key);
        });
    }

    pub fn clear(&self, plugin_id: &str) {
        self.with_map(plugin_id, true, |map| map.clear());
    }

    pub fn keys(&self, plugin_id: &str) -> Vec<String> {
        self.with_map(plugin_id, false, |map| {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_scoped_per_plugin_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginKeyValueStore::new(dir.path());

        store.set("a", "token", "1");
        store.set("b", "token", "2");
        assert_eq!(store.get("a", "token").as_deref(), Some("1"));
        assert_eq!(store.get("b", "token").as_deref(), Some("2"));

        // 新实例从磁盘恢复
        let reopened = PluginKeyValueStore::new(dir.path());
        assert_eq!(reopened.get("a", "token").as_deref(), Some("1"));

        store.remove("a", "token");
        assert_eq!(store.get("a", "token"), None);
        store.set("a", "x", "1");
        store.set("a", "y", "2");
        assert_eq!(store.keys("a"), vec!["x".to_string(), "y".to_string()]);
        store.clear("a");
        assert!(store.keys("a").is_empty());
    }
}
