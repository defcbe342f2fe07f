//! 已安装插件存储：`save`/`get`/`get_all`/`remove`。
//!
//! 文件布局（每个插件一组文件，`<id>` 经过文件名清洗）：
//! - `<id>.entry.json`  仓库条目元数据（最后写入，作为“安装完成”的标记）
//! - `<id>.plugin.rhai` 主脚本
//! - `<id>.custom.js` / `<id>.custom.css` 可选附属资源

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::PluginError;
use crate::plugin::repo::RepoEntry;

/// 一个通过校验的插件包。只有 `PluginPackageFactory` 能在校验后构造（见 download.rs）。
#[derive(Debug, Clone, PartialEq)]
pub struct PluginPackage {
    pub entry: RepoEntry,
    pub script: Vec<u8>,
    pub custom_js: Option<Vec<u8>>,
    pub custom_css: Option<Vec<u8>>,
}

pub trait PluginStorage: Send + Sync {
    fn save(&self, pkg: &PluginPackage) -> Result<(), PluginError>;
    fn get(&self, id: &str) -> Result<Option<PluginPackage>, PluginError>;
    fn get_all(&self) -> Result<Vec<PluginPackage>, PluginError>;
    /// 返回是否确实删除了已安装插件
    fn remove(&self, id: &str) -> Result<bool, PluginError>;
}

/// 内存存储：测试与临时运行场景
#[derive(Default)]
pub struct InMemoryPluginStorage {
    plugins: Mutex<HashMap<String, PluginPackage>>,
}

impl InMemoryPluginStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PluginStorage for InMemoryPluginStorage {
    fn save(&self, pkg: &PluginPackage) -> Result<(), PluginError> {
        let mut guard = self
            .plugins
            .lock()
            .map_err(|_| PluginError::storage("plugin storage lock poisoned"))?;
        guard.insert(pkg.entry.id.clone(), pkg.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<PluginPackage>, PluginError> {
        let guard = self
            .plugins
            .lock()
            .map_err(|_| PluginError::storage("plugin storage lock poisoned"))?;
        Ok(guard.get(id).cloned())
    }

    fn get_all(&self) -> Result<Vec<PluginPackage>, PluginError> {
        let guard = self
            .plugins
            .lock()
            .map_err(|_| PluginError::storage("plugin storage lock poisoned"))?;
        let mut all: Vec<PluginPackage> = guard.values().cloned().collect();
        all.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));
        Ok(all)
    }

    fn remove(&self, id: &str) -> Result<bool, PluginError> {
        let mut guard = self
            .plugins
            .lock()
            .map_err(|_| PluginError::storage("plugin storage lock poisoned"))?;
        Ok(guard.remove(id).is_some())
    }
}

/// 文件存储：跨进程重启持久化；重装覆盖、卸载删除。
pub struct FilePluginStorage {
    dir: PathBuf,
}

impl FilePluginStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 默认位置：`<数据目录>/plugins-directory`
    pub fn in_data_dir() -> Self {
        Self::new(crate::app_paths::yomu_data_dir().join("plugins-directory"))
    }

    fn entry_path(&self, safe_id: &str) -> PathBuf {
        self.dir.join(format!("{}.entry.json", safe_id))
    }

    fn script_path(&self, safe_id: &str) -> PathBuf {
        self.dir.join(format!("{}.plugin.rhai", safe_id))
    }

    fn asset_path(&self, safe_id: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.custom.{}", safe_id, kind))
    }

    /// 先写临时文件再原子替换（避免进程中途退出留下半文件）
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), PluginError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .map_err(|e| PluginError::storage(format!("failed to write {}: {}", tmp.display(), e)))?;
        // Windows 上 rename 覆盖行为不一致：先删除旧文件再 rename
        if path.exists() {
            let _ = fs::remove_file(path);
        }
        fs::rename(&tmp, path).map_err(|e| {
            PluginError::storage(format!("failed to finalize {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    fn read_package(&self, entry_path: &Path) -> Result<Option<PluginPackage>, PluginError> {
        let content = match fs::read_to_string(entry_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PluginError::storage(format!(
                    "failed to read {}: {}",
                    entry_path.display(),
                    e
                )))
            }
        };
        let entry: RepoEntry = serde_json::from_str(&content)
            .map_err(|e| PluginError::storage(format!("failed to parse plugin entry: {}", e)))?;

        let safe_id = safe_filename_component(&entry.id);
        let script = fs::read(self.script_path(&safe_id))
            .map_err(|_| PluginError::ScriptNotFound(entry.id.clone()))?;
        let custom_js = fs::read(self.asset_path(&safe_id, "js")).ok();
        let custom_css = fs::read(self.asset_path(&safe_id, "css")).ok();

        Ok(Some(PluginPackage {
            entry,
            script,
            custom_js,
            custom_css,
        }))
    }
}

impl PluginStorage for FilePluginStorage {
    fn save(&self, pkg: &PluginPackage) -> Result<(), PluginError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            PluginError::storage(format!("failed to create plugins directory: {}", e))
        })?;

        let safe_id = safe_filename_component(&pkg.entry.id);

        // 脚本与附属资源先落盘，entry.json 最后写：
        // 半途失败时不会出现“看似已安装但脚本缺失”的状态。
        self.write_atomic(&self.script_path(&safe_id), &pkg.script)?;
        match &pkg.custom_js {
            Some(bytes) => self.write_atomic(&self.asset_path(&safe_id, "js"), bytes)?,
            None => {
                let _ = fs::remove_file(self.asset_path(&safe_id, "js"));
            }
        }
        match &pkg.custom_css {
            Some(bytes) => self.write_atomic(&self.asset_path(&safe_id, "css"), bytes)?,
            None => {
                let _ = fs::remove_file(self.asset_path(&safe_id, "css"));
            }
        }

        let entry_json = serde_json::to_string_pretty(&pkg.entry)
            .map_err(|e| PluginError::storage(format!("failed to serialize entry: {}", e)))?;
        self.write_atomic(&self.entry_path(&safe_id), entry_json.as_bytes())
    }

    fn get(&self, id: &str) -> Result<Option<PluginPackage>, PluginError> {
        let safe_id = safe_filename_component(id);
        self.read_package(&self.entry_path(&safe_id))
    }

    fn get_all(&self) -> Result<Vec<PluginPackage>, PluginError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PluginError::storage(format!(
                    "failed to read plugins directory: {}",
                    e
                )))
            }
        };

        let mut all = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| PluginError::storage(format!("failed to read dir entry: {}", e)))?;
            let path = entry.path();
            let is_entry_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".entry.json"))
                .unwrap_or(false);
            if !is_entry_file {
                continue;
            }
            // 单个坏文件不拖垮整个列表
            if let Ok(Some(pkg)) = self.read_package(&path) {
                all.push(pkg);
            }
        }
        all.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));
        Ok(all)
    }

    fn remove(&self, id: &str) -> Result<bool, PluginError> {
        let safe_id = safe_filename_component(id);
        let entry_path = self.entry_path(&safe_id);
        if !entry_path.is_file() {
            return Ok(false);
        }
        // entry.json 先删（先撤销“已安装”标记，再清理附属文件）
        fs::remove_file(&entry_path)
            .map_err(|e| PluginError::storage(format!("failed to delete plugin entry: {}", e)))?;
        let _ = fs::remove_file(self.script_path(&safe_id));
        let _ = fs::remove_file(self.asset_path(&safe_id, "js"));
        let _ = fs::remove_file(self.asset_path(&safe_id, "css"));
        Ok(true)
    }
}

pub fn safe_filename_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let ok = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.';
        out.push(if ok { ch } else { '_' });
    }
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package(id: &str, version: i64, body: &[u8]) -> PluginPackage {
        PluginPackage {
            entry: RepoEntry {
                id: id.to_string(),
                name: id.to_uppercase(),
                site: "https://example.org".to_string(),
                lang: "en".to_string(),
                version,
                url: format!("https://example.org/{id}.rhai"),
                icon_url: None,
                custom_js_url: None,
                custom_css_url: None,
                has_settings: false,
                sha256: String::new(),
            },
            script: body.to_vec(),
            custom_js: None,
            custom_css: None,
        }
    }

    #[test]
    fn test_file_storage_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilePluginStorage::new(dir.path());

        storage.save(&sample_package("alpha", 1, b"fn a() {}")).unwrap();
        storage.save(&sample_package("beta", 1, b"fn b() {}")).unwrap();
        assert_eq!(storage.get_all().unwrap().len(), 2);

        // 重装覆盖
        storage.save(&sample_package("alpha", 2, b"fn a2() {}")).unwrap();
        let got = storage.get("alpha").unwrap().unwrap();
        assert_eq!(got.entry.version, 2);
        assert_eq!(got.script, b"fn a2() {}");

        assert!(storage.remove("alpha").unwrap());
        assert!(!storage.remove("alpha").unwrap());
        assert!(storage.get("alpha").unwrap().is_none());
        assert_eq!(storage.get_all().unwrap().len(), 1);
    }

    #[test]
    fn test_safe_filename_component() {
        assert_eq!(safe_filename_component("a/b\\c:d"), "a_b_c_d");
        assert_eq!(safe_filename_component(""), "_");
        assert_eq!(safe_filename_component("ok-1.2_x"), "ok-1.2_x");
    }
}
