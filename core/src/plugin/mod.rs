//! 插件分发管线：仓库配置、索引获取、安装/卸载/更新、三视图聚合。
//!
//! 失败语义：单个仓库取回/解析失败只让该仓库降级为空列表，不中断整体；
//! 校验和不匹配是该次安装/更新的硬失败。

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::runtime::EventEmitter;

pub mod download;
pub mod kv;
pub mod overrides;
pub mod repo;
pub mod storage;

use download::{HttpPluginDownloader, PluginInstaller};
use repo::{parse_repo_index, resolve_index_url, RepoEntry};
use storage::{PluginPackage, PluginStorage};

/// 一个已配置的插件仓库
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRepo {
    pub id: String,
    pub name: String,
    pub index_url: String,
}

/// 三个互斥视图：已安装 / 可安装（未装）/ 可更新（已装且远端版本更高）
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginListing {
    pub installed: Vec<RepoEntry>,
    pub available: Vec<RepoEntry>,
    pub updates: Vec<RepoEntry>,
}

pub struct PluginManager {
    data_dir: PathBuf,
    storage: Arc<dyn PluginStorage>,
    emitter: Arc<dyn EventEmitter>,
    http_timeout: Duration,
}

impl PluginManager {
    pub fn new(
        data_dir: PathBuf,
        storage: Arc<dyn PluginStorage>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            data_dir,
            storage,
            emitter,
            http_timeout: Duration::from_secs(30),
        }
    }

    /// 下载阶段的超时由调用方指定（超时/取消的取回只产生失败结果，不会产生半个包）
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn storage(&self) -> Arc<dyn PluginStorage> {
        Arc::clone(&self.storage)
    }

    fn repos_file(&self) -> PathBuf {
        self.data_dir.join("plugin_repos.json")
    }

    /// 加载仓库配置；文件不存在时返回空列表
    pub fn load_repos(&self) -> Result<Vec<PluginRepo>, PluginError> {
        let file = self.repos_file();
        if !file.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&file)
            .map_err(|e| PluginError::storage(format!("failed to read plugin repos: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| PluginError::storage(format!("failed to parse plugin repos: {}", e)))
    }

    pub fn save_repos(&self, repos: &[PluginRepo]) -> Result<(), PluginError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| PluginError::storage(format!("failed to create data dir: {}", e)))?;
        let content = serde_json::to_string_pretty(repos)
            .map_err(|e| PluginError::storage(format!("failed to serialize plugin repos: {}", e)))?;
        fs::write(self.repos_file(), content)
            .map_err(|e| PluginError::storage(format!("failed to write plugin repos: {}", e)))
    }

    /// 从单个仓库取回条目列表。
    /// 网络/解析失败降级为空列表；非法条目逐条上报到日志后跳过。
    fn fetch_repo_entries(&self, repo_url: &str) -> Vec<RepoEntry> {
        let index_url = resolve_index_url(repo_url);
        let client = match download::create_blocking_client(self.http_timeout) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("插件仓库客户端创建失败: {}", e);
                return Vec::new();
            }
        };

        let payload = client
            .get(&index_url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text());
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                eprintln!("插件仓库获取失败 ({}): {}", index_url, e);
                return Vec::new();
            }
        };
        if payload.trim().is_empty() {
            return Vec::new();
        }

        match parse_repo_index(&payload) {
            Ok(parsed) => {
                for invalid in &parsed.invalid {
                    self.emitter.emit(
                        "plugin-repo-entry-invalid",
                        serde_json::json!({ "repo": index_url, "error": invalid.to_string() }),
                    );
                }
                parsed.entries
            }
            Err(e) => {
                eprintln!("插件仓库索引解析失败 ({}): {}", index_url, e);
                Vec::new()
            }
        }
    }

    /// 跨全部配置仓库取回并按 id 去重（保留最高版本）
    fn fetch_available(&self, repos: &[PluginRepo]) -> Vec<RepoEntry> {
        let mut best: HashMap<String, RepoEntry> = HashMap::new();
        for repo in repos {
            for entry in self.fetch_repo_entries(&repo.index_url) {
                match best.get(&entry.id) {
                    Some(cur) if cur.version >= entry.version => {}
                    _ => {
                        best.insert(entry.id.clone(), entry);
                    }
                }
            }
        }
        let mut entries: Vec<RepoEntry> = best.into_values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// 聚合三视图。零配置仓库时只返回已安装视图，不发起任何网络请求。
    pub fn fetch_listing(&self) -> Result<PluginListing, PluginError> {
        let installed: Vec<RepoEntry> = self
            .storage
            .get_all()?
            .into_iter()
            .map(|pkg| pkg.entry)
            .collect();

        let repos = self.load_repos()?;
        if repos.is_empty() {
            return Ok(PluginListing {
                installed,
                ..PluginListing::default()
            });
        }

        let available = self.fetch_available(&repos);
        let updates = find_update_candidates(&installed, &available);
        let installed_ids: std::collections::HashSet<&str> =
            installed.iter().map(|e| e.id.as_str()).collect();
        let available_only: Vec<RepoEntry> = available
            .into_iter()
            .filter(|e| !installed_ids.contains(e.id.as_str()))
            .collect();

        Ok(PluginListing {
            installed,
            available: available_only,
            updates,
        })
    }

    /// 检查更新：每个已安装插件与各仓库取回的同 id 条目比较版本
    pub fn find_updates(&self) -> Result<Vec<RepoEntry>, PluginError> {
        let repos = self.load_repos()?;
        if repos.is_empty() {
            return Ok(Vec::new());
        }
        let installed: Vec<RepoEntry> = self
            .storage
            .get_all()?
            .into_iter()
            .map(|pkg| pkg.entry)
            .collect();
        let available = self.fetch_available(&repos);
        Ok(find_update_candidates(&installed, &available))
    }

    /// 安装或更新一个插件条目（下载、校验、持久化；失败时存储不变）
    pub fn install(&self, entry: &RepoEntry) -> Result<PluginPackage, PluginError> {
        let downloader = HttpPluginDownloader::new(self.http_timeout, Arc::clone(&self.emitter));
        PluginInstaller::new(&downloader, self.storage.as_ref()).install(entry)
    }

    /// 按 id 从某个配置仓库找到条目并安装
    pub fn install_by_id(&self, plugin_id: &str) -> Result<PluginPackage, PluginError> {
        let repos = self.load_repos()?;
        let available = self.fetch_available(&repos);
        let entry = available
            .iter()
            .find(|e| e.id == plugin_id)
            .ok_or_else(|| PluginError::ScriptNotFound(plugin_id.to_string()))?;
        self.install(entry)
    }

    pub fn uninstall(&self, plugin_id: &str) -> Result<bool, PluginError> {
        self.storage.remove(plugin_id)
    }
}

/// 更新候选：仅当 (a) 该插件当前已安装 且 (b) 取回版本严格更高。
pub fn find_update_candidates(
    installed: &[RepoEntry],
    available: &[RepoEntry],
) -> Vec<RepoEntry> {
    let installed_by_id: HashMap<&str, &RepoEntry> =
        installed.iter().map(|e| (e.id.as_str(), e)).collect();
    available
        .iter()
        .filter(|entry| match installed_by_id.get(entry.id.as_str()) {
            Some(current) => entry.version > current.version,
            None => false,
        })
        .cloned()
        .collect()
}
