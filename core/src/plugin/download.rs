//! 插件下载与安装：取回条目声明的全部资源、校验、持久化。
//!
//! 失败语义：任一资源取回失败或主脚本校验和不匹配 → 整个操作失败，
//! 存储不写入任何内容（安装对部分写入是原子的）。

use std::sync::Arc;
use std::time::Duration;

use crate::error::PluginError;
use crate::plugin::repo::{sha256_hex, verify_sha256, RepoEntry};
use crate::plugin::storage::{PluginPackage, PluginStorage};
use crate::runtime::EventEmitter;

/// 创建配置了系统代理的阻塞 reqwest 客户端
pub fn create_blocking_client(timeout: Duration) -> Result<reqwest::blocking::Client, PluginError> {
    let mut client_builder = reqwest::blocking::Client::builder();

    // 配置代理：自动从环境变量读取系统代理设置
    if let Ok(proxy_url) = std::env::var("HTTP_PROXY")
        .or_else(|_| std::env::var("http_proxy"))
        .or_else(|_| std::env::var("HTTPS_PROXY"))
        .or_else(|_| std::env::var("https_proxy"))
    {
        if !proxy_url.trim().is_empty() {
            match reqwest::Proxy::all(&proxy_url) {
                Ok(proxy) => {
                    client_builder = client_builder.proxy(proxy);
                }
                Err(e) => {
                    eprintln!("代理配置无效 ({}), 将使用直连: {}", proxy_url, e);
                }
            }
        }
    }

    // 配置不使用代理的地址列表
    if let Ok(no_proxy) = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")) {
        if !no_proxy.trim().is_empty() {
            for domain in no_proxy.split(',').map(|s| s.trim()) {
                if !domain.is_empty() {
                    match reqwest::Proxy::all(format!("direct://{}", domain)) {
                        Ok(proxy) => {
                            client_builder = client_builder.proxy(proxy);
                        }
                        Err(e) => {
                            eprintln!("跳过无效的 NO_PROXY 配置 {}: {}", domain, e);
                        }
                    }
                }
            }
        }
    }

    client_builder
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent("Yomu/1.0")
        .build()
        .map_err(|e| PluginError::network(format!("Failed to create blocking HTTP client: {}", e)))
}

/// 只有通过校验才能构造出 `PluginPackage`。
pub struct PluginPackageFactory;

impl PluginPackageFactory {
    /// 主脚本按条目声明的 sha256 校验（空串 = 显式跳过）。
    /// 附属资源没有各自的摘要声明，随包落盘。
    pub fn create(
        entry: &RepoEntry,
        script: Vec<u8>,
        custom_js: Option<Vec<u8>>,
        custom_css: Option<Vec<u8>>,
    ) -> Result<PluginPackage, PluginError> {
        if !verify_sha256(&entry.sha256, &script) {
            return Err(PluginError::ChecksumMismatch {
                expected: entry.sha256.to_lowercase(),
                actual: sha256_hex(&script),
            });
        }
        Ok(PluginPackage {
            entry: entry.clone(),
            script,
            custom_js,
            custom_css,
        })
    }
}

/// 下载器契约（测试可注入桩实现）
pub trait PluginDownloader: Send + Sync {
    fn download(&self, entry: &RepoEntry) -> Result<PluginPackage, PluginError>;
}

/// 经由 HTTP 取回主脚本与声明的可选资源
pub struct HttpPluginDownloader {
    timeout: Duration,
    emitter: Arc<dyn EventEmitter>,
}

impl HttpPluginDownloader {
    pub fn new(timeout: Duration, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { timeout, emitter }
    }

    fn fetch_bytes(&self, client: &reqwest::blocking::Client, url: &str) -> Result<Vec<u8>, PluginError> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| PluginError::network(format!("Failed to download {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(PluginError::Network(format!(
                "Failed to download {}: HTTP {}",
                url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|e| PluginError::network(format!("Failed to read {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}

impl PluginDownloader for HttpPluginDownloader {
    fn download(&self, entry: &RepoEntry) -> Result<PluginPackage, PluginError> {
        let client = create_blocking_client(self.timeout)?;
        self.emitter
            .emit_download_state(&entry.id, &entry.url, "downloading", None);

        let result = (|| {
            let script = self.fetch_bytes(&client, &entry.url)?;
            let custom_js = entry
                .custom_js_url
                .as_deref()
                .map(|url| self.fetch_bytes(&client, url))
                .transpose()?;
            let custom_css = entry
                .custom_css_url
                .as_deref()
                .map(|url| self.fetch_bytes(&client, url))
                .transpose()?;
            PluginPackageFactory::create(entry, script, custom_js, custom_css)
        })();

        match &result {
            Ok(_) => self
                .emitter
                .emit_download_state(&entry.id, &entry.url, "done", None),
            Err(e) => self.emitter.emit_download_state(
                &entry.id,
                &entry.url,
                "failed",
                Some(&e.to_string()),
            ),
        }
        result
    }
}

/// 安装 = 下载 + 持久化；下载/校验失败时存储保持原样。
pub struct PluginInstaller<'a> {
    downloader: &'a dyn PluginDownloader,
    storage: &'a dyn PluginStorage,
}

impl<'a> PluginInstaller<'a> {
    pub fn new(downloader: &'a dyn PluginDownloader, storage: &'a dyn PluginStorage) -> Self {
        Self { downloader, storage }
    }

    pub fn install(&self, entry: &RepoEntry) -> Result<PluginPackage, PluginError> {
        let pkg = self.downloader.download(entry)?;
        self.storage.save(&pkg)?;
        Ok(pkg)
    }
}
