//! 插件仓库索引：条目模型、解析与校验和验证。
//!
//! 索引是一个 JSON 数组，每项描述一个可下载插件。注意 payload 的自定义资源
//! 键名是 `customJS`/`customCSS`，与实体字段 `customJsUrl`/`customCssUrl` 不同，
//! 解析时需要显式映射。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PluginError;

/// 仓库索引中的一个插件条目。身份 = `id`，解析后不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoEntry {
    pub id: String,
    pub name: String,
    pub site: String,
    pub lang: String,
    pub version: i64,
    pub url: String,
    pub icon_url: Option<String>,
    pub custom_js_url: Option<String>,
    pub custom_css_url: Option<String>,
    pub has_settings: bool,
    /// 主脚本的期望 SHA-256（hex）。空串表示跳过校验（遗留条目的信任逃生口）。
    pub sha256: String,
}

/// 解析结果：合法条目 + 按序号上报的非法条目（缺必填字段不静默丢弃）
#[derive(Debug, Default)]
pub struct ParsedRepoIndex {
    pub entries: Vec<RepoEntry>,
    pub invalid: Vec<PluginError>,
}

/// 解析仓库索引文档。
///
/// 对未知字段宽容，对必填字段（id/name/site/lang/version/url）严格：
/// 缺任意一个的条目进入 `invalid`，不中断整批解析。
pub fn parse_repo_index(payload: &str) -> Result<ParsedRepoIndex, PluginError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| PluginError::IndexParse(format!("invalid JSON: {}", e)))?;
    let items = value
        .as_array()
        .ok_or_else(|| PluginError::IndexParse("expected a JSON array".to_string()))?;

    let mut parsed = ParsedRepoIndex::default();
    for (index, item) in items.iter().enumerate() {
        match parse_entry(item) {
            Ok(entry) => parsed.entries.push(entry),
            Err(reason) => parsed.invalid.push(PluginError::EntryInvalid { index, reason }),
        }
    }
    Ok(parsed)
}

fn parse_entry(item: &serde_json::Value) -> Result<RepoEntry, String> {
    let obj = item
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;

    let required = |key: &str| -> Result<String, String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("missing '{}' field", key))
    };
    let optional = |key: &str| -> Option<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    let version = parse_version(obj.get("version")).ok_or("missing 'version' field")?;

    Ok(RepoEntry {
        id: required("id")?,
        name: required("name")?,
        site: required("site")?,
        lang: required("lang")?.trim().to_lowercase(),
        version,
        url: required("url")?,
        icon_url: optional("iconUrl"),
        custom_js_url: optional("customJS"),
        custom_css_url: optional("customCSS"),
        has_settings: obj
            .get("hasSettings")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        sha256: optional("sha256").unwrap_or_default(),
    })
}

/// 版本号：整数直接用；`a.b.c` 折叠为 `a*1_000_000 + b*1_000 + c`。
fn parse_version(value: Option<&serde_json::Value>) -> Option<i64> {
    let value = value?;
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if !raw.contains('.') {
        return raw.parse::<i64>().ok();
    }
    let mut parts = raw.split(['.', '-', '_']);
    let major: i64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: i64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: i64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(major * 1_000_000 + minor * 1_000 + patch)
}

/// 由配置的仓库地址得到索引文档 URL。
///
/// 末尾 `/` 去除；已以 `.json` 结尾的地址原样使用，否则追加 `/plugins.min.json`。
pub fn resolve_index_url(repo_url: &str) -> String {
    let base = repo_url.trim().trim_end_matches('/');
    if base.ends_with(".json") {
        base.to_string()
    } else {
        format!("{}/plugins.min.json", base)
    }
}

/// 计算内容 SHA-256（小写 hex）
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 校验内容哈希。期望值大小写不敏感；空串期望视为显式跳过校验，恒为真。
pub fn verify_sha256(expected_hex: &str, bytes: &[u8]) -> bool {
    if expected_hex.is_empty() {
        return true;
    }
    expected_hex.to_lowercase() == sha256_hex(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_json(id: &str, version: i64) -> String {
        format!(
            r#"{{"id":"{id}","name":"N","site":"https://a.com","lang":"en","version":{version},"url":"https://a.com/p.rhai","sha256":""}}"#
        )
    }

    #[test]
    fn test_parse_index_maps_custom_asset_keys() {
        let payload = r#"[{
            "id": "x", "name": "X", "site": "https://x.org", "lang": "EN",
            "version": "1.2.3", "url": "https://x.org/x.rhai",
            "customJS": "https://x.org/x.js", "customCSS": "https://x.org/x.css",
            "hasSettings": true, "sha256": "AB", "unknownField": 42
        }]"#;
        let parsed = parse_repo_index(payload).unwrap();
        assert!(parsed.invalid.is_empty());
        let e = &parsed.entries[0];
        assert_eq!(e.version, 1_002_003);
        assert_eq!(e.lang, "en");
        assert_eq!(e.custom_js_url.as_deref(), Some("https://x.org/x.js"));
        assert_eq!(e.custom_css_url.as_deref(), Some("https://x.org/x.css"));
        assert!(e.has_settings);
    }

    #[test]
    fn test_parse_index_reports_invalid_entries() {
        let payload = format!(
            r#"[{}, {{"name":"no id","site":"s","lang":"en","version":1,"url":"u"}}]"#,
            entry_json("ok", 2)
        );
        let parsed = parse_repo_index(&payload).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.invalid.len(), 1);
        match &parsed.invalid[0] {
            PluginError::EntryInvalid { index, reason } => {
                assert_eq!(*index, 1);
                assert!(reason.contains("id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_index_rejects_non_array() {
        assert!(parse_repo_index(r#"{"plugins": []}"#).is_err());
        assert!(parse_repo_index("not json").is_err());
    }

    #[test]
    fn test_resolve_index_url() {
        assert_eq!(
            resolve_index_url("https://r.io/repo/"),
            "https://r.io/repo/plugins.min.json"
        );
        assert_eq!(
            resolve_index_url("https://r.io/index.json"),
            "https://r.io/index.json"
        );
    }

    #[test]
    fn test_checksum_idempotence() {
        let bytes = b"plugin body";
        let hash = sha256_hex(bytes);
        assert!(verify_sha256(&hash, bytes));
        assert!(verify_sha256(&hash.to_uppercase(), bytes));
        assert!(!verify_sha256(&sha256_hex(b"other"), bytes));
        // 空串期望 = 显式跳过
        assert!(verify_sha256("", bytes));
    }
}
