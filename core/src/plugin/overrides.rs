//! 运行时覆写：域名别名、脚本补丁、章节兜底策略。
//!
//! 覆写是宿主侧的兼容垫片：不重新发布插件就能修掉选择器漂移/站点换域名。
//! 按小写插件 id 查找；未配置的插件得到默认覆写（无别名、无补丁、默认策略），
//! 不视为错误，因为覆写本来就是可选配置。

use serde::{Deserialize, Serialize};

/// 覆写配置文档：`{entries: [RuntimeOverride]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOverrides {
    #[serde(default)]
    pub entries: Vec<RuntimeOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOverride {
    pub plugin_id: String,
    #[serde(default = "default_override_version")]
    pub version: i64,
    #[serde(default)]
    pub domain_aliases: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub script_patches: Vec<ScriptPatch>,
    #[serde(default)]
    pub chapter_fallback_policy: ChapterFallbackPolicy,
}

fn default_override_version() -> i64 {
    1
}

impl RuntimeOverride {
    pub fn empty(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            version: default_override_version(),
            domain_aliases: Default::default(),
            script_patches: Vec::new(),
            chapter_fallback_policy: ChapterFallbackPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptPatch {
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub ignore_case: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterFallbackPolicy {
    #[serde(default = "default_true")]
    pub fill_missing_chapter_names: bool,
    #[serde(default = "default_true")]
    pub drop_duplicate_chapter_paths: bool,
    #[serde(default = "default_chapter_prefix")]
    pub chapter_name_prefix: String,
    #[serde(default = "default_true")]
    pub strip_fragment_from_chapter_path: bool,
}

fn default_true() -> bool {
    true
}

fn default_chapter_prefix() -> String {
    "Chapter".to_string()
}

impl Default for ChapterFallbackPolicy {
    fn default() -> Self {
        Self {
            fill_missing_chapter_names: true,
            drop_duplicate_chapter_paths: true,
            chapter_name_prefix: default_chapter_prefix(),
            strip_fragment_from_chapter_path: true,
        }
    }
}

impl RuntimeOverrides {
    /// 解析覆写文档；格式不合法时降级为空集合而不是启动失败。
    pub fn from_json(payload: Option<&str>) -> Self {
        let payload = match payload {
            Some(p) if !p.trim().is_empty() => p,
            _ => return Self::default(),
        };
        serde_json::from_str(payload).unwrap_or_default()
    }

    /// 同一插件 id 存在多条覆写时（例如分阶段迁移）取 `version` 最大的一条；
    /// 版本并列取声明顺序靠前者。查找结果只取决于 id 与集合内容，与列表顺序无关。
    pub fn for_plugin(&self, plugin_id: &str) -> RuntimeOverride {
        let wanted = plugin_id.to_lowercase();
        let mut best: Option<&RuntimeOverride> = None;
        for entry in &self.entries {
            if entry.plugin_id.to_lowercase() != wanted {
                continue;
            }
            match best {
                Some(cur) if cur.version >= entry.version => {}
                _ => best = Some(entry),
            }
        }
        best.cloned().unwrap_or_else(|| RuntimeOverride::empty(plugin_id))
    }
}

/// 域名别名：按“最长归一化前缀”改写 URL 的 scheme+host+path 前缀。
pub struct DomainAliasResolver<'a> {
    overrides: &'a RuntimeOverrides,
}

impl<'a> DomainAliasResolver<'a> {
    pub fn new(overrides: &'a RuntimeOverrides) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, plugin_id: &str, url: &str) -> String {
        resolve_alias(&self.overrides.for_plugin(plugin_id), url)
    }
}

/// 单条覆写内的别名改写（桥接层持有本插件覆写时用这个，避免重复查找）
pub fn resolve_alias(override_entry: &RuntimeOverride, url: &str) -> String {
    let input = url.trim();
    if input.is_empty() || override_entry.domain_aliases.is_empty() {
        return url.to_string();
    }

    let mut normalized: Vec<(String, String)> = override_entry
        .domain_aliases
        .iter()
        .map(|(from, to)| (normalize_prefix(from), normalize_prefix(to)))
        .filter(|(from, to)| !from.is_empty() && !to.is_empty())
        .collect();
    normalized.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    for (from, to) in normalized {
        let matched = input
            .get(..from.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(&from))
            .unwrap_or(false);
        if matched {
            let suffix = &input[from.len()..];
            let target = to.trim_end_matches('/');
            return format!("{}{}", target, suffix);
        }
    }

    input.to_string()
}

fn normalize_prefix(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// 脚本补丁：按声明顺序应用于脚本源文本（加载前）。
/// 字面量补丁做精确/忽略大小写的子串替换；正则补丁做全量 replace-all。
pub struct ScriptPatchApplier<'a> {
    overrides: &'a RuntimeOverrides,
}

impl<'a> ScriptPatchApplier<'a> {
    pub fn new(overrides: &'a RuntimeOverrides) -> Self {
        Self { overrides }
    }

    pub fn apply(&self, plugin_id: &str, script: &str) -> String {
        apply_patches(&self.overrides.for_plugin(plugin_id), script)
    }
}

pub fn apply_patches(override_entry: &RuntimeOverride, script: &str) -> String {
    let patches = &override_entry.script_patches;
    if patches.is_empty() {
        return script.to_string();
    }

    let mut result = script.to_string();
    for patch in patches {
        if patch.pattern.trim().is_empty() {
            continue;
        }
        if patch.regex {
            let pattern = if patch.ignore_case {
                format!("(?i){}", patch.pattern)
            } else {
                patch.pattern.clone()
            };
            if let Ok(re) = regex::Regex::new(&pattern) {
                result = re.replace_all(&result, patch.replacement.as_str()).into_owned();
            }
        } else if patch.ignore_case {
            let pattern = format!("(?i){}", regex::escape(&patch.pattern));
            if let Ok(re) = regex::Regex::new(&pattern) {
                // 字面量替换：屏蔽替换串里的 $ 捕获组语法
                result = re
                    .replace_all(&result, regex::NoExpand(patch.replacement.as_str()))
                    .into_owned();
            }
        } else {
            result = result.replace(&patch.pattern, &patch.replacement);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn override_with_version(id: &str, version: i64) -> RuntimeOverride {
        RuntimeOverride {
            version,
            ..RuntimeOverride::empty(id)
        }
    }

    #[test]
    fn test_resolution_picks_max_version_order_independent() {
        let a = override_with_version("Site", 1);
        let b = override_with_version("site", 3);
        let c = override_with_version("SITE", 2);

        for entries in [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
            vec![b.clone(), c.clone(), a.clone()],
        ] {
            let overrides = RuntimeOverrides { entries };
            assert_eq!(overrides.for_plugin("site").version, 3);
        }
    }

    #[test]
    fn test_resolution_tie_keeps_first_and_absent_yields_default() {
        let mut first = override_with_version("x", 2);
        first.chapter_fallback_policy.chapter_name_prefix = "First".to_string();
        let second = override_with_version("x", 2);
        let overrides = RuntimeOverrides {
            entries: vec![first, second],
        };
        assert_eq!(
            overrides.for_plugin("x").chapter_fallback_policy.chapter_name_prefix,
            "First"
        );

        let missing = overrides.for_plugin("unknown");
        assert!(missing.domain_aliases.is_empty());
        assert!(missing.script_patches.is_empty());
        assert_eq!(missing.version, 1);
    }

    #[test]
    fn test_malformed_document_degrades_to_empty() {
        assert!(RuntimeOverrides::from_json(Some("{broken")).entries.is_empty());
        assert!(RuntimeOverrides::from_json(None).entries.is_empty());
        assert!(RuntimeOverrides::from_json(Some("  ")).entries.is_empty());
    }

    #[test]
    fn test_alias_longest_prefix_wins() {
        let mut entry = RuntimeOverride::empty("p");
        entry
            .domain_aliases
            .insert("https://a.com".to_string(), "https://b.com".to_string());
        entry.domain_aliases.insert(
            "https://a.com/sub/".to_string(),
            "https://c.com/mirror".to_string(),
        );

        assert_eq!(
            resolve_alias(&entry, "https://a.com/sub/ch-1"),
            "https://c.com/mirror/ch-1"
        );
        assert_eq!(
            resolve_alias(&entry, "HTTPS://A.COM/other"),
            "https://b.com/other"
        );
        assert_eq!(resolve_alias(&entry, "https://x.com/keep"), "https://x.com/keep");
    }

    #[test]
    fn test_patch_literal_regex_and_ignore_case() {
        let mut entry = RuntimeOverride::empty("p");
        entry.script_patches = vec![
            ScriptPatch {
                pattern: ".old-list".to_string(),
                replacement: ".new-list".to_string(),
                regex: false,
                ignore_case: false,
            },
            ScriptPatch {
                pattern: "SELECT\\(\"(\\w+)\"\\)".to_string(),
                replacement: "select(\"$1\")".to_string(),
                regex: true,
                ignore_case: true,
            },
            ScriptPatch {
                pattern: "chapterROW".to_string(),
                replacement: "chapter_row".to_string(),
                regex: false,
                ignore_case: true,
            },
        ];

        let script = r#"let a = q(".old-list"); Select("div"); let b = CHAPTERrow;"#;
        let patched = apply_patches(&entry, script);
        assert_eq!(
            patched,
            r#"let a = q(".new-list"); select("div"); let b = chapter_row;"#
        );
    }
}
