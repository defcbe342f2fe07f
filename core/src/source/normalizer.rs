//! 章节列表规整：顺序修正、按路径去重、缺名兜底。
//!
//! 顺序修正只对已知漂移的站点生效：用“显式章节号 → 路径中的章节 id →
//! 末尾数字”的级联提取序键，仅当首尾键表明列表为降序时整体反转。

use regex::Regex;

use crate::plugin::overrides::ChapterFallbackPolicy;
use crate::source::ParsedPluginChapter;

/// 章节序已知会漂移（时升时降）的插件
const ORDER_DRIFTING_PLUGIN: &str = "scribblehub";

pub fn normalize_chapters(
    plugin_id: &str,
    chapters: Vec<ParsedPluginChapter>,
    policy: &ChapterFallbackPolicy,
) -> Vec<ParsedPluginChapter> {
    if chapters.is_empty() {
        return chapters;
    }

    let ordered = normalize_order(plugin_id, chapters);
    let mut seen_paths = std::collections::HashSet::new();
    let mut fallback_index = 1usize;
    let mut output = Vec::with_capacity(ordered.len());

    for chapter in ordered {
        let normalized_path = normalize_path(chapter.path.as_deref(), policy);
        if policy.drop_duplicate_chapter_paths {
            if let Some(path) = &normalized_path {
                if !seen_paths.insert(path.clone()) {
                    continue;
                }
            }
        }

        let trimmed_name = chapter
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let normalized_name = match trimmed_name {
            Some(name) => Some(name),
            None => {
                if policy.fill_missing_chapter_names && normalized_path.is_some() {
                    let name = format!("{} {}", policy.chapter_name_prefix, fallback_index);
                    fallback_index += 1;
                    Some(name)
                } else {
                    chapter.name.clone()
                }
            }
        };

        output.push(ParsedPluginChapter {
            name: normalized_name,
            path: normalized_path.or(chapter.path),
            chapter_number: chapter.chapter_number,
        });
    }

    output
}

fn normalize_order(
    plugin_id: &str,
    chapters: Vec<ParsedPluginChapter>,
) -> Vec<ParsedPluginChapter> {
    if !plugin_id.eq_ignore_ascii_case(ORDER_DRIFTING_PLUGIN) || chapters.len() < 2 {
        return chapters;
    }
    let first = match chapter_order(&chapters[0]) {
        Some(v) => v,
        None => return chapters,
    };
    let last = match chapter_order(&chapters[chapters.len() - 1]) {
        Some(v) => v,
        None => return chapters,
    };
    if first > last {
        let mut reversed = chapters;
        reversed.reverse();
        reversed
    } else {
        chapters
    }
}

/// 序键级联：显式章节号 → `/chapter/{n}` → `/read/{book}/{n}` → 末尾数字
fn chapter_order(chapter: &ParsedPluginChapter) -> Option<i64> {
    if let Some(number) = chapter.chapter_number {
        if !number.is_nan() {
            return Some((number * 1_000_000.0) as i64);
        }
    }
    let path = chapter.path.as_deref()?;

    let by_chapter_id = Regex::new(r"(?i)/chapter/(\d+)")
        .ok()
        .and_then(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());
    if by_chapter_id.is_some() {
        return by_chapter_id;
    }

    let by_read_id = Regex::new(r"(?i)/read/\d+/(\d+)")
        .ok()
        .and_then(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());
    if by_read_id.is_some() {
        return by_read_id;
    }

    Regex::new(r"(\d+)/?$")
        .ok()
        .and_then(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

fn normalize_path(path: Option<&str>, policy: &ChapterFallbackPolicy) -> Option<String> {
    let value = path?.trim();
    if value.is_empty() {
        return None;
    }
    if !policy.strip_fragment_from_chapter_path {
        return Some(value.to_string());
    }
    match value.find('#') {
        Some(idx) => Some(value[..idx].to_string()),
        None => Some(value.to_string()),
    }
}
