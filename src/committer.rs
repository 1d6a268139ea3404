//! Turns a finished task's raw result into a [`DocumentResult`] and the
//! commit payload that persists it.
//!
//! Category precedence:
//!
//! 1. a category reported by the server (`category`, `category_name`,
//!    `categoryName`, `llm_meta.llm_data.category_name`);
//! 2. the last `카테고리:` / `분류:` / `Category:` / `Tags:` line of the summary;
//! 3. the category inferred from the upload path.
//!
//! Whatever wins is normalized to exactly two `main/sub` segments.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::models::{extension_of, CommitRequest, DocumentResult, UploadItem};

const FILE_SEPARATOR: &str = "<|file_separator|>";
const MAIN_PLACEHOLDER: &str = "기타";
const SUB_PLACEHOLDER: &str = "일반";
const MAX_TAGS: usize = 8;
const FALLBACK_TAG: &str = SUB_PLACEHOLDER;

fn label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*(?:카테고리|분류|Category|Tags?)\s*[:：]\s*(.+?)\s*$")
            .expect("label regex is valid")
    })
}

fn keyword_groups() -> &'static [(Regex, &'static str)] {
    static GROUPS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    GROUPS.get_or_init(|| {
        [
            (r"(?i)(법률|심사보고|의결|위원회|법안|국회|law|legal|committee)", "법률/행정"),
            (r"(?i)(농림|축산|수산|해양|어업|농업|agricultur|fisher)", "농림축수산"),
            (r"(?i)(예산|비용|원가|금액|억원|조원|회계|기금|budget|cost)", "재정/예산"),
            (r"(?i)(프로젝트|시스템|플랫폼|ai|ocr|모델|데이터|project|platform|data)", "IT/프로젝트"),
            (r"(?i)(안전|품질|인증|규정|정책|safety|quality|policy)", "정책/규정"),
            (r"(?i)(보고서|요약|결론|결과|report|summary)", "보고/결과"),
        ]
        .into_iter()
        .map(|(pattern, tag)| (Regex::new(pattern).expect("keyword regex is valid"), tag))
        .collect()
    })
}

/// Builds the item's result from the task's `result` object.
pub fn extract_outcome(result: &Value, default_category: &str) -> DocumentResult {
    let summary = summary_text(result);
    let label = last_label(&summary);

    let category = server_category(result)
        .or_else(|| {
            label
                .as_deref()
                .map(|l| split_tags(&clean_label(l)).join("/"))
                .filter(|c| !c.is_empty())
        })
        .unwrap_or_else(|| default_category.to_string());

    let tags = match label.as_deref().map(split_tags) {
        Some(tags) if !tags.is_empty() => tags,
        _ => keyword_tags(&summary),
    };

    DocumentResult {
        summary,
        category: normalize_two_levels(&category),
        tags,
        server_file_id: server_file_id(result),
        raw: result.clone(),
    }
}

pub fn summary_text(result: &Value) -> String {
    ["llmSummary", "summary", "llm_summary"]
        .iter()
        .find_map(|k| result.get(*k).and_then(|v| v.as_str()))
        .unwrap_or("")
        .replace(FILE_SEPARATOR, "")
        .trim()
        .to_string()
}

fn server_category(result: &Value) -> Option<String> {
    let direct = ["category", "category_name", "categoryName"]
        .iter()
        .find_map(|k| result.get(*k).and_then(|v| v.as_str()));
    direct
        .or_else(|| {
            result
                .pointer("/llm_meta/llm_data/category_name")
                .and_then(|v| v.as_str())
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Right-hand side of the last label line, brackets stripped.
fn last_label(summary: &str) -> Option<String> {
    let caps = label_re().captures_iter(summary).last()?;
    let rhs = caps.get(1)?.as_str();
    let trimmed = rhs
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')'])
        .trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn clean_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '\'' | '“' | '”' | '‘' | '’' | '»'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn split_tags(label: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    label
        .split([',', '|', '/', '·', '•', '>'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .take(MAX_TAGS)
        .map(str::to_string)
        .collect()
}

/// Keyword-based tags used when the summary carries no label line.
pub fn keyword_tags(text: &str) -> Vec<String> {
    let tags: Vec<String> = keyword_groups()
        .iter()
        .filter(|(re, _)| re.is_match(text))
        .map(|(_, tag)| tag.to_string())
        .collect();
    if tags.is_empty() {
        vec![FALLBACK_TAG.to_string()]
    } else {
        tags
    }
}

/// `"a / b / c"` → `"a/b"`, `"a"` → `"a/일반"`, `""` → `"기타/일반"`.
pub fn normalize_two_levels(category: &str) -> String {
    let parts: Vec<&str> = category
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match parts.as_slice() {
        [] => format!("{}/{}", MAIN_PLACEHOLDER, SUB_PLACEHOLDER),
        [main] => format!("{}/{}", main, SUB_PLACEHOLDER),
        [main, sub, ..] => format!("{}/{}", main, sub),
    }
}

/// `id`, else the last path segment of `outDir`.
pub fn server_file_id(result: &Value) -> Option<String> {
    if let Some(id) = result.get("id") {
        match id {
            Value::String(s) if !s.is_empty() => return Some(s.clone()),
            Value::Number(n) => return Some(n.to_string()),
            _ => {}
        }
    }
    let out_dir = ["outDir", "outdir"]
        .iter()
        .find_map(|k| result.get(*k).and_then(|v| v.as_str()))?;
    out_dir
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Commit payload for a finished item. `None` until the item has a task id.
pub fn build_commit_request(item: &UploadItem) -> Option<CommitRequest> {
    let task_id = item.task_id.clone()?;
    let ext = extension_of(&item.file.name);
    let changed_filename = if item.title.is_empty() {
        item.file.name.clone()
    } else if ext.is_empty() || item.title.to_lowercase().ends_with(&ext) {
        item.title.clone()
    } else {
        format!("{}{}", item.title, ext)
    };
    Some(CommitRequest {
        batch_id: item.batch_id.clone(),
        task_id,
        original_filename: item.file.name.clone(),
        changed_filename,
        file_size_bytes: item.file.size,
        title: item.title.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileSource;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn server_category_wins() {
        let r = extract_outcome(
            &json!({"llmSummary": "본문\n카테고리: 재정/예산", "category_name": "법률 / 국회"}),
            "docs",
        );
        assert_eq!(r.category, "법률/국회");
        assert_eq!(r.summary, "본문\n카테고리: 재정/예산");
    }

    #[test]
    fn nested_llm_meta_category() {
        let r = extract_outcome(
            &json!({"llm_meta": {"llm_data": {"category_name": "IT"}}}),
            "docs",
        );
        assert_eq!(r.category, "IT/일반");
    }

    #[test]
    fn last_label_line_is_used() {
        let summary = "요약입니다<|file_separator|>\nCategory: first\n분류: [정책 / 규정 > 안전]\n";
        let r = extract_outcome(&json!({"summary": summary}), "docs");
        assert_eq!(r.category, "정책/규정");
        assert_eq!(r.tags, vec!["정책", "규정", "안전"]);
        assert!(!r.summary.contains("file_separator"));
    }

    #[test]
    fn path_default_when_nothing_else() {
        let r = extract_outcome(&json!({"llm_summary": "국회 예산 보고서"}), "Uncategorized");
        assert_eq!(r.category, "Uncategorized/일반");
        assert_eq!(r.tags, vec!["법률/행정", "재정/예산", "보고/결과"]);
    }

    #[test]
    fn keyword_fallback_default_tag() {
        assert_eq!(keyword_tags("nothing relevant here"), vec!["일반"]);
    }

    #[test]
    fn tags_are_deduplicated_and_capped() {
        let tags = split_tags("a, b, a | c / d · e • f > g, h, i, j");
        assert_eq!(tags, vec!["a", "b", "c", "d", "e", "f", "g", "h"]);
    }

    #[test]
    fn normalize_two_levels_cases() {
        assert_eq!(normalize_two_levels(""), "기타/일반");
        assert_eq!(normalize_two_levels(" / "), "기타/일반");
        assert_eq!(normalize_two_levels("a"), "a/일반");
        assert_eq!(normalize_two_levels("a / b / c"), "a/b");
    }

    #[test]
    fn placeholders_match_fallback_tag() {
        let r = extract_outcome(&json!({"llmSummary": "nothing relevant here"}), "");
        assert_eq!(r.category, "기타/일반");
        assert_eq!(r.tags, vec!["일반"]);
    }

    #[test]
    fn file_id_from_id_or_out_dir() {
        assert_eq!(server_file_id(&json!({"id": "abc"})).as_deref(), Some("abc"));
        assert_eq!(server_file_id(&json!({"id": 7})).as_deref(), Some("7"));
        assert_eq!(
            server_file_id(&json!({"outDir": "/data/out/job-42/"})).as_deref(),
            Some("job-42")
        );
        assert_eq!(
            server_file_id(&json!({"outdir": "C:\\out\\job-9"})).as_deref(),
            Some("job-9")
        );
        assert!(server_file_id(&json!({})).is_none());
    }

    #[test]
    fn commit_request_restores_extension() {
        let file = FileSource::from_bytes("report.pdf", "", Bytes::from_static(b"x"), 0);
        let mut item = UploadItem::new(file, "Uncategorized".into(), "Quarterly".into());
        assert!(build_commit_request(&item).is_none());

        item.task_id = Some("t1".into());
        item.batch_id = Some("b1".into());
        let req = build_commit_request(&item).unwrap();
        assert_eq!(req.changed_filename, "Quarterly.pdf");
        assert_eq!(req.original_filename, "report.pdf");
        assert_eq!(req.file_size_bytes, 1);
        assert_eq!(req.batch_id.as_deref(), Some("b1"));
    }
}
