//! Objective validation: deriving an implicit contract from task text and
//! checking a planner's `done=true` claim against it (Section 4.D).
//!
//! Grounded verbatim in the reference `TaskContractParser` and
//! `PathDiscoveryPolicy`: the regex vocabulary, extension sets, and scoring
//! formula below are not approximations, they are transcriptions.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

const OUTPUT_INTENT_KEYWORDS: &[&str] = &[
    "write",
    "create",
    "generate",
    "save",
    "บันทึก",
    "สร้าง",
    "เขียน",
    "เขียนผลลัพธ์",
    "เขียนผลลง",
    "เขียนลง",
    "ลงไฟล์",
];

const SOURCE_INPUT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "png", "jpg", "jpeg", "tif", "tiff",
    "gif", "bmp",
];

const COMMON_OUTPUT_EXTENSIONS: &[&str] = &[
    "txt", "md", "json", "csv", "html", "htm", "xml", "yaml", "yml", "log", "py", "js", "ts",
    "jsx", "tsx", "css", "scss", "sql", "sh", "bash", "zsh", "bat", "ps1", "ini", "cfg", "conf",
    "toml", "lock", "env", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "png", "jpg",
    "jpeg", "gif", "bmp", "webp", "tif", "tiff", "zip", "gz", "tar", "parquet", "pkl", "pickle",
];

const DELETE_MARKERS: &[&str] = &["delete", "remove", "rm ", "ลบ", "ลบทิ้ง"];

const MODULE_STOPWORDS: &[&str] = &["python", "pip", "script", "ไฟล์", "file", "version", "เวอร์ชัน"];

/// The implicit contract inferred from a task's natural-language text
/// (Section 4.D.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskContract {
    pub required_outputs: Vec<String>,
    pub source_inputs: Vec<String>,
    pub hinted_directories: Vec<String>,
    pub required_absent: Vec<String>,
    pub required_python_modules: Vec<String>,
    pub expected_text_markers: Vec<String>,
}

fn candidate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Za-z0-9_./-]+\.[A-Za-z0-9_]+)").unwrap())
}

fn dedup(rows: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut uniq = Vec::new();
    for item in rows {
        let value = item.trim().replace('\\', "/");
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        uniq.push(value);
    }
    uniq
}

/// Parses task text into a `TaskContract` (Section 4.D.1).
#[derive(Debug, Default)]
pub struct TaskContractParser;

impl TaskContractParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, task: &str) -> TaskContract {
        let text = task.trim();
        if text.is_empty() {
            return TaskContract::default();
        }

        let candidates: Vec<String> = candidate_re()
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
        let source_refs = self.infer_input_file_refs(text, &candidates);

        let lowered = text.to_lowercase();
        let has_output_intent = OUTPUT_INTENT_KEYWORDS.iter().any(|k| lowered.contains(k));

        let mut outputs = Vec::new();
        for token in &candidates {
            let Some(normalized) = Self::normalize_file_token(token) else {
                continue;
            };
            if self.looks_like_code_member_call(text, &normalized) {
                continue;
            }
            if source_refs.contains(&normalized) {
                continue;
            }
            if normalized.ends_with(".py") && self.looks_like_skill_script_input_ref(text, &normalized) {
                continue;
            }
            if !Self::looks_like_workspace_output_candidate(&normalized) {
                continue;
            }
            if has_output_intent {
                outputs.push(normalized);
            }
        }

        let mut sources: Vec<String> = source_refs.into_iter().collect();
        sources.sort();

        let hinted_dirs = self.infer_hinted_directories(text, &sources, &outputs);
        let required_absent = self.infer_required_absent_files(text, &sources, &candidates);
        let required_python_modules = Self::infer_required_python_modules(text);
        let expected_text_markers = Self::infer_expected_text_markers(text);

        TaskContract {
            required_outputs: dedup(outputs),
            source_inputs: dedup(sources),
            hinted_directories: dedup(hinted_dirs),
            required_absent: dedup(required_absent),
            required_python_modules: dedup(required_python_modules),
            expected_text_markers: dedup(expected_text_markers),
        }
    }

    fn normalize_file_token(token: &str) -> Option<String> {
        let mut value = token.trim().replace('\\', "/");
        if value.is_empty() {
            return None;
        }
        if let Some(rest) = value.strip_prefix("./") {
            value = rest.to_string();
        }
        if value.starts_with('/') {
            return None;
        }
        if value.contains("://") || value.starts_with("www.") {
            return None;
        }
        if value.matches('.').count() > 1 && !value.contains('/') {
            return None;
        }
        Some(value)
    }

    fn infer_input_file_refs(&self, text: &str, candidates: &[String]) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for token in candidates {
            let Some(normalized) = Self::normalize_file_token(token) else {
                continue;
            };
            let escaped = regex::escape(token);
            let quoted = format!("[\"'\u{201c}\u{201d}\u{2018}\u{2019}]?\\s*{escaped}\\s*[\"'\u{201c}\u{201d}\u{2018}\u{2019}]?");
            let en_pattern = format!(
                r"(?i)(?:from|read|use|using|input|source|extract(?:ed)?\s+from)\s+{quoted}"
            );
            let th_pattern =
                format!(r"(?i)(?:จาก|อ่าน|ใช้|อินพุต|ไฟล์ต้นฉบับ|จากไฟล์)\s*{quoted}");
            let matched = Regex::new(&en_pattern).map(|r| r.is_match(text)).unwrap_or(false)
                || Regex::new(&th_pattern).map(|r| r.is_match(text)).unwrap_or(false);
            if matched {
                refs.insert(normalized);
                continue;
            }

            let lowered = text.to_lowercase();
            let has_output_intent = OUTPUT_INTENT_KEYWORDS.iter().any(|k| lowered.contains(k));
            let ext = Path::new(&normalized)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if has_output_intent && SOURCE_INPUT_EXTENSIONS.contains(&ext.as_str()) {
                refs.insert(normalized);
            }
        }
        refs
    }

    fn looks_like_workspace_output_candidate(token: &str) -> bool {
        let value = token.trim().to_lowercase();
        if value.is_empty() {
            return false;
        }
        let ext = Path::new(&value)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        if ext.is_empty() {
            return false;
        }
        if !value.contains('/') {
            return COMMON_OUTPUT_EXTENSIONS.contains(&ext.as_str());
        }
        true
    }

    fn looks_like_skill_script_input_ref(&self, task: &str, token: &str) -> bool {
        let lowered = token.trim().to_lowercase().replace('\\', "/");
        if lowered.is_empty() {
            return false;
        }
        if lowered.starts_with("skillpacks/")
            || lowered.starts_with("examples/skills/")
            || lowered.starts_with(".agent_skill_exec/")
        {
            return true;
        }
        let escaped = regex::escape(token);
        let pattern = format!(r"(?i)(?:^|\s)python(?:3)?\s+{escaped}(?:\s|$)");
        Regex::new(&pattern).map(|r| r.is_match(task)).unwrap_or(false)
    }

    fn infer_hinted_directories(&self, text: &str, source_inputs: &[String], outputs: &[String]) -> Vec<String> {
        let mut rows = Vec::new();
        for value in source_inputs.iter().chain(outputs.iter()) {
            if let Some(parent) = Path::new(value).parent() {
                let parent_str = parent.to_string_lossy().replace('\\', "/");
                if !parent_str.is_empty() && parent_str != "." {
                    rows.push(parent_str);
                }
            }
        }

        static DIR_RE: OnceLock<Regex> = OnceLock::new();
        let dir_re = DIR_RE
            .get_or_init(|| Regex::new(r"(?i)\b(?:in|from|under|inside)\s+([A-Za-z0-9_/-]{2,})").unwrap());
        for cap in dir_re.captures_iter(text) {
            let candidate = cap[1].trim().trim_matches('/').replace('\\', "/");
            if candidate.contains('/')
                || candidate.ends_with("input")
                || candidate.ends_with("inputs")
                || candidate.ends_with("output")
                || candidate.ends_with("outputs")
                || candidate.ends_with("tmp")
                || candidate.ends_with("data")
            {
                rows.push(candidate);
            }
        }

        static TH_DIR_RE: OnceLock<Regex> = OnceLock::new();
        let th_dir_re = TH_DIR_RE
            .get_or_init(|| Regex::new(r"(?i)(?:โฟลเดอร์|ในโฟลเดอร์)\s*([A-Za-z0-9_/-]{2,})").unwrap());
        for cap in th_dir_re.captures_iter(text) {
            let candidate = cap[1].trim().trim_matches('/').replace('\\', "/");
            if !candidate.is_empty() {
                rows.push(candidate);
            }
        }
        rows
    }

    fn infer_required_absent_files(&self, text: &str, source_inputs: &[String], candidates: &[String]) -> Vec<String> {
        let lowered = text.to_lowercase();
        if !DELETE_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Vec::new();
        }
        let mut rows: Vec<String> = source_inputs.to_vec();
        for token in candidates {
            let Some(normalized) = Self::normalize_file_token(token) else {
                continue;
            };
            if self.looks_like_code_member_call(text, &normalized) {
                continue;
            }
            if normalized.ends_with(".py") && self.looks_like_skill_script_input_ref(text, &normalized) {
                continue;
            }
            if !Self::looks_like_workspace_output_candidate(&normalized) {
                continue;
            }
            rows.push(normalized);
        }
        rows
    }

    fn looks_like_code_member_call(&self, text: &str, token: &str) -> bool {
        let candidate = token.trim();
        if candidate.is_empty() || candidate.contains('/') {
            return false;
        }
        let escaped = regex::escape(candidate);
        let pattern = format!(r"(?:^|[^A-Za-z0-9_]){escaped}\s*\(");
        Regex::new(&pattern).map(|r| r.is_match(text)).unwrap_or(false)
    }

    fn infer_required_python_modules(text: &str) -> Vec<String> {
        let mut rows = Vec::new();
        let patterns = [
            r"(?i)\bpip(?:3)?\s+install\s+([A-Za-z0-9_.-]+)",
            r"(?i)(?:ติดตั้ง\s*package|ติดตั้งแพ็กเกจ)\s+([A-Za-z0-9_.-]+)",
            r"(?i)\bimport\s+([A-Za-z0-9_.-]+)",
            r"(?i)(?:print|พิมพ์).{0,30}(?:version|เวอร์ชัน)\s+([A-Za-z0-9_.-]+)",
            r"(?i)(?:ใช้|use)\s+([A-Za-z][A-Za-z0-9_.-]{1,40})",
        ];
        for pattern in patterns {
            if let Ok(re) = Regex::new(pattern) {
                for cap in re.captures_iter(text) {
                    rows.push(cap[1].trim().to_lowercase());
                }
            }
        }
        rows.into_iter().filter(|r| !r.is_empty() && !MODULE_STOPWORDS.contains(&r.as_str())).collect()
    }

    fn infer_expected_text_markers(text: &str) -> Vec<String> {
        let mut rows = Vec::new();
        let quote_pattern = "(?i)(?:ข้อความ|มีข้อความ|contains?|must contain|มีคำว่า)\\s*[\"'\u{201c}\u{201d}\u{2018}\u{2019}]([^\"'\u{201c}\u{201d}\u{2018}\u{2019}]{1,120})[\"'\u{201c}\u{201d}\u{2018}\u{2019}]";
        if let Ok(re) = Regex::new(quote_pattern) {
            for cap in re.captures_iter(text) {
                rows.push(cap[1].trim().to_string());
            }
        }
        let version_pattern = r"(?i)(?:print|พิมพ์).{0,30}(?:version|เวอร์ชัน)\s+([A-Za-z0-9_.-]+)";
        if let Ok(re) = Regex::new(version_pattern) {
            for cap in re.captures_iter(text) {
                rows.push(cap[1].trim().to_string());
            }
        }
        rows.into_iter().filter(|r| !r.is_empty()).collect()
    }
}

/// Finds on-disk candidates for a missing inferred output (Section 4.D.2).
#[derive(Debug, Default)]
pub struct PathDiscoveryPolicy;

impl PathDiscoveryPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Walks `workspace` for files sharing `missing_path`'s basename and
    /// ranks them by the scoring rule in Section 4.D.2.
    pub fn find_candidates(
        &self,
        workspace: &Path,
        missing_path: &str,
        hinted_directories: &[String],
        limit: usize,
    ) -> Vec<String> {
        let text = missing_path.trim().replace('\\', "/");
        if text.is_empty() {
            return Vec::new();
        }
        let src = Path::new(&text);
        let Some(basename) = src.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };
        let basename = basename.to_lowercase();
        let hinted: Vec<String> = hinted_directories
            .iter()
            .map(|h| h.trim().replace('\\', "/").trim_matches('/').to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        let parent_parts: Vec<String> = src
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        let missing_ext = src
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let mut scored: Vec<(i64, String)> = Vec::new();
        for entry in walk_files(workspace) {
            let Ok(rel) = entry.strip_prefix(workspace) else {
                continue;
            };
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if rel_str.starts_with(".agent/") {
                continue;
            }
            let Some(file_name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.to_lowercase() != basename {
                continue;
            }

            let mut score: i64 = 100;
            let rel_lower = rel_str.to_lowercase();
            let entry_ext = entry
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if !missing_ext.is_empty() && entry_ext == missing_ext {
                score += 20;
            }
            if !parent_parts.is_empty() && parent_parts.iter().all(|p| rel_lower.contains(p.as_str())) {
                score += 30;
            }
            if hinted.iter().any(|h| rel_lower.starts_with(&format!("{h}/")) || rel_lower == *h) {
                score += 60;
            }
            let depth = rel.components().count() as i64;
            score += (10 - depth).max(0);
            scored.push((score, rel_str));
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(limit.max(1)).map(|(_, rel)| rel).collect()
    }
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                out.push(path);
            }
        }
    }
    out
}
