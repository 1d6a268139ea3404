//! The upload queue: ordered per-file records with validation and dedup.
//!
//! New items are inserted at the front (most recent first). Within one
//! `add_files` call the input order is kept. Files that fail validation are
//! still inserted, in [`ItemStatus::Error`], so the user sees why they were
//! not uploaded; they never reach the uploader.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::archive;
use crate::config::UploadConfig;
use crate::models::{pretty_bytes, stem_of, FileKey, FilePayload, FileSource, ItemStatus, UploadItem};

pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// A file ready for validation, or an archive that was rejected whole.
pub type Candidate = Result<FileSource, Box<UploadItem>>;

/// Expands every ZIP in `files`. Reads archives from disk, so async callers
/// run it on a blocking thread.
pub fn expand_all(files: Vec<FileSource>, config: &UploadConfig) -> Vec<Candidate> {
    files.into_iter().flat_map(|f| expand(f, config)).collect()
}

#[derive(Debug, Default)]
pub struct UploadQueue {
    items: Vec<UploadItem>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds files, expanding ZIP archives first. Returns the ids of the
    /// inserted items (including rejected ones) in display order.
    pub fn add_files(&mut self, files: Vec<FileSource>, config: &UploadConfig) -> Vec<String> {
        self.insert(expand_all(files, config), config)
    }

    /// Validates, dedups and inserts already-expanded candidates.
    pub fn insert(&mut self, candidates: Vec<Candidate>, config: &UploadConfig) -> Vec<String> {
        let mut seen: HashSet<FileKey> = self.items.iter().map(|it| it.file.key()).collect();
        let mut to_add: Vec<UploadItem> = Vec::new();

        for expanded in candidates {
            let candidate = match expanded {
                Ok(f) => f,
                Err(rejected) => {
                    if seen.insert(rejected.file.key()) {
                        to_add.push(*rejected);
                    }
                    continue;
                }
            };
            if !seen.insert(candidate.key()) {
                tracing::debug!(name = %candidate.name, "skipping duplicate file");
                continue;
            }
            to_add.push(build_item(candidate, config));
        }

        let ids = to_add.iter().map(|it| it.id.clone()).collect();
        if !to_add.is_empty() {
            to_add.append(&mut self.items);
            self.items = to_add;
        }
        ids
    }

    /// Stops tracking an item entirely.
    pub fn remove(&mut self, id: &str) -> Option<UploadItem> {
        let pos = self.items.iter().position(|it| it.id == id)?;
        Some(self.items.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&UploadItem> {
        self.items.iter().find(|it| it.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut UploadItem> {
        self.items.iter_mut().find(|it| it.id == id)
    }

    pub fn find_by_task(&self, task_id: &str) -> Option<&UploadItem> {
        self.items
            .iter()
            .find(|it| it.task_id.as_deref() == Some(task_id))
    }

    pub fn items(&self) -> &[UploadItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Idle items in display order.
    pub fn idle_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|it| it.status == ItemStatus::Idle)
            .map(|it| it.id.clone())
            .collect()
    }
}

/// Expands one selected file into candidates. Archives that cannot be
/// opened come back as a single rejected item.
fn expand(file: FileSource, config: &UploadConfig) -> Vec<Candidate> {
    if !archive::is_zip_name(&file.name) {
        return vec![Ok(file)];
    }
    if file.size > config.max_size_bytes() {
        let msg = too_large_message(file.size, config);
        return vec![Err(Box::new(reject(file, msg)))];
    }

    let bytes = match &file.payload {
        FilePayload::Memory(b) => Ok(b.to_vec()),
        FilePayload::Path(p) => std::fs::read(p),
    };
    let expanded = match bytes {
        Ok(b) => archive::expand_zip(&b).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match expanded {
        Ok(files) => files.into_iter().map(Ok).collect(),
        Err(e) => {
            tracing::warn!(name = %file.name, error = %e, "failed to expand archive");
            vec![Err(Box::new(reject(file, format!("could not open archive: {}", e))))]
        }
    }
}

fn build_item(file: FileSource, config: &UploadConfig) -> UploadItem {
    match validate(&file, config) {
        Some(msg) => reject(file, msg),
        None => {
            let category = infer_category(&file.relative_path);
            let title = stem_of(&file.name);
            UploadItem::new(file, category, title)
        }
    }
}

fn reject(file: FileSource, msg: String) -> UploadItem {
    let category = infer_category(&file.relative_path);
    let title = stem_of(&file.name);
    UploadItem::rejected(file, category, title, msg)
}

/// Returns a user-facing message when the file must not be uploaded.
pub fn validate(file: &FileSource, config: &UploadConfig) -> Option<String> {
    let ext = file.extension();
    if !config.is_allowed_extension(&ext) {
        let shown = if ext.is_empty() { "none" } else { ext.as_str() };
        return Some(format!("extension not allowed ({})", shown));
    }
    if file.size > config.max_size_bytes() {
        return Some(too_large_message(file.size, config));
    }
    None
}

fn too_large_message(size: u64, config: &UploadConfig) -> String {
    format!(
        "file too large ({} > {} MB)",
        pretty_bytes(size),
        config.max_size_mb
    )
}

/// Top-level folder of the relative path, or [`DEFAULT_CATEGORY`] for a
/// loose file.
pub fn infer_category(relative_path: &str) -> String {
    let parts: Vec<&str> = relative_path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() >= 2 {
        parts[0].to_string()
    } else {
        DEFAULT_CATEGORY.to_string()
    }
}

/// Turns command-line paths into file sources.
///
/// Plain files are taken as-is with an empty relative path. Directories are
/// walked; each file's relative path starts with the directory's own name,
/// so the directory becomes the category. Inside directories only allowed
/// extensions are collected.
pub fn scan_paths(paths: &[PathBuf], config: &UploadConfig) -> Result<Vec<FileSource>> {
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/.DS_Store".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut out = Vec::new();
    for path in paths {
        if path.is_file() {
            out.push(FileSource::from_path(path, "")?);
            continue;
        }
        if !path.is_dir() {
            bail!("Path does not exist: {}", path.display());
        }
        out.extend(scan_dir(path, &exclude_set, config)?);
    }
    Ok(out)
}

fn scan_dir(root: &Path, exclude_set: &GlobSet, config: &UploadConfig) -> Result<Vec<FileSource>> {
    let base = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    let root_name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let inner = path.strip_prefix(root).unwrap_or(path);
        let inner_str = inner.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&inner_str) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let ext = crate::models::extension_of(&name);
        if !config.is_allowed_extension(&ext) && !archive::is_zip_name(&name) {
            continue;
        }

        let relative = if root_name.is_empty() {
            inner_str
        } else {
            format!("{}/{}", root_name, inner_str)
        };
        files.push(FileSource::from_path(path, &relative)?);
    }
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use bytes::Bytes;

    fn mem(name: &str, rel: &str, size: usize) -> FileSource {
        FileSource::from_bytes(name, rel, Bytes::from(vec![0u8; size]), 1_700_000_000_000)
    }

    #[test]
    fn loose_pdf_is_idle_and_uncategorized() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        let ids = q.add_files(vec![mem("report.pdf", "", 2 * 1024 * 1024)], &config);
        assert_eq!(ids.len(), 1);
        let item = q.get(&ids[0]).unwrap();
        assert_eq!(item.status, ItemStatus::Idle);
        assert_eq!(item.category_name, "Uncategorized");
        assert_eq!(item.title, "report");
        assert_eq!(item.progress, 0);
    }

    #[test]
    fn disallowed_extension_becomes_error_item() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        let ids = q.add_files(vec![mem("virus.exe", "", 10)], &config);
        let item = q.get(&ids[0]).unwrap();
        assert_eq!(item.status, ItemStatus::Error);
        assert!(item.error.as_deref().unwrap().contains(".exe"));
    }

    #[test]
    fn oversized_file_becomes_error_item() {
        let mut q = UploadQueue::new();
        let mut config = UploadConfig::default();
        config.max_size_mb = 1;
        let ids = q.add_files(vec![mem("big.pdf", "", 1024 * 1024 + 1)], &config);
        let item = q.get(&ids[0]).unwrap();
        assert_eq!(item.status, ItemStatus::Error);
        assert!(item.error.as_deref().unwrap().contains("too large"));
        assert!(q.idle_ids().is_empty());
    }

    #[test]
    fn duplicates_are_skipped_across_and_within_calls() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        q.add_files(vec![mem("a.pdf", "docs/a.pdf", 10)], &config);
        let ids = q.add_files(
            vec![
                mem("a.pdf", "docs/a.pdf", 10),
                mem("b.pdf", "", 10),
                mem("b.pdf", "", 10),
            ],
            &config,
        );
        assert_eq!(ids.len(), 1);
        assert_eq!(q.len(), 2);

        let keys: HashSet<FileKey> = q.items().iter().map(|it| it.file.key()).collect();
        assert_eq!(keys.len(), q.len());
    }

    #[test]
    fn newest_items_come_first() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        q.add_files(vec![mem("old.pdf", "", 10)], &config);
        q.add_files(vec![mem("new1.pdf", "", 10), mem("new2.pdf", "", 10)], &config);
        let names: Vec<&str> = q.items().iter().map(|it| it.file.name.as_str()).collect();
        assert_eq!(names, vec!["new1.pdf", "new2.pdf", "old.pdf"]);
    }

    #[test]
    fn zip_expands_into_one_item_per_file() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        let zip = build_zip(&[("a.pdf", b"pdf"), ("b/c.docx", b"docx")]);
        let archive = FileSource::from_bytes("drop.zip", "", Bytes::from(zip), 0);
        let ids = q.add_files(vec![archive], &config);
        assert_eq!(ids.len(), 2);
        let first = q.get(&ids[0]).unwrap();
        let second = q.get(&ids[1]).unwrap();
        assert_eq!(first.file.name, "a.pdf");
        assert_eq!(first.category_name, "Uncategorized");
        assert_eq!(second.file.name, "c.docx");
        assert_eq!(second.category_name, "b");
        assert_eq!(second.title, "c");
    }

    #[test]
    fn same_zip_twice_adds_nothing_new() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        let zip = Bytes::from(build_zip(&[("x/y.pdf", b"1234")]));
        q.add_files(vec![FileSource::from_bytes("d.zip", "", zip.clone(), 0)], &config);
        let ids = q.add_files(vec![FileSource::from_bytes("d.zip", "", zip, 0)], &config);
        assert!(ids.is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn broken_zip_is_rejected_not_dropped() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        let ids = q.add_files(
            vec![FileSource::from_bytes("bad.zip", "", Bytes::from_static(b"nope"), 0)],
            &config,
        );
        assert_eq!(ids.len(), 1);
        assert_eq!(q.get(&ids[0]).unwrap().status, ItemStatus::Error);
    }

    #[test]
    fn remove_drops_item() {
        let mut q = UploadQueue::new();
        let config = UploadConfig::default();
        let ids = q.add_files(vec![mem("a.pdf", "", 1)], &config);
        assert!(q.remove(&ids[0]).is_some());
        assert!(q.is_empty());
        assert!(q.remove(&ids[0]).is_none());
    }

    #[test]
    fn category_uses_top_level_folder() {
        assert_eq!(infer_category("finance/2024/q1.pdf"), "finance");
        assert_eq!(infer_category("q1.pdf"), "Uncategorized");
        assert_eq!(infer_category(""), "Uncategorized");
    }

    #[test]
    fn scan_directory_prefixes_root_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("contracts");
        std::fs::create_dir_all(root.join("2024")).unwrap();
        std::fs::write(root.join("2024/lease.pdf"), b"pdf").unwrap();
        std::fs::write(root.join("notes.txt"), b"skip").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/config.pdf"), b"skip").unwrap();

        let files = scan_paths(&[root], &UploadConfig::default()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "contracts/2024/lease.pdf");
        assert_eq!(infer_category(&files[0].relative_path), "contracts");
    }
}
