//! Export finished results as a ZIP archive.
//!
//! Each done item with a result gets its own folder named after the file
//! stem:
//!
//! ```text
//! report/report_summary.txt
//! report/report_tags.txt
//! report/report_ocr.json
//! ```
//!
//! Folders for files that share a stem get a numeric suffix (`report-2`).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;

use crate::models::{stem_of, ItemStatus, UploadItem};

/// Writes the archive and returns how many items were exported.
pub fn export_results(items: &[UploadItem], output: &Path) -> Result<usize> {
    let (bytes, count) = build_archive(items)?;
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(items = count, path = %output.display(), "exported results");
    Ok(count)
}

fn build_archive(items: &[UploadItem]) -> Result<(Vec<u8>, usize)> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut count = 0;
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default();

        for item in items {
            if item.status != ItemStatus::Done {
                continue;
            }
            let Some(result) = &item.result else {
                continue;
            };

            let stem = stem_of(&item.file.name);
            let n = used.entry(stem.clone()).or_insert(0);
            *n += 1;
            let folder = if *n == 1 {
                stem.clone()
            } else {
                format!("{}-{}", stem, n)
            };

            writer.start_file(format!("{}/{}_summary.txt", folder, stem), options)?;
            writer.write_all(result.summary.as_bytes())?;

            writer.start_file(format!("{}/{}_tags.txt", folder, stem), options)?;
            let mut tags = format!("category: {}\n", result.category);
            for tag in &result.tags {
                tags.push_str(tag);
                tags.push('\n');
            }
            writer.write_all(tags.as_bytes())?;

            writer.start_file(format!("{}/{}_ocr.json", folder, stem), options)?;
            writer.write_all(serde_json::to_string_pretty(&result.raw)?.as_bytes())?;

            count += 1;
        }
        writer.finish()?;
    }
    Ok((buf.into_inner(), count))
}
