//! ZIP expansion for the upload queue.
//!
//! A dropped archive is flattened into one [`FileSource`] per contained file.
//! Each entry keeps its in-archive path as the relative path, so folder
//! structure inside the archive drives category inference. Archives nested
//! inside archives are expanded too, up to [`MAX_NESTING`] levels.

use bytes::Bytes;
use std::io::Read;

use crate::error::{UploadError, UploadResult};
use crate::models::{extension_of, FileSource};

/// Maximum decompressed bytes read from a single entry (zip-bomb protection).
const MAX_ENTRY_BYTES: u64 = 1024 * 1024 * 1024;
/// Maximum number of entries expanded from one archive tree.
const MAX_ENTRIES: usize = 10_000;
/// Archives nested deeper than this are passed through as plain files.
const MAX_NESTING: usize = 4;

pub fn is_zip_name(name: &str) -> bool {
    extension_of(name) == ".zip"
}

/// Expands an archive into plain files.
///
/// Directory entries and macOS resource forks are skipped. Entry timestamps
/// become `last_modified` of the expanded file, so expanding the same archive
/// twice yields identical duplicate keys.
pub fn expand_zip(bytes: &[u8]) -> UploadResult<Vec<FileSource>> {
    let mut out = Vec::new();
    expand_into(bytes, "", 0, &mut out)?;
    Ok(out)
}

fn expand_into(bytes: &[u8], prefix: &str, depth: usize, out: &mut Vec<FileSource>) -> UploadResult<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;

    for i in 0..archive.len() {
        if out.len() >= MAX_ENTRIES {
            return Err(UploadError::Archive(format!(
                "archive expands to more than {} files",
                MAX_ENTRIES
            )));
        }

        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let path = entry.name().replace('\\', "/");
        if path.starts_with("__MACOSX/") || path.contains("/__MACOSX/") {
            continue;
        }
        let name = match path.rsplit('/').find(|s| !s.is_empty()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let last_modified = entry
            .last_modified()
            .and_then(zip_time_to_millis)
            .unwrap_or(0);

        let mut data = Vec::new();
        entry
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut data)
            .map_err(|e| UploadError::Archive(e.to_string()))?;
        if data.len() as u64 >= MAX_ENTRY_BYTES {
            return Err(UploadError::Archive(format!(
                "entry {} exceeds size limit ({} bytes)",
                path, MAX_ENTRY_BYTES
            )));
        }

        let relative = format!("{}{}", prefix, path.trim_start_matches('/'));

        if is_zip_name(&name) && depth + 1 < MAX_NESTING {
            let nested_prefix = match relative.rfind('/') {
                Some(i) => relative[..=i].to_string(),
                None => String::new(),
            };
            expand_into(&data, &nested_prefix, depth + 1, out)?;
            continue;
        }

        out.push(FileSource::from_bytes(
            &name,
            &relative,
            Bytes::from(data),
            last_modified,
        ));
    }

    Ok(())
}

fn zip_time_to_millis(dt: zip::DateTime) -> Option<i64> {
    let date = chrono::NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?;
    let time = chrono::NaiveTime::from_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    Some(date.and_time(time).and_utc().timestamp_millis())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                if name.ends_with('/') {
                    writer.add_directory(*name, options).unwrap();
                } else {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(data).unwrap();
                }
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn expands_entries_with_relative_paths() {
        let zip = build_zip(&[("a.pdf", b"pdf"), ("b/", b""), ("b/c.docx", b"docx")]);
        let files = expand_zip(&zip).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.pdf");
        assert_eq!(files[0].relative_path, "a.pdf");
        assert_eq!(files[1].name, "c.docx");
        assert_eq!(files[1].relative_path, "b/c.docx");
        assert_eq!(files[1].size, 4);
    }

    #[test]
    fn skips_macos_resource_forks() {
        let zip = build_zip(&[("__MACOSX/._a.pdf", b"x"), ("a.pdf", b"pdf")]);
        let files = expand_zip(&zip).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.pdf");
    }

    #[test]
    fn flattens_nested_archives() {
        let inner = build_zip(&[("deep.pdf", b"pdf")]);
        let outer = build_zip(&[("folder/inner.zip", inner.as_slice()), ("top.hwp", b"hwp")]);
        let files = expand_zip(&outer).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["folder/deep.pdf", "top.hwp"]);
    }

    #[test]
    fn invalid_archive_is_an_error() {
        let err = expand_zip(b"not a zip").unwrap_err();
        assert!(matches!(err, UploadError::Archive(_)));
    }

    #[test]
    fn expansion_is_deterministic() {
        let zip = build_zip(&[("x/y.pdf", b"1234")]);
        let a = expand_zip(&zip).unwrap();
        let b = expand_zip(&zip).unwrap();
        assert_eq!(a[0].key(), b[0].key());
    }
}
