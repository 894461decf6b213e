//! Artifact archive handling
//!
//! ZIP entries are enumerated and streamed out one at a time; only XML
//! files inside the configured size bounds are extracted. The zip crate is
//! synchronous, so the work runs on the blocking pool.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use shared::{Error, Result};

/// One extracted report file
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

/// ZIP local-file magic
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Sniff whether a downloaded artifact is a ZIP archive
pub async fn is_zip(path: &Path) -> Result<bool> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::internal(format!("Failed to open artifact: {}", e)))?;
    let mut magic = [0u8; 4];
    use tokio::io::AsyncReadExt;
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(magic == ZIP_MAGIC),
        // shorter than four bytes: certainly not an archive
        Err(_) => Ok(false),
    }
}

/// Extract XML entries from `archive` into `dest`, honoring size bounds.
///
/// Entries stream from the archive to disk through a fixed buffer; a
/// corrupt archive fails with a parse error, and per-entry size bounds are
/// enforced before any bytes are copied.
pub async fn extract_xml_files(
    archive: &Path,
    dest: &Path,
    min_size: u64,
    max_size: u64,
) -> Result<Vec<ExtractedFile>> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest, min_size, max_size))
        .await
        .map_err(|e| Error::internal(format!("Extraction task failed: {}", e)))?
}

fn extract_blocking(
    archive: &Path,
    dest: &Path,
    min_size: u64,
    max_size: u64,
) -> Result<Vec<ExtractedFile>> {
    let file = std::fs::File::open(archive)
        .map_err(|e| Error::internal(format!("Failed to open archive: {}", e)))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::parse(format!("Corrupt artifact archive: {}", e)))?;

    let mut extracted = Vec::new();
    let mut copy_buf = vec![0u8; 64 * 1024];

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::parse(format!("Corrupt archive entry: {}", e)))?;

        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();
        if !name.to_lowercase().ends_with(".xml") {
            continue;
        }
        let size = entry.size();
        if size < min_size || size > max_size {
            tracing::debug!(
                entry = %name,
                size_bytes = size,
                "Skipping report outside size bounds"
            );
            continue;
        }

        // flatten entry paths; nested report dirs collapse to file names
        let flat_name = name.replace(['/', '\\'], "_");
        let out_path = dest.join(&flat_name);
        let mut out = std::fs::File::create(&out_path)
            .map_err(|e| Error::internal(format!("Failed to create report file: {}", e)))?;

        let mut written = 0u64;
        loop {
            let read = entry
                .read(&mut copy_buf)
                .map_err(|e| Error::parse(format!("Failed to read archive entry: {}", e)))?;
            if read == 0 {
                break;
            }
            written += read as u64;
            // declared size lied; bail before the cap is breached on disk
            if written > max_size {
                return Err(Error::ArtifactTooLarge {
                    size_bytes: written,
                    max_bytes: max_size,
                });
            }
            out.write_all(&copy_buf[..read])
                .map_err(|e| Error::internal(format!("Failed to write report file: {}", e)))?;
        }

        extracted.push(ExtractedFile {
            path: out_path,
            name,
            size_bytes: written,
        });
    }

    Ok(extracted)
}

/// Default artifact-name filter: test-report-ish names or report extensions
pub fn artifact_name_matches(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("test")
        || lower.contains("junit")
        || lower.contains("results")
        || lower.ends_with(".xml")
        || lower.ends_with(".zip")
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[tokio::test]
    async fn test_extracts_only_xml_within_bounds() {
        let archive = build_zip(&[
            ("junit/TEST-widget.xml", b"<testsuite name=\"s\"/>"),
            ("logs/run.log", b"noise"),
            ("empty.xml", b""),
        ]);
        let dest = tempfile::tempdir().unwrap();

        let files = extract_xml_files(archive.path(), dest.path(), 1, 1024)
            .await
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "junit/TEST-widget.xml");
        assert!(files[0].path.exists());
    }

    #[tokio::test]
    async fn test_streamed_extraction_matches_source_bytes() {
        // round-trip law: streamed extraction equals the original content
        let content = br#"<testsuite name="exact"><testcase name="t"/></testsuite>"#;
        let archive = build_zip(&[("report.xml", content)]);
        let dest = tempfile::tempdir().unwrap();

        let files = extract_xml_files(archive.path(), dest.path(), 1, 4096)
            .await
            .unwrap();
        let extracted = std::fs::read(&files[0].path).unwrap();
        assert_eq!(extracted, content);
    }

    #[tokio::test]
    async fn test_nested_paths_are_flattened() {
        let archive = build_zip(&[("a/b/c/report.xml", b"<testsuite name=\"s\"/>")]);
        let dest = tempfile::tempdir().unwrap();

        let files = extract_xml_files(archive.path(), dest.path(), 1, 1024)
            .await
            .unwrap();
        let file_name = files[0].path.file_name().unwrap().to_string_lossy();
        assert_eq!(file_name, "a_b_c_report.xml");
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a zip").unwrap();
        let dest = tempfile::tempdir().unwrap();

        let result = extract_xml_files(file.path(), dest.path(), 1, 1024).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_zip_sniffing() {
        let archive = build_zip(&[("r.xml", b"<x/>")]);
        assert!(is_zip(archive.path()).await.unwrap());

        let mut plain = tempfile::NamedTempFile::new().unwrap();
        plain.write_all(b"<testsuite/>").unwrap();
        assert!(!is_zip(plain.path()).await.unwrap());
    }

    #[test]
    fn test_artifact_name_filter() {
        assert!(artifact_name_matches("test-results"));
        assert!(artifact_name_matches("JUnit Report"));
        assert!(artifact_name_matches("coverage.xml"));
        assert!(artifact_name_matches("bundle.zip"));
        assert!(!artifact_name_matches("build-log"));
        assert!(!artifact_name_matches("screenshots.png"));
    }
}
