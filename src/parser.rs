//! Built-in document parsing and archive expansion.
//!
//! | Format | Handling |
//! |--------|----------|
//! | `txt`, `md` | strict UTF-8 |
//! | `pdf` | `pdf-extract` |
//! | `docx` | `word/document.xml` read with `quick-xml`, one line per paragraph |
//! | `doc` | unsupported (legacy binary Word) |
//! | `zip` | expanded by [`expand_archive`] before parsing |
//!
//! PDF and DOCX extraction run on the blocking pool.

use std::io::Read;

use async_trait::async_trait;
use quick_xml::events::Event;

use docrag_core::capabilities::DocumentParser;
use docrag_core::models::{DocumentFormat, ParsedDocument};
use docrag_core::{Error, Result};

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Parser for every format docrag accepts.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinParser;

#[async_trait]
impl DocumentParser for BuiltinParser {
    async fn parse(&self, bytes: &[u8], format: DocumentFormat) -> Result<ParsedDocument> {
        let text = match format {
            DocumentFormat::Txt | DocumentFormat::Md => std::str::from_utf8(bytes)
                .map_err(|e| Error::Parse(format!("file is not valid UTF-8: {}", e)))?
                .to_string(),
            DocumentFormat::Pdf => {
                let owned = bytes.to_vec();
                blocking(move || extract_pdf(&owned)).await?
            }
            DocumentFormat::Docx => {
                let owned = bytes.to_vec();
                blocking(move || extract_docx(&owned)).await?
            }
            DocumentFormat::Doc => {
                return Err(Error::UnsupportedFormat(
                    "legacy .doc files are not supported; save as .docx".to_string(),
                ))
            }
            DocumentFormat::Zip => {
                return Err(Error::UnsupportedFormat(
                    "zip archives are expanded before parsing".to_string(),
                ))
            }
        };

        let metadata = serde_json::json!({
            "format": format.as_str(),
            "bytes": bytes.len(),
            "chars": text.chars().count(),
            "lines": text.lines().count(),
        });
        Ok(ParsedDocument { text, metadata })
    }
}

async fn blocking<F>(f: F) -> Result<String>
where
    F: FnOnce() -> Result<String> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Parse(format!("extraction task failed: {}", e)))?
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::Parse(format!("PDF extraction failed: {}", e)))
}

fn ooxml_error(e: impl std::fmt::Display) -> Error {
    Error::Parse(format!("DOCX extraction failed: {}", e))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_error)?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ooxml_error("word/document.xml not found"))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(ooxml_error)?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_error("word/document.xml exceeds size limit"));
    }
    paragraphs_from_document_xml(&xml)
}

/// Collect `<w:t>` runs, ending a line at every `</w:p>`.
fn paragraphs_from_document_xml(xml: &[u8]) -> Result<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().map_err(ooxml_error)?.as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = std::mem::take(&mut current);
                    if !line.trim().is_empty() {
                        paragraphs.push(line);
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

/// A file pulled out of an uploaded archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path inside the archive.
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Expand a `.zip` upload into its ingestible entries.
///
/// Directories, nested archives, hidden or `__MACOSX` entries, entries whose
/// extension `accept` rejects, and entries larger than `max_entry_bytes` are
/// skipped with a log line. More than `max_entries` candidate files is a
/// validation error.
pub fn expand_archive(
    bytes: &[u8],
    max_entries: usize,
    max_entry_bytes: usize,
    accept: impl Fn(DocumentFormat) -> bool,
) -> Result<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::Parse(format!("invalid zip archive: {}", e)))?;

    let mut out = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| Error::Parse(format!("unreadable zip entry {}: {}", i, e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let base = name.rsplit('/').next().unwrap_or(&name);
        if name.starts_with("__MACOSX/") || base.starts_with('.') {
            continue;
        }

        match DocumentFormat::from_filename(base) {
            Some(DocumentFormat::Zip) => {
                tracing::warn!(entry = %name, "skipping nested archive");
                continue;
            }
            Some(format) if accept(format) => {}
            _ => {
                tracing::warn!(entry = %name, "skipping unsupported archive entry");
                continue;
            }
        }
        if entry.size() > max_entry_bytes as u64 {
            tracing::warn!(entry = %name, size = entry.size(), "skipping oversized archive entry");
            continue;
        }
        if out.len() >= max_entries {
            return Err(Error::Validation(format!(
                "archive holds more than {} files",
                max_entries
            )));
        }

        let mut data = Vec::new();
        entry
            .take(max_entry_bytes as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|e| Error::Parse(format!("failed to read zip entry {}: {}", name, e)))?;
        if data.len() > max_entry_bytes {
            tracing::warn!(entry = %name, "skipping archive entry that inflates past the size limit");
            continue;
        }
        out.push(ArchiveEntry {
            filename: name,
            bytes: data,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            for (name, data) in files {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
            body
        );
        zip_of(&[("word/document.xml", xml.as_bytes())])
    }

    #[tokio::test]
    async fn test_text_and_metadata() {
        let parsed = BuiltinParser
            .parse(b"line one\nline two\n", DocumentFormat::Txt)
            .await
            .unwrap();
        assert_eq!(parsed.text, "line one\nline two\n");
        assert_eq!(parsed.metadata["lines"], 2);
        assert_eq!(parsed.metadata["bytes"], 18);
        assert_eq!(parsed.metadata["format"], "txt");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_parse_error() {
        let err = BuiltinParser
            .parse(&[0x66, 0xff, 0xfe], DocumentFormat::Md)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn test_docx_paragraphs() {
        let bytes = docx_with_paragraphs(&["First paragraph.", "Second &amp; last."]);
        let parsed = BuiltinParser.parse(&bytes, DocumentFormat::Docx).await.unwrap();
        assert_eq!(parsed.text, "First paragraph.\nSecond & last.");
    }

    #[tokio::test]
    async fn test_broken_inputs() {
        let err = BuiltinParser.parse(b"not a pdf", DocumentFormat::Pdf).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        let err = BuiltinParser.parse(b"not a zip", DocumentFormat::Docx).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        let err = BuiltinParser.parse(b"\xd0\xcf", DocumentFormat::Doc).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_expand_archive_filters_entries() {
        let nested = zip_of(&[("inner.txt", b"x".as_slice())]);
        let bytes = zip_of(&[
            ("notes/a.txt", b"alpha".as_slice()),
            ("b.md", b"# beta".as_slice()),
            ("inner.zip", nested.as_slice()),
            ("tool.exe", b"MZ".as_slice()),
            ("__MACOSX/._a.txt", b"junk".as_slice()),
        ]);
        let entries = expand_archive(&bytes, 10, 1024, |_| true).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["notes/a.txt", "b.md"]);
        assert_eq!(entries[0].bytes, b"alpha");

        let only_md = expand_archive(&bytes, 10, 1024, |f| f == DocumentFormat::Md).unwrap();
        assert_eq!(only_md.len(), 1);
    }

    #[test]
    fn test_expand_archive_limits() {
        let bytes = zip_of(&[
            ("a.txt", b"1".as_slice()),
            ("b.txt", b"2".as_slice()),
            ("c.txt", b"3".as_slice()),
        ]);
        assert!(matches!(
            expand_archive(&bytes, 2, 1024, |_| true),
            Err(Error::Validation(_))
        ));
        let big = zip_of(&[("big.txt", [b'a'; 64].as_slice()), ("small.txt", b"ok".as_slice())]);
        let entries = expand_archive(&big, 10, 16, |_| true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "small.txt");
    }
}
