//! Per-format text extraction.
//!
//! Converts raw document bytes into plain UTF-8 text plus a page map, with
//! no side effects on any store. TXT and PDF page boundaries come from form
//! feeds in the extracted text; HTML and DOCX are treated as a single page.
//!
//! Failures are [`Error::UnsupportedFormat`] (format not handled) or
//! [`Error::Extraction`] (corrupt/unreadable input).

use std::io::Read;

use crate::error::{Error, Result};
use crate::models::DocumentType;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// A page's byte span within the extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    pub start: usize,
    pub end: usize,
}

/// Extracted text with its positional page map.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub pages: Vec<Page>,
}

impl ExtractedText {
    /// Page containing the given byte offset (the last page starting at or
    /// before it).
    pub fn page_for_offset(&self, offset: usize) -> Option<u32> {
        self.pages
            .iter()
            .rev()
            .find(|p| p.start <= offset)
            .map(|p| p.number)
    }
}

/// Extract text and page map from raw document bytes.
///
/// Pure function of bytes and type: never touches the catalog or index.
pub fn extract(bytes: &[u8], doc_type: DocumentType) -> Result<ExtractedText> {
    let extracted = match doc_type {
        DocumentType::Txt => extract_txt(bytes)?,
        DocumentType::Html => extract_html(bytes)?,
        DocumentType::Pdf => extract_pdf(bytes)?,
        DocumentType::Docx => extract_docx(bytes)?,
    };

    if extracted.text.trim().is_empty() {
        return Err(Error::Extraction(
            "document contains no extractable text".to_string(),
        ));
    }
    Ok(extracted)
}

/// Split a text into page spans at form-feed characters.
///
/// Texts without form feeds become a single page covering everything.
fn paged(text: String) -> ExtractedText {
    let mut pages = Vec::new();
    let mut start = 0usize;
    let mut number = 1u32;
    for (pos, ch) in text.char_indices() {
        if ch == '\u{C}' {
            pages.push(Page {
                number,
                start,
                end: pos,
            });
            start = pos + ch.len_utf8();
            number += 1;
        }
    }
    pages.push(Page {
        number,
        start,
        end: text.len(),
    });
    ExtractedText { text, pages }
}

fn extract_txt(bytes: &[u8]) -> Result<ExtractedText> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Extraction(format!("text file is not valid UTF-8: {e}")))?;
    Ok(paged(text.to_string()))
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::Extraction(format!("PDF extraction failed: {e}")))?;
    Ok(paged(text))
}

/// Case-insensitive ASCII prefix test on raw bytes.
fn starts_with_tag(html: &str, pos: usize, tag: &str) -> bool {
    let bytes = &html.as_bytes()[pos..];
    bytes.len() >= tag.len() && bytes[..tag.len()].eq_ignore_ascii_case(tag.as_bytes())
}

/// Strip tags from an HTML document, skipping `<script>`/`<style>` bodies
/// and decoding the common named entities plus numeric references.
fn extract_html(bytes: &[u8]) -> Result<ExtractedText> {
    let html = std::str::from_utf8(bytes)
        .map_err(|e| Error::Extraction(format!("HTML is not valid UTF-8: {e}")))?;

    const BLOCK_TAGS: [&str; 8] = ["<p", "</p", "<br", "<div", "</div", "<h", "</h", "<li"];

    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices();
    let mut skip_until: Option<&str> = None;

    while let Some((pos, ch)) = chars.next() {
        if let Some(close_tag) = skip_until {
            if ch == '<' && starts_with_tag(html, pos, close_tag) {
                skip_until = None;
                // fall through to consume the closing tag below
            } else {
                continue;
            }
        }

        match ch {
            '<' => {
                if starts_with_tag(html, pos, "<script") {
                    skip_until = Some("</script");
                } else if starts_with_tag(html, pos, "<style") {
                    skip_until = Some("</style");
                }
                let is_block = BLOCK_TAGS.iter().any(|tag| starts_with_tag(html, pos, tag));
                // consume up to and including '>'
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '>' {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    break;
                }
                if is_block && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            '&' => {
                let rest = &html[pos..];
                let (decoded, consumed) = decode_entity(rest);
                out.push_str(&decoded);
                // skip the remainder of the entity
                for _ in 0..consumed.saturating_sub(1) {
                    chars.next();
                }
            }
            _ => out.push(ch),
        }
    }

    // collapse runs of blank lines left behind by tag removal
    let mut cleaned = String::with_capacity(out.len());
    let mut blank_run = 0usize;
    for line in out.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        cleaned.push_str(line.trim_end());
        cleaned.push('\n');
    }

    Ok(paged(cleaned))
}

/// Decode an HTML entity at the start of `s`. Returns the decoded text and
/// the number of chars consumed (at least 1; unknown entities pass through).
fn decode_entity(s: &str) -> (String, usize) {
    let end = match s.char_indices().take(12).find(|(_, c)| *c == ';') {
        Some((idx, _)) => idx,
        None => return ("&".to_string(), 1),
    };
    let entity = &s[1..end];
    let decoded = match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            if let Some(num) = entity.strip_prefix('#') {
                let code = if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X'))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else {
                    num.parse::<u32>().ok()
                };
                code.and_then(char::from_u32)
            } else {
                None
            }
        }
    };
    match decoded {
        Some(c) => (c.to_string(), entity.chars().count() + 2),
        None => ("&".to_string(), 1),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedText> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::Extraction(format!("DOCX is not a valid archive: {e}")))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| Error::Extraction("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| Error::Extraction(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(Error::Extraction(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    let text = extract_w_t_elements(&doc_xml)?;
    Ok(paged(text))
}

/// Walk `w:t` text runs, inserting paragraph breaks at `w:p` ends.
fn extract_w_t_elements(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == b"p" && !out.ends_with("\n\n") && !out.is_empty() {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(Error::Extraction(format!("DOCX XML error: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_single_page() {
        let extracted = extract(b"Plain text body.", DocumentType::Txt).unwrap();
        assert_eq!(extracted.text, "Plain text body.");
        assert_eq!(extracted.pages.len(), 1);
        assert_eq!(extracted.pages[0].number, 1);
        assert_eq!(extracted.page_for_offset(3), Some(1));
    }

    #[test]
    fn txt_form_feeds_define_pages() {
        let extracted = extract(b"page one\x0cpage two\x0cpage three", DocumentType::Txt).unwrap();
        assert_eq!(extracted.pages.len(), 3);
        let p2 = extracted.pages[1];
        assert_eq!(p2.number, 2);
        assert_eq!(&extracted.text[p2.start..p2.end], "page two");
        assert_eq!(extracted.page_for_offset(p2.start + 2), Some(2));
    }

    #[test]
    fn txt_invalid_utf8_is_extraction_error() {
        let err = extract(&[0xff, 0xfe, 0x00], DocumentType::Txt).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn empty_document_is_extraction_error() {
        let err = extract(b"   \n ", DocumentType::Txt).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn html_strips_tags_and_scripts() {
        let html = b"<html><head><style>p{color:red}</style>\
            <script>var x = '<p>';</script></head>\
            <body><h1>Title</h1><p>First &amp; second.</p></body></html>";
        let extracted = extract(html, DocumentType::Html).unwrap();
        assert!(extracted.text.contains("Title"));
        assert!(extracted.text.contains("First & second."));
        assert!(!extracted.text.contains("color:red"));
        assert!(!extracted.text.contains("var x"));
    }

    #[test]
    fn html_decodes_numeric_entities() {
        let extracted = extract(b"<p>caf&#233; &#x2014; done</p>", DocumentType::Html).unwrap();
        assert!(extracted.text.contains("café"));
        assert!(extracted.text.contains('\u{2014}'));
    }

    #[test]
    fn invalid_pdf_is_extraction_error() {
        let err = extract(b"not a pdf", DocumentType::Pdf).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn invalid_docx_is_extraction_error() {
        let err = extract(b"not a zip", DocumentType::Docx).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }
}
