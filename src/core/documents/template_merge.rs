//! In-memory template merge for the three supported template formats.
//!
//! Placeholders look like `{{field_name}}`. Unknown placeholders are left in
//! place. Nothing here touches the filesystem: input and output are byte
//! buffers owned by the caller.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::str::FromStr;

use lopdf::content::Content;
use lopdf::{Document, Object};
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::write::SimpleFileOptions;

use crate::core::storage::GatewayError;

pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";

/// Largest decompressed XML part we are willing to rewrite.
const MAX_XML_PART_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateFormat {
    /// Word-processor document (docx).
    WordDocument,
    /// Web-native document (html).
    WebDocument,
    /// Rendered PDF.
    RenderedPdf,
}

impl TemplateFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            TemplateFormat::WordDocument => MIME_DOCX,
            TemplateFormat::WebDocument => MIME_HTML,
            TemplateFormat::RenderedPdf => MIME_PDF,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateFormat::WordDocument => "docx",
            TemplateFormat::WebDocument => "html",
            TemplateFormat::RenderedPdf => "pdf",
        }
    }
}

impl FromStr for TemplateFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docx" | "word" | MIME_DOCX => Ok(TemplateFormat::WordDocument),
            "html" | "htm" | MIME_HTML => Ok(TemplateFormat::WebDocument),
            "pdf" | MIME_PDF => Ok(TemplateFormat::RenderedPdf),
            _ => Err(GatewayError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Merges `data` into `template`, consuming the template buffer.
pub fn merge_template(
    format: TemplateFormat,
    template: Vec<u8>,
    data: &BTreeMap<String, String>,
) -> Result<Vec<u8>, GatewayError> {
    match format {
        TemplateFormat::WordDocument => merge_docx(&template, data),
        TemplateFormat::WebDocument => merge_html(template, data),
        TemplateFormat::RenderedPdf => merge_pdf(&template, data),
    }
}

/// Replaces every `{{key}}` whose key is in `data`. Values go through `escape`.
pub fn fill_placeholders<F>(text: &str, data: &BTreeMap<String, String>, escape: F) -> String
where
    F: Fn(&str) -> Cow<'_, str>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let key = rest[open + 2..open + 2 + close].trim();
        out.push_str(&rest[..open]);

        match data.get(key) {
            Some(value) => out.push_str(&escape(value)),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &rest[open + 2 + close + 2..];
    }

    out.push_str(rest);
    out
}

fn verbatim(value: &str) -> Cow<'_, str> {
    Cow::Borrowed(value)
}

fn escaped(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}

// ============================================================================
// HTML
// ============================================================================

fn merge_html(template: Vec<u8>, data: &BTreeMap<String, String>) -> Result<Vec<u8>, GatewayError> {
    let html = String::from_utf8(template)
        .map_err(|_| GatewayError::InvalidRequest("html template is not valid UTF-8".to_string()))?;
    Ok(fill_placeholders(&html, data, escaped).into_bytes())
}

// ============================================================================
// DOCX
// ============================================================================

/// Parts of a docx that carry visible text.
fn is_text_part(name: &str) -> bool {
    name == "word/document.xml"
        || (name.starts_with("word/header") && name.ends_with(".xml"))
        || (name.starts_with("word/footer") && name.ends_with(".xml"))
}

fn merge_docx(template: &[u8], data: &BTreeMap<String, String>) -> Result<Vec<u8>, GatewayError> {
    let ooxml_err = |e: zip::result::ZipError| {
        GatewayError::InvalidRequest(format!("docx template is not a valid archive: {}", e))
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(template)).map_err(ooxml_err)?;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::with_capacity(template.len())));

    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(ooxml_err)?;
        let name = entry.name().to_string();

        if !is_text_part(&name) {
            writer.raw_copy_file(entry).map_err(ooxml_err)?;
            continue;
        }

        let options = SimpleFileOptions::default().compression_method(entry.compression());
        let mut xml = Vec::new();
        entry
            .take(MAX_XML_PART_BYTES)
            .read_to_end(&mut xml)
            .map_err(|e| GatewayError::InvalidRequest(format!("unreadable {}: {}", name, e)))?;
        if xml.len() as u64 >= MAX_XML_PART_BYTES {
            return Err(GatewayError::InvalidRequest(format!(
                "{} exceeds size limit",
                name
            )));
        }

        let merged = merge_xml_text(&xml, data)?;
        writer.start_file(name.as_str(), options).map_err(ooxml_err)?;
        writer
            .write_all(&merged)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    }

    Ok(writer.finish().map_err(ooxml_err)?.into_inner())
}

/// Rewrites the text nodes of one XML part. Markup is copied untouched;
/// substituted values are escaped by the writer.
fn merge_xml_text(xml: &[u8], data: &BTreeMap<String, String>) -> Result<Vec<u8>, GatewayError> {
    let xml_err = |e: String| GatewayError::InvalidRequest(format!("malformed docx XML: {}", e));

    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Cursor::new(Vec::with_capacity(xml.len())));
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_err(e.to_string()))?;
        match event {
            Event::Eof => break,
            Event::Text(ref text) => {
                let raw = text.unescape().map_err(|e| xml_err(e.to_string()))?;
                if raw.contains("{{") {
                    let filled = fill_placeholders(&raw, data, verbatim);
                    writer
                        .write_event(Event::Text(BytesText::new(&filled)))
                        .map_err(|e| xml_err(e.to_string()))?;
                } else {
                    writer
                        .write_event(event.clone())
                        .map_err(|e| xml_err(e.to_string()))?;
                }
            }
            other => writer
                .write_event(other)
                .map_err(|e| xml_err(e.to_string()))?,
        }
        buf.clear();
    }

    Ok(writer.into_inner().into_inner())
}

// ============================================================================
// PDF
// ============================================================================

fn merge_pdf(template: &[u8], data: &BTreeMap<String, String>) -> Result<Vec<u8>, GatewayError> {
    let pdf_err = |e: lopdf::Error| GatewayError::InvalidRequest(format!("invalid pdf template: {}", e));

    let mut doc = Document::load_mem(template).map_err(pdf_err)?;
    let page_ids: Vec<_> = doc.get_pages().into_values().collect();

    for page_id in page_ids {
        let raw = doc.get_page_content(page_id).map_err(pdf_err)?;
        let mut content = Content::decode(&raw).map_err(pdf_err)?;

        let mut changed = false;
        for op in content.operations.iter_mut() {
            changed |= match op.operator.as_str() {
                "Tj" | "'" => op.operands.first_mut().is_some_and(|o| fill_pdf_string(o, data)),
                "\"" => op.operands.get_mut(2).is_some_and(|o| fill_pdf_string(o, data)),
                "TJ" => op.operands.first_mut().is_some_and(|o| fill_pdf_array(o, data)),
                _ => false,
            };
        }

        if changed {
            let encoded = content.encode().map_err(pdf_err)?;
            doc.change_page_content(page_id, encoded).map_err(pdf_err)?;
        }
    }

    let mut out = Vec::with_capacity(template.len());
    doc.save_to(&mut out)
        .map_err(|e| GatewayError::InvalidRequest(format!("failed to write pdf: {}", e)))?;
    Ok(out)
}

fn fill_pdf_string(operand: &mut Object, data: &BTreeMap<String, String>) -> bool {
    let Object::String(bytes, _) = operand else {
        return false;
    };
    match fill_placeholder_bytes(bytes, data) {
        Some(filled) => {
            *bytes = filled;
            true
        }
        None => false,
    }
}

/// Byte-level `{{key}}` replacement for PDF strings, which are often not
/// UTF-8 (WinAnsi, PDFDocEncoding). Bytes outside placeholders are copied
/// untouched. Returns `None` when nothing was replaced.
fn fill_placeholder_bytes(bytes: &[u8], data: &BTreeMap<String, String>) -> Option<Vec<u8>> {
    let find = |haystack: &[u8], needle: &[u8]| {
        haystack.windows(needle.len()).position(|w| w == needle)
    };

    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;
    let mut replaced = false;

    while let Some(open) = find(rest, b"{{") {
        let Some(close) = find(&rest[open + 2..], b"}}") else {
            break;
        };
        let end = open + 2 + close + 2;
        out.extend_from_slice(&rest[..open]);

        let value = std::str::from_utf8(&rest[open + 2..open + 2 + close])
            .ok()
            .and_then(|key| data.get(key.trim()));
        match value {
            Some(value) => {
                out.extend_from_slice(value.as_bytes());
                replaced = true;
            }
            None => out.extend_from_slice(&rest[open..end]),
        }
        rest = &rest[end..];
    }

    out.extend_from_slice(rest);
    replaced.then_some(out)
}

/// `TJ` arrays interleave strings with kerning offsets, and a placeholder may
/// be split across strings. When it is, the array collapses to one string.
fn fill_pdf_array(operand: &mut Object, data: &BTreeMap<String, String>) -> bool {
    let Object::Array(items) = operand else {
        return false;
    };

    let mut changed = false;
    for item in items.iter_mut() {
        changed |= fill_pdf_string(item, data);
    }

    let joined: Vec<u8> = items
        .iter()
        .filter_map(|item| match item {
            Object::String(bytes, _) => Some(bytes.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect();
    if let Some(filled) = fill_placeholder_bytes(&joined, data) {
        *items = vec![Object::string_literal(filled)];
        changed = true;
    }

    changed
}
