use std::io::{Cursor, Read};

use anyhow::Context;
use regex::Regex;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
    Docx,
}

impl DocumentKind {
    pub fn from_file_name(name: &str) -> anyhow::Result<Self> {
        let ext = std::path::Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" => Ok(Self::Text),
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            other => anyhow::bail!("unsupported file type: {:?} (expected txt, pdf or docx)", other),
        }
    }
}

fn decode_xml_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text runs of a WordprocessingML body, one paragraph per line.
fn word_xml_to_text(xml: &str) -> anyhow::Result<String> {
    let line_break = Regex::new(r"<w:(?:br|cr)\b[^>]*/>")?;
    let tab = Regex::new(r"<w:tab\b[^>]*/>")?;
    let with_breaks = xml.replace("</w:p>", "\n");
    let with_breaks = line_break.replace_all(&with_breaks, "\n");
    let with_breaks = tab.replace_all(&with_breaks, "\t");
    let mut out = String::with_capacity(with_breaks.len());
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    Ok(decode_xml_entities(&out)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn load_docx(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("not a docx archive")?;
    let mut entry = archive.by_name("word/document.xml").context("docx has no word/document.xml")?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    word_xml_to_text(&xml)
}

pub fn load_text(kind: DocumentKind, bytes: &[u8]) -> anyhow::Result<String> {
    match kind {
        DocumentKind::Text => Ok(String::from_utf8_lossy(bytes).into_owned()),
        DocumentKind::Docx => load_docx(bytes),
        DocumentKind::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| anyhow::anyhow!("pdf extraction failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with(body: &str) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("word/document.xml", zip::write::FileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn kind_by_extension() {
        assert_eq!(DocumentKind::from_file_name("notes.TXT").unwrap(), DocumentKind::Text);
        assert_eq!(DocumentKind::from_file_name("a.b.pdf").unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_file_name("x.docx").unwrap(), DocumentKind::Docx);
        assert!(DocumentKind::from_file_name("image.png").is_err());
        assert!(DocumentKind::from_file_name("README").is_err());
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>Fish &amp; chips</w:t></w:r></w:p>
            <w:p><w:r><w:t>second</w:t></w:r><w:r><w:t xml:space="preserve"> line</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let text = load_text(DocumentKind::Docx, &docx_with(xml)).unwrap();
        assert_eq!(text, "Fish & chips\nsecond line");
    }

    #[test]
    fn attributed_breaks_split_lines() {
        let xml = r#"<w:p><w:r><w:t>before</w:t><w:br w:type="page"/><w:t>after</w:t><w:cr/><w:t>last</w:t></w:r></w:p>
            <w:p><w:r><w:t>a</w:t><w:tab/><w:t>b</w:t></w:r></w:p>"#;
        assert_eq!(word_xml_to_text(xml).unwrap(), "before\nafter\nlast\na\tb");
    }

    #[test]
    fn broken_inputs_error() {
        assert!(load_text(DocumentKind::Docx, b"not a zip").is_err());
        assert_eq!(load_text(DocumentKind::Text, "héllo".as_bytes()).unwrap(), "héllo");
    }
}
