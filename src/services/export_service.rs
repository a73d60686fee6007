use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use crate::data::archive;
use crate::error::AppError;
use crate::models::ocr_result::{BoundingBox, OcrPage, OcrResult, TextBlock};
use crate::services::ocr_service::layout_text;

/// Integer canvas side used for hOCR boxes.
const HOCR_CANVAS: u32 = 1000;

pub trait ResultExporter: Send + Sync {
    fn export(&self, result: &OcrResult) -> Result<Vec<u8>, AppError>;
    fn file_extension(&self) -> &'static str;
    fn mime_type(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Xml,
    Hocr,
}

impl ExportFormat {
    pub fn exporter(self) -> Box<dyn ResultExporter> {
        match self {
            Self::Json => Box::new(JsonExporter),
            Self::Xml => Box::new(XmlExporter),
            Self::Hocr => Box::new(HocrExporter),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            "hocr" => Ok(Self::Hocr),
            other => Err(AppError::Export(format!("unknown export format: {other}"))),
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Hocr => "hocr",
        })
    }
}

/// Exports `result` and atomically replaces `destination` with the output.
pub fn export_to_file(
    exporter: &dyn ResultExporter,
    result: &OcrResult,
    destination: &Path,
) -> Result<(), AppError> {
    let bytes = exporter.export(result)?;
    let parent = destination.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    archive::write_file_atomically(destination, &bytes)
}

pub struct JsonExporter;

impl ResultExporter for JsonExporter {
    fn export(&self, result: &OcrResult) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec_pretty(result)?)
    }

    fn file_extension(&self) -> &'static str {
        "json"
    }

    fn mime_type(&self) -> &'static str {
        "application/json"
    }
}

pub struct XmlExporter;

impl ResultExporter for XmlExporter {
    fn export(&self, result: &OcrResult) -> Result<Vec<u8>, AppError> {
        render_xml(result).map(String::into_bytes).map_err(fmt_error)
    }

    fn file_extension(&self) -> &'static str {
        "xml"
    }

    fn mime_type(&self) -> &'static str {
        "application/xml"
    }
}

pub struct HocrExporter;

impl ResultExporter for HocrExporter {
    fn export(&self, result: &OcrResult) -> Result<Vec<u8>, AppError> {
        render_hocr(result).map(String::into_bytes).map_err(fmt_error)
    }

    fn file_extension(&self) -> &'static str {
        "hocr"
    }

    fn mime_type(&self) -> &'static str {
        "text/vnd.hocr+html"
    }
}

fn fmt_error(e: std::fmt::Error) -> AppError {
    AppError::Export(e.to_string())
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r') || (c >= ' ' && c != '\u{FFFE}' && c != '\u{FFFF}')
}

/// Replaces characters XML 1.0 cannot carry, escaped or not, with a space.
fn xml_chars(text: &str) -> Cow<'_, str> {
    if text.chars().all(is_xml_char) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(
            text.chars()
                .map(|c| if is_xml_char(c) { c } else { ' ' })
                .collect(),
        )
    }
}

fn escaped(text: &str) -> String {
    escape(&xml_chars(text)).into_owned()
}

/// Wraps `text` in CDATA, splitting any `]]>` across two sections.
fn cdata(text: &str) -> String {
    format!(
        "<![CDATA[{}]]>",
        xml_chars(text).replace("]]>", "]]]]><![CDATA[>")
    )
}

fn write_box(out: &mut String, b: &BoundingBox) -> std::fmt::Result {
    write!(
        out,
        r#" x="{:.4}" y="{:.4}" width="{:.4}" height="{:.4}""#,
        b.x, b.y, b.width, b.height
    )
}

fn render_xml(result: &OcrResult) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        out,
        r#"<OCRResult id="{}" documentId="{}" engineVersion="{}" confidence="{:.4}" createdAt="{}">"#,
        result.id,
        result.document_id,
        escaped(&result.engine_version),
        result.confidence,
        result.created_at.to_rfc3339()
    )?;

    let meta = &result.metadata;
    writeln!(
        out,
        r#"  <Metadata processingTime="{:.3}">"#,
        meta.processing_time
    )?;
    for language in &meta.languages_detected {
        writeln!(out, "    <Language>{}</Language>", escaped(&language))?;
    }
    for warning in &meta.warnings {
        writeln!(out, "    <Warning>{}</Warning>", cdata(warning))?;
    }
    writeln!(out, "  </Metadata>")?;

    writeln!(out, "  <Pages>")?;
    for page in &result.pages {
        write_xml_page(&mut out, page)?;
    }
    writeln!(out, "  </Pages>")?;

    if let Some(demographics) = &result.demographics {
        writeln!(out, "  <Demographics>")?;
        for value in &demographics.dates_of_birth {
            writeln!(out, "    <DateOfBirth>{}</DateOfBirth>", cdata(value))?;
        }
        for value in &demographics.postcodes {
            writeln!(out, "    <Postcode>{}</Postcode>", cdata(value))?;
        }
        for value in &demographics.phone_numbers {
            writeln!(out, "    <PhoneNumber>{}</PhoneNumber>", cdata(value))?;
        }
        writeln!(out, "  </Demographics>")?;
    }

    writeln!(out, "</OCRResult>")?;
    Ok(out)
}

fn write_xml_page(out: &mut String, page: &OcrPage) -> std::fmt::Result {
    writeln!(
        out,
        r#"    <Page number="{}" confidence="{:.4}">"#,
        page.page_number, page.confidence
    )?;
    writeln!(out, "      <Text>{}</Text>", cdata(&page.text))?;

    if !page.text_blocks.is_empty() {
        writeln!(out, "      <Blocks>")?;
        for block in &page.text_blocks {
            write!(out, r#"        <Block confidence="{:.4}""#, block.confidence)?;
            write_box(out, &block.bounding_box)?;
            writeln!(out, ">")?;
            for line in &block.lines {
                write!(out, "          <Line")?;
                write_box(out, &line.bounding_box)?;
                writeln!(out, ">{}</Line>", cdata(&line.text))?;
            }
            writeln!(out, "        </Block>")?;
        }
        writeln!(out, "      </Blocks>")?;
    }

    if let Some(fields) = &page.form_fields {
        writeln!(out, "      <FormFields>")?;
        for field in fields {
            write!(
                out,
                r#"        <FormField label="{}" confidence="{:.4}""#,
                escaped(&field.label),
                field.confidence
            )?;
            write_box(out, &field.bounding_box)?;
            writeln!(out, ">{}</FormField>", cdata(&field.value))?;
        }
        writeln!(out, "      </FormFields>")?;
    }

    writeln!(out, "    </Page>")
}

fn bbox_title(b: &BoundingBox) -> String {
    let (x0, y0, x1, y1) = b.scaled(HOCR_CANVAS);
    format!("bbox {x0} {y0} {x1} {y1}")
}

fn word_confidence(confidence: f64) -> u32 {
    (confidence * 100.0).round().clamp(0.0, 100.0) as u32
}

fn render_hocr(result: &OcrResult) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        out,
        r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Transitional//EN" "http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd">"#
    )?;
    writeln!(
        out,
        r#"<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="en" lang="en">"#
    )?;
    writeln!(out, "<head>")?;
    writeln!(out, "<title>{}</title>", result.document_id)?;
    writeln!(
        out,
        r#"<meta http-equiv="Content-Type" content="text/html; charset=utf-8" />"#
    )?;
    writeln!(
        out,
        r#"<meta name="ocr-system" content="{}" />"#,
        escaped(&result.engine_version)
    )?;
    writeln!(
        out,
        r#"<meta name="ocr-capabilities" content="ocr_page ocr_carea ocr_line ocrx_word" />"#
    )?;
    writeln!(out, "</head>")?;
    writeln!(out, "<body>")?;

    for page in &result.pages {
        let n = page.page_number;
        writeln!(
            out,
            r#"<div class="ocr_page" id="page_{n}" title="bbox 0 0 {HOCR_CANVAS} {HOCR_CANVAS}; ppageno {}">"#,
            n.saturating_sub(1)
        )?;

        // Pages recognized without layout still get one box per text line.
        let synthesized;
        let blocks: &[TextBlock] = if page.text_blocks.is_empty() {
            synthesized = layout_text(&page.text, page.confidence);
            &synthesized
        } else {
            &page.text_blocks
        };

        for (bi, block) in blocks.iter().enumerate() {
            writeln!(
                out,
                r#"<div class="ocr_carea" id="block_{n}_{}" title="{}">"#,
                bi + 1,
                bbox_title(&block.bounding_box)
            )?;
            for (li, line) in block.lines.iter().enumerate() {
                write!(
                    out,
                    r#"<span class="ocr_line" id="line_{n}_{}_{}" title="{}">"#,
                    bi + 1,
                    li + 1,
                    bbox_title(&line.bounding_box)
                )?;
                for (wi, word) in line.words.iter().enumerate() {
                    if wi > 0 {
                        out.push(' ');
                    }
                    write!(
                        out,
                        r#"<span class="ocrx_word" id="word_{n}_{}_{}_{}" title="{}; x_wconf {}">{}</span>"#,
                        bi + 1,
                        li + 1,
                        wi + 1,
                        bbox_title(&word.bounding_box),
                        word_confidence(word.confidence),
                        escaped(&word.text)
                    )?;
                }
                writeln!(out, "</span>")?;
            }
            writeln!(out, "</div>")?;
        }
        writeln!(out, "</div>")?;
    }

    writeln!(out, "</body>")?;
    writeln!(out, "</html>")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ocr_result::{
        Demographics, FormField, OcrOptions, ProcessingMetadata, TextLine, Word,
    };
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;
    use uuid::Uuid;

    fn sample_result() -> OcrResult {
        let word = |text: &str, x: f64, confidence: f64| Word {
            text: text.to_string(),
            bounding_box: BoundingBox::new(x, 0.1, 0.2, 0.05),
            confidence,
        };
        let line = TextLine {
            text: "Fish & <Chips>".to_string(),
            bounding_box: BoundingBox::new(0.1, 0.1, 0.5, 0.05),
            words: vec![word("Fish", 0.1, 0.97), word("&", 0.3, 1.4), word("<Chips>", 0.4, -0.2)],
        };
        OcrResult {
            id: Uuid::new_v4(),
            created_at: "2025-03-01T10:00:00Z".parse().unwrap(),
            document_id: Uuid::new_v4(),
            engine_version: "engine \"1\"".to_string(),
            pages: vec![
                OcrPage {
                    page_number: 1,
                    text: "Fish & <Chips> ]]> end".to_string(),
                    text_blocks: vec![TextBlock {
                        text: line.text.clone(),
                        bounding_box: line.bounding_box,
                        confidence: 0.9,
                        lines: vec![line],
                    }],
                    confidence: 0.9,
                    form_fields: Some(vec![FormField {
                        label: "Name <first>".to_string(),
                        value: "Jane".to_string(),
                        bounding_box: BoundingBox::default(),
                        confidence: 0.8,
                    }]),
                },
                OcrPage {
                    page_number: 2,
                    text: "second page\nline two".to_string(),
                    text_blocks: Vec::new(),
                    confidence: 0.5,
                    form_fields: None,
                },
            ],
            confidence: 0.7,
            metadata: ProcessingMetadata {
                processing_time: 1.25,
                languages_detected: vec!["en-US".to_string()],
                warnings: vec!["page 3: failed".to_string()],
                options: OcrOptions::default(),
            },
            demographics: Some(Demographics {
                dates_of_birth: vec!["01/02/1960".to_string()],
                postcodes: Vec::new(),
                phone_numbers: Vec::new(),
            }),
        }
    }

    /// Parses `xml` to the end, returning the value of every `class` attribute
    /// and the concatenated CDATA of each `Text` element.
    fn scan(xml: &str) -> (Vec<String>, Vec<String>) {
        let mut reader = Reader::from_str(xml);
        let mut classes = Vec::new();
        let mut texts = Vec::new();
        let mut in_text = false;
        loop {
            match reader.read_event().unwrap() {
                Event::Start(e) => {
                    if let Some(attr) = e.try_get_attribute("class").unwrap() {
                        classes.push(String::from_utf8(attr.value.to_vec()).unwrap());
                    }
                    if e.name().as_ref() == b"Text" {
                        in_text = true;
                        texts.push(String::new());
                    }
                }
                Event::End(e) => {
                    if e.name().as_ref() == b"Text" {
                        in_text = false;
                    }
                }
                Event::CData(e) => {
                    if in_text {
                        let chunk = String::from_utf8(e.into_inner().to_vec()).unwrap();
                        if let Some(last) = texts.last_mut() {
                            last.push_str(&chunk);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        (classes, texts)
    }

    #[test]
    fn test_json_export_round_trips() {
        let result = sample_result();
        let bytes = ExportFormat::Json.exporter().export(&result).unwrap();
        let parsed: OcrResult = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, result);

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("documentId").is_some());
        assert!(value["pages"][0].get("textBlocks").is_some());
    }

    #[test]
    fn test_xml_export_is_well_formed() {
        let bytes = ExportFormat::Xml.exporter().export(&sample_result()).unwrap();
        let xml = String::from_utf8(bytes).unwrap();

        let (_, texts) = scan(&xml);
        assert_eq!(texts[0], "Fish & <Chips> ]]> end");
        assert!(xml.contains(r#"<Page number="2""#));
        assert!(xml.contains("engine &quot;1&quot;"));
        assert!(xml.contains(r#"label="Name &lt;first&gt;""#));
        assert!(xml.contains("<DateOfBirth>"));
    }

    #[test]
    fn test_hocr_export_structure() {
        let bytes = ExportFormat::Hocr.exporter().export(&sample_result()).unwrap();
        let html = String::from_utf8(bytes).unwrap();

        let (classes, _) = scan(&html);
        let count = |class: &str| classes.iter().filter(|c| c.as_str() == class).count();
        assert_eq!(count("ocr_page"), 2);
        assert_eq!(count("ocr_carea"), 2);
        assert_eq!(count("ocr_line"), 3);
        assert_eq!(count("ocrx_word"), 3 + 4);

        assert!(html.contains("bbox 100 100 300 150; x_wconf 97"));
        assert!(html.contains("x_wconf 100"));
        assert!(html.contains("x_wconf 0"));
        assert!(html.contains("&lt;Chips&gt;"));
    }

    #[test]
    fn test_exporter_descriptors() {
        let cases = [
            (ExportFormat::Json, "json", "application/json"),
            (ExportFormat::Xml, "xml", "application/xml"),
            (ExportFormat::Hocr, "hocr", "text/vnd.hocr+html"),
        ];
        for (format, extension, mime) in cases {
            let exporter = format.exporter();
            assert_eq!(exporter.file_extension(), extension);
            assert_eq!(exporter.mime_type(), mime);
            assert_eq!(format.to_string(), extension);
            assert_eq!(extension.parse::<ExportFormat>().unwrap(), format);
        }
        assert!("pdf".parse::<ExportFormat>().is_err());
        assert_eq!(" HOCR ".parse::<ExportFormat>().unwrap(), ExportFormat::Hocr);
    }

    #[test]
    fn test_cdata_splits_terminator() {
        assert_eq!(cdata("a]]>b"), "<![CDATA[a]]]]><![CDATA[>b]]>");
        assert_eq!(cdata(""), "<![CDATA[]]>");
    }

    #[test]
    fn test_control_characters_never_reach_markup() {
        let mut result = sample_result();
        result.pages[0].text = "Form\u{0C}feed\u{0}nul".to_string();
        result.pages[0].text_blocks = layout_text("Form\u{0C}feed\u{0}nul", 0.9);
        result.engine_version = "v\u{1}".to_string();

        for format in [ExportFormat::Xml, ExportFormat::Hocr] {
            let bytes = format.exporter().export(&result).unwrap();
            let out = String::from_utf8(bytes).unwrap();
            assert!(out.chars().all(is_xml_char), "{format}");
            scan(&out);
        }
        let xml = String::from_utf8(ExportFormat::Xml.exporter().export(&result).unwrap()).unwrap();
        assert_eq!(scan(&xml).1[0], "Form feed nul");
        assert_eq!(xml_chars("tab\tkept\r\n"), "tab\tkept\r\n");
    }

    #[test]
    fn test_export_to_file_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ocr_results").join("doc.json");
        let result = sample_result();

        export_to_file(&JsonExporter, &result, &path).unwrap();
        export_to_file(&JsonExporter, &result, &path).unwrap();

        let parsed: OcrResult = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.id, result.id);
    }
}
