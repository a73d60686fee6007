use std::sync::OnceLock;

use regex::Regex;

use crate::models::ocr_result::{BoundingBox, Demographics, FormField, OcrPage};

fn form_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z][A-Za-z .'/()\-]{0,40}?)\s*:\s*(\S.*?)\s*$").unwrap())
}

fn date_of_birth_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:dob|d\.o\.b\.?|date of birth)\s*[:\-]?\s*(\d{1,2}[/.\-]\d{1,2}[/.\-]\d{2,4})")
            .unwrap()
    })
}

fn postcode_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z]{1,2}[0-9][A-Z0-9]?)\s*([0-9][A-Z]{2})\b").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:\+44\s?|\b0)(?:\d[\s\-]?){9,10}\b").unwrap())
}

/// `Label: value` lines of a recognized page.
pub fn extract_form_fields(page: &OcrPage) -> Vec<FormField> {
    let mut fields = Vec::new();

    if page.text_blocks.is_empty() {
        for line in page.text.lines() {
            if let Some(field) = parse_field(line, BoundingBox::default(), page.confidence) {
                fields.push(field);
            }
        }
        return fields;
    }

    for block in &page.text_blocks {
        for line in &block.lines {
            let confidence = if line.words.is_empty() {
                block.confidence
            } else {
                line.words.iter().map(|w| w.confidence).sum::<f64>() / line.words.len() as f64
            };
            if let Some(field) = parse_field(&line.text, line.bounding_box, confidence) {
                fields.push(field);
            }
        }
    }
    fields
}

fn parse_field(line: &str, bounding_box: BoundingBox, confidence: f64) -> Option<FormField> {
    let caps = form_field_re().captures(line)?;
    Some(FormField {
        label: caps[1].trim().to_string(),
        value: caps[2].to_string(),
        bounding_box,
        confidence,
    })
}

pub fn extract_demographics(text: &str) -> Demographics {
    let mut demographics = Demographics::default();

    for caps in date_of_birth_re().captures_iter(text) {
        push_unique(&mut demographics.dates_of_birth, caps[1].to_string());
    }

    let upper = text.to_uppercase();
    for caps in postcode_re().captures_iter(&upper) {
        push_unique(&mut demographics.postcodes, format!("{} {}", &caps[1], &caps[2]));
    }

    for m in phone_re().find_iter(text) {
        let digits: String = m
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        push_unique(&mut demographics.phone_numbers, digits);
    }

    demographics
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}
