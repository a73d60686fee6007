use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RecognitionLevel {
    #[default]
    Accurate,
    Fast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OcrOptions {
    pub recognition_level: RecognitionLevel,
    pub languages: Vec<String>,
    pub use_language_correction: bool,
    pub extract_form_fields: bool,
    pub extract_demographics: bool,
    pub custom_words: Vec<String>,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            recognition_level: RecognitionLevel::Accurate,
            languages: vec!["en-US".to_string()],
            use_language_correction: true,
            extract_form_fields: false,
            extract_demographics: false,
            custom_words: Vec::new(),
        }
    }
}

/// Box in page coordinates normalized to `0..=1`, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// `(x0, y0, x1, y1)` on a square canvas of `size` units.
    pub fn scaled(&self, size: u32) -> (u32, u32, u32, u32) {
        let scale = |v: f64| (v.clamp(0.0, 1.0) * size as f64).round() as u32;
        (
            scale(self.x),
            scale(self.y),
            scale(self.x + self.width),
            scale(self.y + self.height),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Word {
    pub text: String,
    pub bounding_box: BoundingBox,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextLine {
    pub text: String,
    pub bounding_box: BoundingBox,
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    pub text: String,
    pub bounding_box: BoundingBox,
    pub confidence: f64,
    pub lines: Vec<TextLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub label: String,
    pub value: String,
    pub bounding_box: BoundingBox,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrPage {
    pub page_number: u32,
    pub text: String,
    pub text_blocks: Vec<TextBlock>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_fields: Option<Vec<FormField>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    pub dates_of_birth: Vec<String>,
    pub postcodes: Vec<String>,
    pub phone_numbers: Vec<String>,
}

impl Demographics {
    pub fn is_empty(&self) -> bool {
        self.dates_of_birth.is_empty() && self.postcodes.is_empty() && self.phone_numbers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    pub processing_time: f64,
    pub languages_detected: Vec<String>,
    pub warnings: Vec<String>,
    pub options: OcrOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub document_id: Uuid,
    pub engine_version: String,
    pub pages: Vec<OcrPage>,
    pub confidence: f64,
    pub metadata: ProcessingMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demographics: Option<Demographics>,
}

/// Mean of the page confidences; zero pages gives 0.
pub fn aggregate_confidence(pages: &[OcrPage]) -> f64 {
    if pages.is_empty() {
        return 0.0;
    }
    pages.iter().map(|p| p.confidence).sum::<f64>() / pages.len() as f64
}
