pub mod document;
pub mod ocr_result;
