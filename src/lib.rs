pub mod commands;
pub mod config;
pub mod data;
pub mod doc_path;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

pub use data::document::Document;
pub use error::AppError;
pub use models::document::DocumentMetadata;
pub use models::ocr_result::{OcrOptions, OcrResult};
