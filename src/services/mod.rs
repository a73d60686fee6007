pub mod export_service;
pub mod extraction;
pub mod health_service;
pub mod ocr_service;
pub mod processing_state;
pub mod watch_service;
