pub mod archive;
pub mod document;
pub mod ledger;
pub mod migrations;
