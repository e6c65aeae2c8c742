//! Parsers for the files the simulator emits: spreadsheet-ML optimization
//! reports, UTF-16 single-run HTML reports, and the per-deal trade stream.

pub mod deals;
pub mod html;
pub mod xml;

use std::path::PathBuf;

use thiserror::Error;

/// Parse failures are surfaced, never guessed around.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read report: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("no optimization passes found")]
    NoPasses,
    #[error("matched only {matched}/{required} core report fields; format may have changed")]
    MissingCoreFields { matched: usize, required: usize },
    #[error("no trades found in report")]
    NoTrades,
}
