//! Input data model for the intake pipeline.
//!
//! The OCR engine upstream of this crate hands us, per uploaded file, a list
//! of pages: UTF-8 text, word-level boxes and (optionally) the rendered page
//! raster. Everything here is immutable once ingested; the pipeline is a pure
//! function of a batch of [`UploadFile`]s plus an
//! [`IntakeConfig`](crate::IntakeConfig).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Classification;
use crate::fingerprint::PageFingerprint;

/// One uploaded file and the OCR output for each of its pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    /// Caller-assigned id, unique within the batch (e.g. the stored filename).
    pub file_id: String,
    /// When the file arrived. Used for duplicate-representative and
    /// stitch-ordering tie-breaks, never for content decisions.
    pub uploaded_at: DateTime<Utc>,
    pub pages: Vec<PageInput>,
}

/// OCR output for a single page, as delivered by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInput {
    /// Normalized UTF-8 text of the page.
    pub text: String,
    /// Encoded raster of the rendered page (PNG/JPEG). Absence degrades the
    /// fingerprint but never blocks processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    /// Word-level boxes. Opaque to this crate; carried through for
    /// provenance.
    #[serde(default)]
    pub word_boxes: Vec<WordBox>,
    /// Page-level OCR confidence in [0,1] as reported by the engine.
    #[serde(default = "default_ocr_confidence")]
    pub ocr_confidence: f64,
}

fn default_ocr_confidence() -> f64 {
    1.0
}

/// A recognized word with its bounding box, in page coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordBox {
    pub text: String,
    pub confidence: f64,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A page flattened out of its [`UploadFile`], ready for fingerprinting.
#[derive(Debug, Clone)]
pub struct Page {
    pub file_id: String,
    /// Zero-based position within the source file.
    pub ordinal: usize,
    pub text: String,
    pub image: Option<Vec<u8>>,
    pub word_boxes: Vec<WordBox>,
    pub uploaded_at: DateTime<Utc>,
    pub ocr_confidence: f64,
}

impl Page {
    /// Deterministic page id: `"{file_id}#p{ordinal}"`.
    pub fn id(&self) -> String {
        page_id(&self.file_id, self.ordinal)
    }
}

/// Build the id a page of `file_id` at `ordinal` would carry.
pub fn page_id(file_id: &str, ordinal: usize) -> String {
    format!("{file_id}#p{ordinal}")
}

/// A page together with its derived signature and label.
///
/// The pipeline guarantees exactly one fingerprint and one classification per
/// page; this record is what the barrier stages consume.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub page: Page,
    pub fingerprint: PageFingerprint,
    pub classification: Classification,
}

impl PageRecord {
    pub fn id(&self) -> String {
        self.page.id()
    }
}

/// Flatten a batch of files into pages in upload order.
///
/// Page order is the order the caller gave us: files in slice order, pages in
/// ordinal order. Every downstream stage relies on this being stable.
pub fn flatten_files(files: &[UploadFile]) -> Vec<Page> {
    let mut pages = Vec::new();
    for file in files {
        for (ordinal, input) in file.pages.iter().enumerate() {
            pages.push(Page {
                file_id: file.file_id.clone(),
                ordinal,
                text: input.text.clone(),
                image: input.image.clone(),
                word_boxes: input.word_boxes.clone(),
                uploaded_at: file.uploaded_at,
                ocr_confidence: input.ocr_confidence.clamp(0.0, 1.0),
            });
        }
    }
    pages
}
