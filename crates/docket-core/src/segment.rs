//! Within-file segmentation.
//!
//! Pages of one uploaded file are walked in order and cut into contiguous
//! segments at scored document boundaries. The score keeps multi-invoice
//! submissions from one supplier apart without shredding a single invoice
//! whose later pages happen to repeat the letterhead:
//!
//! `split = header + totals_end_bonus·[prev page had totals] − supplier_switch_penalty·[same supplier]`
//!
//! A page opens a new segment when the score clears [`SPLIT_THRESHOLD`].
//! Segments never span files and are never empty.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::classify::DocType;
use crate::config::IntakeConfig;
use crate::extract;
use crate::fingerprint::PageFingerprint;
use crate::page::PageRecord;

/// Fixed split threshold. A detected header splits on its own (1.0), a
/// header on a continuing-supplier run does not (1.0 − penalty), and a
/// header right after a totals line splits even mid-supplier
/// (1.0 + bonus − penalty).
pub const SPLIT_THRESHOLD: f64 = 0.75;

/// An ordered, contiguous run of pages from one source file, believed to be
/// one logical document (or a fragment of one).
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub segment_id: String,
    pub file_id: String,
    pub page_ids: Vec<String>,
    pub doc_type: DocType,
    pub supplier: Option<String>,
    pub invoice_numbers: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// First page shows document-start evidence.
    pub has_opening_header: bool,
    /// Last page carries a totals line.
    pub has_closing_totals: bool,
    /// Fingerprint of the first page; its header hash is what a preceding
    /// fragment's footer would resemble.
    pub lead_fingerprint: PageFingerprint,
    /// Fingerprint of the last page.
    pub tail_fingerprint: PageFingerprint,
    /// Concatenated page text in page order.
    #[serde(skip)]
    pub text: String,
    /// Mean classification confidence of the member pages.
    pub confidence: f64,
    /// Any member page classified low-confidence.
    pub low_confidence: bool,
    /// First "page N of M" marker seen on a member page.
    pub page_marker: Option<(u32, Option<u32>)>,
    pub uploaded_at: DateTime<Utc>,
    pub first_ordinal: usize,
}

/// Splits one file's pages into logical document segments.
#[derive(Debug, Clone)]
pub struct Segmenter {
    totals_end_bonus: f64,
    supplier_switch_penalty: f64,
}

impl Segmenter {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            totals_end_bonus: config.segment_totals_end_bonus,
            supplier_switch_penalty: config.segment_supplier_switch_penalty,
        }
    }

    /// Segment one file's surviving pages, given in ordinal order.
    pub fn segment(&self, file_id: &str, records: &[&PageRecord]) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut current: Vec<&PageRecord> = Vec::new();
        let mut current_supplier: Option<String> = None;

        for record in records {
            if !current.is_empty() {
                let score = self.split_score(record, current.last().unwrap(), &current_supplier);
                if score > SPLIT_THRESHOLD {
                    tracing::debug!(
                        file = file_id,
                        page = %record.id(),
                        score,
                        "opening new segment"
                    );
                    segments.push(build_segment(file_id, segments.len(), &current));
                    current.clear();
                    current_supplier = None;
                }
            }
            current.push(record);
            if current_supplier.is_none() {
                current_supplier = extract::supplier(&record.page.text);
            }
        }
        if !current.is_empty() {
            segments.push(build_segment(file_id, segments.len(), &current));
        }
        segments
    }

    fn split_score(
        &self,
        candidate: &PageRecord,
        previous: &PageRecord,
        current_supplier: &Option<String>,
    ) -> f64 {
        let mut score = if extract::has_opening_header(&candidate.page.text) {
            1.0
        } else {
            0.0
        };
        if extract::has_totals_line(&previous.page.text) {
            score += self.totals_end_bonus;
        }
        if let (Some(candidate_supplier), Some(running)) =
            (extract::supplier(&candidate.page.text), current_supplier)
        {
            if candidate_supplier.eq_ignore_ascii_case(running) {
                score -= self.supplier_switch_penalty;
            }
        }
        score
    }
}

fn build_segment(file_id: &str, index: usize, pages: &[&PageRecord]) -> Segment {
    let text = pages
        .iter()
        .map(|r| r.page.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut invoice_numbers: Vec<String> = pages
        .iter()
        .flat_map(|r| extract::invoice_numbers(&r.page.text))
        .collect();
    invoice_numbers.sort();
    invoice_numbers.dedup();

    let mut dates: Vec<NaiveDate> = pages.iter().flat_map(|r| extract::dates(&r.page.text)).collect();
    dates.sort();
    dates.dedup();

    let first = pages.first().expect("segments are never empty");
    let last = pages.last().expect("segments are never empty");

    Segment {
        segment_id: format!("{file_id}#s{index}"),
        file_id: file_id.to_string(),
        page_ids: pages.iter().map(|r| r.id()).collect(),
        doc_type: vote_doc_type(pages),
        supplier: pages.iter().find_map(|r| extract::supplier(&r.page.text)),
        invoice_numbers,
        dates,
        has_opening_header: extract::has_opening_header(&first.page.text),
        has_closing_totals: extract::has_totals_line(&last.page.text),
        lead_fingerprint: first.fingerprint.clone(),
        tail_fingerprint: last.fingerprint.clone(),
        text,
        confidence: pages.iter().map(|r| r.classification.confidence).sum::<f64>()
            / pages.len() as f64,
        low_confidence: pages.iter().any(|r| r.classification.low_confidence),
        page_marker: pages.iter().find_map(|r| extract::page_marker(&r.page.text)),
        uploaded_at: first.page.uploaded_at,
        first_ordinal: first.page.ordinal,
    }
}

/// Confidence-weighted vote over member pages' types. Ties resolve to the
/// earlier type in [`DocType`] declaration order; `Other` only wins when
/// nothing else scores.
fn vote_doc_type(pages: &[&PageRecord]) -> DocType {
    const ORDER: [DocType; 5] = [
        DocType::Invoice,
        DocType::Delivery,
        DocType::Receipt,
        DocType::Utility,
        DocType::Other,
    ];
    let mut scores = [0.0f64; ORDER.len()];
    for record in pages {
        let slot = ORDER
            .iter()
            .position(|t| *t == record.classification.doc_type)
            .unwrap_or(ORDER.len() - 1);
        scores[slot] += record.classification.confidence.max(f64::MIN_POSITIVE);
    }
    let mut best = ORDER.len() - 1;
    for i in 0..ORDER.len() - 1 {
        if scores[i] > 0.0 && (best == ORDER.len() - 1 || scores[i] > scores[best]) {
            best = i;
        }
    }
    ORDER[best]
}
