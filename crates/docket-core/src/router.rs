//! Batch orchestration.
//!
//! The router runs the fixed stage order: flatten files into pages, parallel
//! per-page fingerprinting + classification, then the batch-barrier stages
//! (dedupe, per-file segmentation, cross-file stitching, canonical building).
//! Each barrier stage needs the complete output of the previous one, so the
//! pipeline is fan-out-then-barrier rather than streaming.
//!
//! A single page's failure never aborts a batch: page-level problems degrade
//! locally and land in `warnings`. The only batch-level failure is a batch
//! with no pages at all. The router holds nothing but immutable
//! configuration, so one instance can serve concurrent batches.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::canonical::{CanonicalBuilder, CanonicalDocument, CanonicalInvoice};
use crate::classify::PageClassifier;
use crate::config::IntakeConfig;
use crate::dedupe::{Deduper, DuplicateGroup};
use crate::fingerprint::fingerprint_page;
use crate::page::{flatten_files, PageRecord, UploadFile};
use crate::segment::{Segment, Segmenter};
use crate::stitch::{CrossFileStitcher, StitchGroup};

/// Pipeline stage a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Fingerprint,
    Classify,
    Dedupe,
    Segment,
    Stitch,
    Canonical,
}

/// A non-fatal problem recorded while processing a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchWarning {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    pub message: String,
}

/// A batch-level failure; the result still carries whatever was produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchError {
    pub stage: Stage,
    pub message: String,
}

/// Counters mirroring what the pipeline did with the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub files: usize,
    pub pages: usize,
    pub duplicate_pages: usize,
    pub segments: usize,
    pub stitch_groups: usize,
    pub canonical_entities: usize,
}

/// Everything the pipeline produced for one batch, JSON-serializable.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub canonical_invoices: Vec<CanonicalInvoice>,
    pub canonical_documents: Vec<CanonicalDocument>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub stitch_groups: Vec<StitchGroup>,
    pub warnings: Vec<BatchWarning>,
    pub errors: Vec<BatchError>,
    pub stats: BatchStats,
    pub processing_time_ms: u64,
}

impl BatchResult {
    fn empty(processing_time_ms: u64, errors: Vec<BatchError>) -> Self {
        Self {
            canonical_invoices: vec![],
            canonical_documents: vec![],
            duplicate_groups: vec![],
            stitch_groups: vec![],
            warnings: vec![],
            errors,
            stats: BatchStats::default(),
            processing_time_ms,
        }
    }
}

/// Orchestrates the intake pipeline for independent upload batches.
#[derive(Debug, Clone)]
pub struct IntakeRouter {
    config: IntakeConfig,
}

impl IntakeRouter {
    pub fn new(config: IntakeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Process one batch of uploaded files.
    pub fn process_upload(&self, files: &[UploadFile]) -> BatchResult {
        self.process_upload_with_cancel(files, &AtomicBool::new(false))
    }

    /// Process one batch, checking `cancel` before each barrier stage.
    ///
    /// In-flight per-page work is allowed to finish (it is cheap); the
    /// barrier stages are the expensive part and are skipped once the flag
    /// is set, returning the partial result with a cancellation error.
    pub fn process_upload_with_cancel(
        &self,
        files: &[UploadFile],
        cancel: &AtomicBool,
    ) -> BatchResult {
        let started = Instant::now();
        let mut warnings: Vec<BatchWarning> = Vec::new();

        tracing::info!(files = files.len(), "starting intake batch");
        let pages = flatten_files(files);
        if pages.is_empty() {
            tracing::warn!("batch contains no readable pages");
            return BatchResult::empty(
                started.elapsed().as_millis() as u64,
                vec![BatchError {
                    stage: Stage::Intake,
                    message: "no pages could be read from the upload".to_string(),
                }],
            );
        }

        // Fan-out: one independent fingerprint+classify computation per page
        let classifier = PageClassifier::new(self.config.classifier_min_margin);
        let fan_out: Vec<(PageRecord, Vec<String>)> = pages
            .into_par_iter()
            .map(|page| {
                let fingerprinted = fingerprint_page(&page.id(), &page.text, page.image.as_deref());
                let classification = classifier.classify(&page.text);
                let record = PageRecord {
                    page,
                    fingerprint: fingerprinted.fingerprint,
                    classification,
                };
                (record, fingerprinted.warnings)
            })
            .collect();

        let mut records = Vec::with_capacity(fan_out.len());
        for (record, page_warnings) in fan_out {
            for message in page_warnings {
                warnings.push(BatchWarning {
                    stage: Stage::Fingerprint,
                    page: Some(record.id()),
                    message,
                });
            }
            if record.classification.low_confidence {
                warnings.push(BatchWarning {
                    stage: Stage::Classify,
                    page: Some(record.id()),
                    message: format!(
                        "classification margin {:.2} below minimum, routed for manual review",
                        record.classification.margin
                    ),
                });
            }
            records.push(record);
        }
        tracing::info!(pages = records.len(), "fingerprinted and classified");

        if let Some(result) = self.cancelled(cancel, "dedupe", started, &warnings) {
            return result;
        }
        let duplicate_groups = Deduper::new(&self.config).dedupe(&records);
        for group in &duplicate_groups {
            warnings.push(BatchWarning {
                stage: Stage::Dedupe,
                page: Some(group.representative.clone()),
                message: format!(
                    "{} pages collapsed into {} ({:?})",
                    group.members.len(),
                    group.group_id,
                    group.kind
                ),
            });
        }

        if let Some(result) = self.cancelled(cancel, "segment", started, &warnings) {
            return result;
        }
        let segments = self.segment_files(files, &records, &duplicate_groups);
        tracing::info!(segments = segments.len(), "segmentation complete");

        if let Some(result) = self.cancelled(cancel, "stitch", started, &warnings) {
            return result;
        }
        let stitch_outcome = CrossFileStitcher::new(&self.config).stitch(&segments);
        for message in stitch_outcome.warnings {
            warnings.push(BatchWarning {
                stage: Stage::Stitch,
                page: None,
                message,
            });
        }

        if let Some(result) = self.cancelled(cancel, "canonical", started, &warnings) {
            return result;
        }
        let (canonical_invoices, canonical_documents) =
            CanonicalBuilder::new(&self.config).build(&stitch_outcome.groups, &segments);

        let stats = BatchStats {
            files: files.len(),
            pages: records.len(),
            duplicate_pages: duplicate_groups
                .iter()
                .map(|g| g.members.len() - 1)
                .sum(),
            segments: segments.len(),
            stitch_groups: stitch_outcome.groups.len(),
            canonical_entities: canonical_invoices.len() + canonical_documents.len(),
        };
        tracing::info!(
            invoices = canonical_invoices.len(),
            documents = canonical_documents.len(),
            warnings = warnings.len(),
            "intake batch complete"
        );

        BatchResult {
            canonical_invoices,
            canonical_documents,
            duplicate_groups,
            stitch_groups: stitch_outcome.groups,
            warnings,
            errors: vec![],
            stats,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Segment each file's surviving pages (duplicate-group members other
    /// than the representative are excluded, but remain in the audit trail).
    fn segment_files(
        &self,
        files: &[UploadFile],
        records: &[PageRecord],
        duplicate_groups: &[DuplicateGroup],
    ) -> Vec<Segment> {
        let excluded: HashSet<&str> = duplicate_groups
            .iter()
            .flat_map(|g| {
                g.members
                    .iter()
                    .filter(|m| **m != g.representative)
                    .map(String::as_str)
            })
            .collect();

        let segmenter = Segmenter::new(&self.config);
        let mut segments = Vec::new();
        for file in files {
            let mut file_records: Vec<&PageRecord> = records
                .iter()
                .filter(|r| r.page.file_id == file.file_id)
                .filter(|r| !excluded.contains(r.id().as_str()))
                .collect();
            file_records.sort_by_key(|r| r.page.ordinal);
            if file_records.is_empty() {
                continue;
            }
            segments.extend(segmenter.segment(&file.file_id, &file_records));
        }
        segments
    }

    fn cancelled(
        &self,
        cancel: &AtomicBool,
        stage: &str,
        started: Instant,
        warnings: &[BatchWarning],
    ) -> Option<BatchResult> {
        if !cancel.load(Ordering::Relaxed) {
            return None;
        }
        tracing::warn!(stage, "batch cancelled before barrier stage");
        let mut result = BatchResult::empty(
            started.elapsed().as_millis() as u64,
            vec![BatchError {
                stage: Stage::Intake,
                message: format!("batch cancelled before {stage} stage"),
            }],
        );
        result.warnings = warnings.to_vec();
        Some(result)
    }
}
