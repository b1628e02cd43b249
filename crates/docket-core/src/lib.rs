//! docket-core: document intake & canonicalization pipeline
//!
//! This crate turns a batch of OCR'd uploads into canonical invoice/document
//! records:
//! - Per-page content fingerprints (image hash, header/footer simhash, text
//!   hash) and deterministic type classification
//! - Duplicate-page collapsing via banded candidate generation + union-find
//! - Within-file segmentation at scored document boundaries
//! - Cross-file stitching of document fragments
//! - Canonical entity building with field provenance
//!
//! The pipeline is a pure function of its input batch plus an
//! [`IntakeConfig`]; re-running the same batch yields identical results.

pub mod canonical;
pub mod classify;
pub mod config;
pub mod dedupe;
pub mod extract;
pub mod fingerprint;
pub mod page;
pub mod router;
pub mod segment;
pub mod stitch;

// Re-exports
pub use canonical::{CanonicalBuilder, CanonicalDocument, CanonicalInvoice};
pub use classify::{Classification, DocType, PageClassifier};
pub use config::{load_config, IntakeConfig};
pub use dedupe::{Deduper, DuplicateGroup, DuplicateKind};
pub use extract::LineItem;
pub use fingerprint::{
    fingerprint_page, hamming, similarity, Fingerprinted, PageFingerprint, HASH_BITS,
};
pub use page::{flatten_files, page_id, Page, PageInput, PageRecord, UploadFile, WordBox};
pub use router::{
    BatchError, BatchResult, BatchStats, BatchWarning, IntakeRouter, Stage,
};
pub use segment::{Segment, Segmenter, SPLIT_THRESHOLD};
pub use stitch::{CrossFileStitcher, StitchGroup, StitchOutcome};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports_compile() {
        let config = IntakeConfig::default();
        let _router = IntakeRouter::new(config.clone());
        let _classifier = PageClassifier::new(config.classifier_min_margin);
        let _deduper = Deduper::new(&config);
        let _segmenter = Segmenter::new(&config);
        let _stitcher = CrossFileStitcher::new(&config);
        let _builder = CanonicalBuilder::new(&config);
        assert!(SPLIT_THRESHOLD > 0.0);
        assert_eq!(HASH_BITS, 64);
    }
}
