//! Configuration for the intake pipeline.
//!
//! Every threshold the pipeline consults lives here as a named field with a
//! documented default, loadable from TOML. The router takes the config by
//! value at construction and never mutates it, so one router can serve
//! concurrent batches.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Tunable thresholds for deduplication, segmentation, stitching and review
/// flagging.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Max Hamming distance between two image hashes for the pages to count
    /// as near-duplicates.
    pub image_hash_dup_distance_max: u32,
    /// Minimum header-simhash similarity (0-1) for two pages to share a
    /// template.
    pub header_similarity_min: f64,
    /// Minimum footer-simhash similarity (0-1) for two pages to share a
    /// template.
    pub footer_similarity_min: f64,
    /// Minimum combined score to accept a cross-file stitch.
    pub stitch_score_min: f64,
    /// Canonical entities below this overall confidence are flagged for
    /// manual review.
    pub low_overall_confidence_threshold: f64,
    /// Classifications whose margin falls below this are tagged
    /// low-confidence.
    pub classifier_min_margin: f64,
    /// Split-score bonus when the previous page carried a grand-total line.
    pub segment_totals_end_bonus: f64,
    /// Split-score penalty when the candidate header's supplier matches the
    /// running segment's supplier.
    pub segment_supplier_switch_penalty: f64,
    /// Upper bound on segments merged into one stitch group.
    pub max_stitch_group_size: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            image_hash_dup_distance_max: 8,
            header_similarity_min: 0.86,
            footer_similarity_min: 0.84,
            stitch_score_min: 0.72,
            low_overall_confidence_threshold: 0.60,
            classifier_min_margin: 0.15,
            segment_totals_end_bonus: 0.5,
            segment_supplier_switch_penalty: 0.6,
            max_stitch_group_size: 10,
        }
    }
}

/// Load an [`IntakeConfig`] from a TOML file.
///
/// A missing file yields the defaults; a present-but-invalid file is an
/// error, since silently ignoring a deployment's thresholds is worse than
/// failing fast.
pub fn load_config(path: &Path) -> Result<IntakeConfig> {
    if !path.exists() {
        return Ok(IntakeConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: IntakeConfig =
        toml::from_str(&contents).context("Failed to parse config file as TOML")?;
    Ok(config)
}
