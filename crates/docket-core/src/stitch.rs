//! Cross-file stitching.
//!
//! Uploads often split one logical document across files: a scanner tray
//! jams, the user re-scans the back half, or a batch is emailed as two PDFs.
//! Segments that look incomplete (no opening header, no closing totals) are
//! scored against segments from other files on supplier, invoice-number,
//! date, template-hash and timing signals; pairs at or above the stitch
//! threshold merge into one group.
//!
//! Grouping is greedy from the highest-scoring pair down. A candidate whose
//! endpoints already landed in different groups is a runner-up: it is
//! reported as an ambiguous-stitch warning, never silently dropped.

use chrono::NaiveDate;
use serde::Serialize;

use crate::classify::DocType;
use crate::config::IntakeConfig;
use crate::fingerprint::similarity;
use crate::segment::Segment;

/// One or more segments, possibly from different files, judged to be
/// fragments of one logical document.
#[derive(Debug, Clone, Serialize)]
pub struct StitchGroup {
    pub group_id: String,
    /// Segment ids in reading order (page marker, then upload time, then
    /// file id, then position).
    pub segment_ids: Vec<String>,
    pub doc_type: DocType,
    pub supplier: Option<String>,
    pub invoice_numbers: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// The score that justified the grouping; 1.0 for singletons.
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Stitch results plus ambiguity warnings for the batch report.
#[derive(Debug, Clone)]
pub struct StitchOutcome {
    pub groups: Vec<StitchGroup>,
    pub warnings: Vec<String>,
}

struct Candidate {
    a: usize,
    b: usize,
    score: f64,
    reasons: Vec<String>,
}

/// Stitches incomplete segments across uploaded files.
#[derive(Debug, Clone)]
pub struct CrossFileStitcher {
    stitch_score_min: f64,
    header_similarity_min: f64,
    footer_similarity_min: f64,
    max_group_size: usize,
}

impl CrossFileStitcher {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            stitch_score_min: config.stitch_score_min,
            header_similarity_min: config.header_similarity_min,
            footer_similarity_min: config.footer_similarity_min,
            max_group_size: config.max_stitch_group_size.max(1),
        }
    }

    /// Group segments into stitch groups. Every segment lands in exactly one
    /// group; segments with no strong enough candidate stay singletons.
    pub fn stitch(&self, segments: &[Segment]) -> StitchOutcome {
        let mut warnings = Vec::new();
        let mut candidates = self.find_candidates(segments);
        // Highest score first; id tie-break keeps repeated runs identical
        candidates.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    (&segments[x.a].segment_id, &segments[x.b].segment_id)
                        .cmp(&(&segments[y.a].segment_id, &segments[y.b].segment_id))
                })
        });

        // group index per segment, filled as candidates are accepted
        let mut group_of: Vec<Option<usize>> = vec![None; segments.len()];
        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut scores: Vec<f64> = Vec::new();
        let mut reasons: Vec<Vec<String>> = Vec::new();

        for candidate in candidates {
            let (a, b) = (candidate.a, candidate.b);
            match (group_of[a], group_of[b]) {
                (None, None) => {
                    let g = members.len();
                    members.push(vec![a, b]);
                    scores.push(candidate.score);
                    reasons.push(candidate.reasons);
                    group_of[a] = Some(g);
                    group_of[b] = Some(g);
                }
                (Some(g), None) | (None, Some(g)) => {
                    if members[g].len() >= self.max_group_size {
                        warnings.push(format!(
                            "stitch group size cap reached: {} left out of group with {} (score {:.2})",
                            segments[b].segment_id, segments[a].segment_id, candidate.score
                        ));
                        continue;
                    }
                    let newcomer = if group_of[a].is_none() { a } else { b };
                    members[g].push(newcomer);
                    scores[g] = scores[g].min(candidate.score);
                    reasons[g].extend(candidate.reasons);
                    group_of[newcomer] = Some(g);
                }
                (Some(ga), Some(gb)) if ga == gb => {}
                (Some(_), Some(_)) => {
                    // Both endpoints already committed to higher-scoring
                    // groups: the runner-up match is surfaced, not applied
                    warnings.push(format!(
                        "ambiguous stitch: {} also matched {} (score {:.2}), kept in separate groups",
                        segments[a].segment_id, segments[b].segment_id, candidate.score
                    ));
                }
            }
        }

        // Singletons for everything left over
        for (i, slot) in group_of.iter_mut().enumerate() {
            if slot.is_none() {
                let g = members.len();
                members.push(vec![i]);
                scores.push(1.0);
                reasons.push(vec!["single segment".to_string()]);
                *slot = Some(g);
            }
        }

        // Deterministic group order: first member appearance in input order
        let mut order: Vec<usize> = (0..members.len()).collect();
        order.sort_by_key(|g| *members[*g].iter().min().unwrap_or(&usize::MAX));

        let groups = order
            .iter()
            .enumerate()
            .map(|(index, g)| {
                build_group(index, &members[*g], scores[*g], reasons[*g].clone(), segments)
            })
            .collect();

        StitchOutcome { groups, warnings }
    }

    fn find_candidates(&self, segments: &[Segment]) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for a in 0..segments.len() {
            for b in a + 1..segments.len() {
                if segments[a].file_id == segments[b].file_id {
                    continue;
                }
                if !self.eligible(&segments[a], &segments[b]) {
                    continue;
                }
                let (score, reasons) = self.score_pair(&segments[a], &segments[b]);
                if score >= self.stitch_score_min {
                    candidates.push(Candidate {
                        a,
                        b,
                        score,
                        reasons,
                    });
                }
            }
        }
        candidates
    }

    /// A pair is worth scoring when either side looks like a fragment, or
    /// when one side's tail template flows into the other's lead.
    fn eligible(&self, a: &Segment, b: &Segment) -> bool {
        let incomplete =
            |s: &Segment| !s.has_opening_header || !s.has_closing_totals;
        incomplete(a) || incomplete(b) || self.continuation_similarity(a, b).is_some()
    }

    /// Best tail-footer to lead-header similarity across both orientations,
    /// when it clears the footer floor.
    fn continuation_similarity(&self, a: &Segment, b: &Segment) -> Option<f64> {
        let forward = pair_similarity(a.tail_fingerprint.footer_hash, b.lead_fingerprint.header_hash);
        let backward = pair_similarity(b.tail_fingerprint.footer_hash, a.lead_fingerprint.header_hash);
        let best = forward.max(backward);
        (best >= self.footer_similarity_min).then_some(best)
    }

    fn score_pair(&self, a: &Segment, b: &Segment) -> (f64, Vec<String>) {
        let mut score = 0.0;
        let mut reasons = Vec::new();

        match (&a.supplier, &b.supplier) {
            (Some(x), Some(y)) if x.eq_ignore_ascii_case(y) => {
                score += 0.3;
                reasons.push(format!("same supplier ({x})"));
            }
            (Some(x), Some(y))
                if x.to_lowercase().contains(&y.to_lowercase())
                    || y.to_lowercase().contains(&x.to_lowercase()) =>
            {
                score += 0.2;
                reasons.push("similar supplier".to_string());
            }
            _ => {}
        }

        if let Some(common) = a
            .invoice_numbers
            .iter()
            .find(|n| b.invoice_numbers.contains(n))
        {
            score += 0.4;
            reasons.push(format!("common invoice number ({common})"));
        } else if a.invoice_numbers.iter().any(|x| {
            b.invoice_numbers
                .iter()
                .any(|y| edit_distance(x, y) <= 1)
        }) {
            score += 0.25;
            reasons.push("near-matching invoice number".to_string());
        }

        if a.dates.iter().any(|d| b.dates.contains(d)) {
            score += 0.15;
            reasons.push("common date".to_string());
        } else if a.dates.iter().any(|x| {
            b.dates
                .iter()
                .any(|y| (*x - *y).num_days().abs() <= 7)
        }) {
            score += 0.10;
            reasons.push("dates within a week".to_string());
        }

        if let Some(sim) = self.continuation_similarity(a, b) {
            score += 0.25;
            reasons.push(format!("footer flows into header (similarity {sim:.2})"));
        }
        if let Some(sim) =
            pair_similarity_min(a.lead_fingerprint.header_hash, b.lead_fingerprint.header_hash, self.header_similarity_min)
        {
            score += 0.10;
            reasons.push(format!("matching letterhead (similarity {sim:.2})"));
        }

        if (a.uploaded_at - b.uploaded_at).num_seconds().abs() <= 3600 {
            score += 0.05;
            reasons.push("uploaded within an hour".to_string());
        }

        if a.doc_type == b.doc_type && a.doc_type != DocType::Other {
            score += 0.10;
            reasons.push(format!("same document type ({})", a.doc_type));
        }

        // Raw sum, not clamped: saturating at 1.0 would erase the ordering
        // between strong candidates that greedy grouping depends on
        (score, reasons)
    }
}

fn pair_similarity(a: Option<u64>, b: Option<u64>) -> f64 {
    match (a, b) {
        (Some(x), Some(y)) => similarity(x, y),
        _ => 0.0,
    }
}

fn pair_similarity_min(a: Option<u64>, b: Option<u64>, min: f64) -> Option<f64> {
    let sim = pair_similarity(a, b);
    (sim >= min).then_some(sim)
}

fn build_group(
    index: usize,
    member_indices: &[usize],
    score: f64,
    mut reasons: Vec<String>,
    segments: &[Segment],
) -> StitchGroup {
    let mut ordered: Vec<&Segment> = member_indices.iter().map(|i| &segments[*i]).collect();
    ordered.sort_by(|x, y| {
        let marker = |s: &Segment| s.page_marker.map_or(u32::MAX, |(n, _)| n);
        marker(x)
            .cmp(&marker(y))
            .then_with(|| x.uploaded_at.cmp(&y.uploaded_at))
            .then_with(|| x.file_id.cmp(&y.file_id))
            .then_with(|| x.first_ordinal.cmp(&y.first_ordinal))
    });

    let mut invoice_numbers: Vec<String> = ordered
        .iter()
        .flat_map(|s| s.invoice_numbers.iter().cloned())
        .collect();
    invoice_numbers.sort();
    invoice_numbers.dedup();

    let mut dates: Vec<NaiveDate> = ordered.iter().flat_map(|s| s.dates.iter().copied()).collect();
    dates.sort();
    dates.dedup();

    reasons.sort();
    reasons.dedup();

    StitchGroup {
        group_id: format!("stitch-{index}"),
        segment_ids: ordered.iter().map(|s| s.segment_id.clone()).collect(),
        doc_type: vote_doc_type(&ordered),
        supplier: ordered.iter().find_map(|s| s.supplier.clone()),
        invoice_numbers,
        dates,
        score,
        reasons,
    }
}

/// Confidence-weighted type vote across segments; `Other` only wins when
/// nothing else scores.
fn vote_doc_type(segments: &[&Segment]) -> DocType {
    const ORDER: [DocType; 5] = [
        DocType::Invoice,
        DocType::Delivery,
        DocType::Receipt,
        DocType::Utility,
        DocType::Other,
    ];
    let mut scores = [0.0f64; ORDER.len()];
    for segment in segments {
        let slot = ORDER
            .iter()
            .position(|t| *t == segment.doc_type)
            .unwrap_or(ORDER.len() - 1);
        scores[slot] += segment.confidence.max(f64::MIN_POSITIVE);
    }
    let mut best = ORDER.len() - 1;
    for i in 0..ORDER.len() - 1 {
        if scores[i] > 0.0 && (best == ORDER.len() - 1 || scores[i] > scores[best]) {
            best = i;
        }
    }
    ORDER[best]
}

/// Levenshtein distance; used only for near-matching invoice numbers, which
/// are short, so the quadratic table is fine.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
