//! Duplicate-page detection.
//!
//! Two pages are duplicates when any of three signals fires: identical
//! normalized text hash, image hashes within a Hamming budget, or header AND
//! footer simhashes both above their similarity floors (same template from
//! both ends is stronger evidence than either alone). Groups are the
//! transitive closure of those pairwise edges.
//!
//! Candidate generation is banded rather than all-pairs: a 64-bit hash is cut
//! into `distance_budget + 1` bands, and any two hashes within the budget
//! must agree exactly on at least one band (pigeonhole), so bucketing by band
//! value finds every true pair while only comparing within buckets.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::IntakeConfig;
use crate::fingerprint::{hamming, similarity, HASH_BITS};
use crate::page::PageRecord;

/// Which signal established a duplicate group.
///
/// Declaration order is evidence strength; a group formed by several signals
/// reports the strongest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateKind {
    ExactText,
    NearImage,
    Structural,
}

/// A set of pages judged to be the same physical page.
///
/// `members` contains every page in the group (representative included) in
/// source order. Non-representative members are excluded from segmentation
/// but retained here for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: String,
    pub representative: String,
    pub members: Vec<String>,
    pub kind: DuplicateKind,
    pub reasons: Vec<String>,
}

/// Groups pages whose fingerprints indicate the same physical page.
#[derive(Debug, Clone)]
pub struct Deduper {
    image_distance_max: u32,
    header_similarity_min: f64,
    footer_similarity_min: f64,
}

struct Edge {
    a: usize,
    b: usize,
    kind: DuplicateKind,
    reason: String,
}

impl Deduper {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            image_distance_max: config.image_hash_dup_distance_max,
            header_similarity_min: config.header_similarity_min,
            footer_similarity_min: config.footer_similarity_min,
        }
    }

    /// Group duplicate pages. Only groups with at least two members are
    /// returned; every page appears in at most one group.
    pub fn dedupe(&self, records: &[PageRecord]) -> Vec<DuplicateGroup> {
        let edges = self.collect_edges(records);

        let mut uf = UnionFind::new(records.len());
        for edge in &edges {
            uf.union(edge.a, edge.b);
        }

        // Strongest evidence and audit reasons per component root
        let mut kind_by_root: HashMap<usize, DuplicateKind> = HashMap::new();
        let mut reasons_by_root: HashMap<usize, Vec<String>> = HashMap::new();
        for edge in &edges {
            let root = uf.find(edge.a);
            kind_by_root
                .entry(root)
                .and_modify(|k| *k = (*k).min(edge.kind))
                .or_insert(edge.kind);
            reasons_by_root.entry(root).or_default().push(edge.reason.clone());
        }

        let mut members_by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..records.len() {
            members_by_root.entry(uf.find(i)).or_default().push(i);
        }

        let mut groups: Vec<DuplicateGroup> = Vec::new();
        let mut roots: Vec<usize> = members_by_root
            .iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(root, _)| *root)
            .collect();
        // Deterministic group order: by first member's position in the batch
        roots.sort_by_key(|root| members_by_root[root][0]);

        for (index, root) in roots.iter().enumerate() {
            let members = &members_by_root[root];
            let representative = members
                .iter()
                .copied()
                .reduce(|best, cand| {
                    if better_representative(&records[cand], &records[best]) {
                        cand
                    } else {
                        best
                    }
                })
                .unwrap_or(members[0]);

            let mut reasons = reasons_by_root.remove(root).unwrap_or_default();
            reasons.sort();
            reasons.dedup();

            groups.push(DuplicateGroup {
                group_id: format!("dup-{index}"),
                representative: records[representative].id(),
                members: members.iter().map(|i| records[*i].id()).collect(),
                kind: kind_by_root.get(root).copied().unwrap_or(DuplicateKind::Structural),
                reasons,
            });
        }

        tracing::debug!(
            pages = records.len(),
            groups = groups.len(),
            "page deduplication complete"
        );
        groups
    }

    fn collect_edges(&self, records: &[PageRecord]) -> Vec<Edge> {
        let mut edges = Vec::new();
        let mut seen_pairs: HashSet<(usize, usize)> = HashSet::new();

        // (a) exact text: bucket by the full hash. Blank pages are skipped,
        // otherwise every empty scan would collapse into one group.
        let mut by_text: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            if !record.page.text.trim().is_empty() {
                by_text.entry(&record.fingerprint.text_hash).or_default().push(i);
            }
        }
        for bucket in by_text.values() {
            for pair in bucket.windows(2) {
                edges.push(Edge {
                    a: pair[0],
                    b: pair[1],
                    kind: DuplicateKind::ExactText,
                    reason: "exact text match".to_string(),
                });
                seen_pairs.insert((pair[0], pair[1]));
            }
        }

        // (b) near-image: banded candidates, exact Hamming verification
        let image_pairs = banded_candidates(
            records,
            |r| r.fingerprint.image_hash,
            self.image_distance_max + 1,
        );
        for (a, b) in image_pairs {
            if seen_pairs.contains(&(a, b)) {
                continue;
            }
            let (ha, hb) = match (records[a].fingerprint.image_hash, records[b].fingerprint.image_hash)
            {
                (Some(ha), Some(hb)) => (ha, hb),
                _ => continue,
            };
            let distance = hamming(ha, hb);
            if distance <= self.image_distance_max {
                seen_pairs.insert((a, b));
                edges.push(Edge {
                    a,
                    b,
                    kind: DuplicateKind::NearImage,
                    reason: format!("image hash distance {distance}"),
                });
            }
        }

        // (c) structural: header band candidates, then both similarity floors
        let header_budget = distance_budget(self.header_similarity_min);
        let header_pairs = banded_candidates(
            records,
            |r| r.fingerprint.header_hash,
            header_budget + 1,
        );
        for (a, b) in header_pairs {
            if seen_pairs.contains(&(a, b)) {
                continue;
            }
            let (fa, fb) = (&records[a].fingerprint, &records[b].fingerprint);
            let header_sim = match (fa.header_hash, fb.header_hash) {
                (Some(x), Some(y)) => similarity(x, y),
                _ => continue,
            };
            let footer_sim = match (fa.footer_hash, fb.footer_hash) {
                (Some(x), Some(y)) => similarity(x, y),
                _ => continue,
            };
            if header_sim >= self.header_similarity_min && footer_sim >= self.footer_similarity_min
            {
                seen_pairs.insert((a, b));
                edges.push(Edge {
                    a,
                    b,
                    kind: DuplicateKind::Structural,
                    reason: format!(
                        "template match (header {header_sim:.2}, footer {footer_sim:.2})"
                    ),
                });
            }
        }

        edges
    }
}

/// `a` is a better group representative than `b`: highest OCR confidence,
/// then earliest upload, then lowest (file, ordinal). Stable across runs.
fn better_representative(a: &PageRecord, b: &PageRecord) -> bool {
    if a.page.ocr_confidence != b.page.ocr_confidence {
        return a.page.ocr_confidence > b.page.ocr_confidence;
    }
    if a.page.uploaded_at != b.page.uploaded_at {
        return a.page.uploaded_at < b.page.uploaded_at;
    }
    (&a.page.file_id, a.page.ordinal) < (&b.page.file_id, b.page.ordinal)
}

/// Hamming budget implied by a similarity floor over a 64-bit hash.
fn distance_budget(similarity_min: f64) -> u32 {
    ((1.0 - similarity_min) * f64::from(HASH_BITS)).floor() as u32
}

/// Candidate pairs `(a, b)` with `a < b` that share at least one band value.
///
/// Cutting the hash into `bands` pieces guarantees that two hashes within
/// `bands - 1` differing bits agree on some band, so no true pair is missed.
fn banded_candidates(
    records: &[PageRecord],
    hash_of: impl Fn(&PageRecord) -> Option<u64>,
    bands: u32,
) -> Vec<(usize, usize)> {
    let bands = bands.clamp(1, HASH_BITS);
    let mut buckets: HashMap<(u32, u64), Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        if let Some(hash) = hash_of(record) {
            for (band, value) in band_values(hash, bands) {
                buckets.entry((band, value)).or_default().push(i);
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = buckets
        .values()
        .filter(|bucket| bucket.len() >= 2)
        .flat_map(|bucket| {
            bucket
                .iter()
                .enumerate()
                .flat_map(|(k, &a)| bucket[k + 1..].iter().map(move |&b| (a.min(b), a.max(b))))
                .collect::<Vec<_>>()
        })
        .collect();
    pairs.sort();
    pairs.dedup();
    pairs
}

fn band_values(hash: u64, bands: u32) -> Vec<(u32, u64)> {
    (0..bands)
        .map(|band| {
            let lo = band * HASH_BITS / bands;
            let hi = (band + 1) * HASH_BITS / bands;
            let width = hi - lo;
            let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
            (band, (hash >> lo) & mask)
        })
        .collect()
}

/// Union-find with path halving and union by size.
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, DocType};
    use crate::fingerprint::{text_hash, PageFingerprint};
    use crate::page::Page;
    use chrono::{TimeZone, Utc};

    fn record(
        file: &str,
        ordinal: usize,
        text: &str,
        image_hash: Option<u64>,
        header_hash: Option<u64>,
        footer_hash: Option<u64>,
        ocr_confidence: f64,
        minute: u32,
    ) -> PageRecord {
        PageRecord {
            page: Page {
                file_id: file.to_string(),
                ordinal,
                text: text.to_string(),
                image: None,
                word_boxes: vec![],
                uploaded_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
                ocr_confidence,
            },
            fingerprint: PageFingerprint {
                image_hash,
                header_hash,
                footer_hash,
                text_hash: text_hash(text),
                degraded: image_hash.is_none(),
            },
            classification: Classification {
                doc_type: DocType::Other,
                confidence: 0.5,
                margin: 0.5,
                low_confidence: false,
            },
        }
    }

    fn deduper() -> Deduper {
        Deduper::new(&IntakeConfig::default())
    }

    #[test]
    fn test_exact_text_duplicates_grouped() {
        let records = vec![
            record("a", 0, "same page text", None, None, None, 0.8, 0),
            record("b", 0, "same page text", None, None, None, 0.9, 5),
            record("c", 0, "different text entirely", None, None, None, 0.9, 5),
        ];
        let groups = deduper().dedupe(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, DuplicateKind::ExactText);
        assert_eq!(groups[0].members, vec!["a#p0", "b#p0"]);
        // Higher OCR confidence wins representative
        assert_eq!(groups[0].representative, "b#p0");
    }

    #[test]
    fn test_blank_pages_do_not_group() {
        let records = vec![
            record("a", 0, "   ", None, None, None, 1.0, 0),
            record("b", 0, "", None, None, None, 1.0, 0),
        ];
        assert!(deduper().dedupe(&records).is_empty());
    }

    #[test]
    fn test_near_image_duplicates() {
        let base = 0xDEAD_BEEF_CAFE_F00Du64;
        let within = base ^ 0b111; // distance 3
        let beyond = base ^ ((1u64 << 20) - 1); // distance 20
        let records = vec![
            record("a", 0, "text one", Some(base), None, None, 1.0, 0),
            record("b", 0, "text two", Some(within), None, None, 1.0, 1),
            record("c", 0, "text three", Some(beyond), None, None, 1.0, 2),
        ];
        let groups = deduper().dedupe(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, DuplicateKind::NearImage);
        assert_eq!(groups[0].members, vec!["a#p0", "b#p0"]);
    }

    #[test]
    fn test_banding_recall_at_exact_budget() {
        // Distance exactly at the configured max, bits spread across the
        // hash: banding must still surface the pair
        let base = 0x0123_4567_89AB_CDEFu64;
        let mut other = base;
        for bit in [0u32, 9, 18, 27, 36, 45, 54, 63] {
            other ^= 1u64 << bit;
        }
        assert_eq!(hamming(base, other), 8);
        let records = vec![
            record("a", 0, "alpha", Some(base), None, None, 1.0, 0),
            record("b", 0, "beta", Some(other), None, None, 1.0, 1),
        ];
        let groups = deduper().dedupe(&records);
        assert_eq!(groups.len(), 1, "distance-8 pair must be found at max 8");
    }

    #[test]
    fn test_structural_requires_both_bands() {
        let header = 0xAAAA_AAAA_AAAA_AAAAu64;
        let footer = 0x5555_5555_5555_5555u64;
        let far_footer = !footer;
        let records = vec![
            record("a", 0, "one", None, Some(header), Some(footer), 1.0, 0),
            record("b", 0, "two", None, Some(header), Some(footer), 1.0, 1),
            // Same header but opposite footer: not a duplicate
            record("c", 0, "three", None, Some(header), Some(far_footer), 1.0, 2),
        ];
        let groups = deduper().dedupe(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, DuplicateKind::Structural);
        assert_eq!(groups[0].members, vec!["a#p0", "b#p0"]);
    }

    #[test]
    fn test_exact_text_outranks_structural() {
        let records = vec![
            record("a", 0, "same", None, Some(1), Some(2), 1.0, 0),
            record("b", 0, "same", None, Some(1), Some(2), 1.0, 1),
        ];
        let groups = deduper().dedupe(&records);
        assert_eq!(groups[0].kind, DuplicateKind::ExactText);
    }

    #[test]
    fn test_groups_partition_pages() {
        let records = vec![
            record("a", 0, "dup text", None, None, None, 1.0, 0),
            record("a", 1, "dup text", None, None, None, 1.0, 0),
            record("b", 0, "dup text", None, None, None, 1.0, 1),
            record("c", 0, "unique", Some(7), None, None, 1.0, 2),
        ];
        let groups = deduper().dedupe(&records);
        let mut seen = HashSet::new();
        for group in &groups {
            for member in &group.members {
                assert!(seen.insert(member.clone()), "page {member} in two groups");
            }
        }
        // Transitive closure pulls all three copies into one group
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 3);
    }

    #[test]
    fn test_representative_tie_breaks_on_upload_time_then_id() {
        let records = vec![
            record("b", 0, "same", None, None, None, 0.9, 5),
            record("a", 0, "same", None, None, None, 0.9, 5),
            record("c", 0, "same", None, None, None, 0.9, 1),
        ];
        let groups = deduper().dedupe(&records);
        // Equal confidence: earliest upload wins
        assert_eq!(groups[0].representative, "c#p0");
    }

    #[test]
    fn test_dedupe_is_deterministic() {
        let records = vec![
            record("a", 0, "x", Some(10), Some(3), Some(4), 1.0, 0),
            record("b", 0, "x", Some(11), Some(3), Some(4), 1.0, 1),
            record("c", 0, "y", Some(500), None, None, 1.0, 2),
        ];
        let first = deduper().dedupe(&records);
        let second = deduper().dedupe(&records);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_union_find_merges_components() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(3, 4);
        assert_eq!(uf.find(0), uf.find(1));
        assert_ne!(uf.find(1), uf.find(3));
        uf.union(1, 3);
        assert_eq!(uf.find(0), uf.find(4));
        assert_ne!(uf.find(2), uf.find(0));
    }

    #[test]
    fn test_band_values_cover_all_bits() {
        let hash = u64::MAX;
        for bands in [1u32, 3, 9, 16] {
            let values = band_values(hash, bands);
            assert_eq!(values.len(), bands as usize);
            let total_width: u32 = values
                .iter()
                .map(|(band, value)| {
                    let lo = band * HASH_BITS / bands;
                    let hi = (band + 1) * HASH_BITS / bands;
                    assert_eq!(value.count_ones(), hi - lo);
                    hi - lo
                })
                .sum();
            assert_eq!(total_width, HASH_BITS);
        }
    }
}
