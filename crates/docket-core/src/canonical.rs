//! Canonical entity construction.
//!
//! Each stitch group becomes exactly one canonical record: an invoice when
//! the group's aggregate type is invoice, a generic document otherwise.
//! Field conflicts between contributing segments resolve to the segment with
//! the highest classification confidence, and every resolved field records
//! which segment supplied it, so an operator can trace a value back to its
//! source pages.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::classify::DocType;
use crate::config::IntakeConfig;
use crate::extract::{self, LineItem};
use crate::segment::Segment;
use crate::stitch::StitchGroup;

/// The final, deduplicated invoice record built from one stitch group.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalInvoice {
    pub canonical_id: String,
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub total_amount: Option<f64>,
    /// Line items from all contributing segments, in page order, exact
    /// duplicates suppressed.
    pub line_items: Vec<LineItem>,
    /// field name -> id of the segment that supplied it.
    pub field_provenance: BTreeMap<String, String>,
    pub source_segments: Vec<String>,
    pub source_pages: Vec<String>,
    pub confidence: f64,
    pub needs_review: bool,
    pub warnings: Vec<String>,
}

/// Canonical record for non-invoice stitch groups.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalDocument {
    pub canonical_id: String,
    pub doc_type: DocType,
    pub supplier_name: Option<String>,
    pub document_number: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub source_segments: Vec<String>,
    pub source_pages: Vec<String>,
    pub confidence: f64,
    pub needs_review: bool,
    pub warnings: Vec<String>,
}

/// Merges stitch groups into canonical entities.
#[derive(Debug, Clone)]
pub struct CanonicalBuilder {
    low_confidence_threshold: f64,
}

impl CanonicalBuilder {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            low_confidence_threshold: config.low_overall_confidence_threshold,
        }
    }

    /// Build one canonical entity per stitch group.
    pub fn build(
        &self,
        groups: &[StitchGroup],
        segments: &[Segment],
    ) -> (Vec<CanonicalInvoice>, Vec<CanonicalDocument>) {
        let by_id: HashMap<&str, &Segment> = segments
            .iter()
            .map(|s| (s.segment_id.as_str(), s))
            .collect();

        let mut invoices = Vec::new();
        let mut documents = Vec::new();
        for group in groups {
            let ordered: Vec<&Segment> = group
                .segment_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            if ordered.is_empty() {
                tracing::warn!(group = %group.group_id, "stitch group references no known segments");
                continue;
            }
            if group.doc_type == DocType::Invoice {
                invoices.push(self.build_invoice(group, &ordered));
            } else {
                documents.push(self.build_document(group, &ordered));
            }
        }
        tracing::debug!(
            invoices = invoices.len(),
            documents = documents.len(),
            "canonical build complete"
        );
        (invoices, documents)
    }

    fn build_invoice(&self, group: &StitchGroup, ordered: &[&Segment]) -> CanonicalInvoice {
        let mut provenance = BTreeMap::new();

        let supplier_name =
            resolve_field(ordered, &mut provenance, "supplier_name", |s| s.supplier.clone());
        let invoice_number = resolve_field(ordered, &mut provenance, "invoice_number", |s| {
            s.invoice_numbers.first().cloned()
        });
        let invoice_date =
            resolve_field(ordered, &mut provenance, "invoice_date", |s| s.dates.first().copied());
        let currency = resolve_field(ordered, &mut provenance, "currency", |s| {
            extract::currency(&s.text).map(str::to_string)
        });
        let total_amount = resolve_field(ordered, &mut provenance, "total_amount", |s| {
            extract::total_amount(&s.text)
        });

        let confidence = weighted_confidence(ordered);
        let (needs_review, warnings) = self.review_flags(ordered, confidence);

        CanonicalInvoice {
            canonical_id: format!("canonical-{}", group.group_id),
            supplier_name,
            invoice_number,
            invoice_date,
            currency,
            total_amount,
            line_items: merged_line_items(ordered),
            field_provenance: provenance,
            source_segments: group.segment_ids.clone(),
            source_pages: source_pages(ordered),
            confidence,
            needs_review,
            warnings,
        }
    }

    fn build_document(&self, group: &StitchGroup, ordered: &[&Segment]) -> CanonicalDocument {
        let mut provenance = BTreeMap::new();
        let supplier_name =
            resolve_field(ordered, &mut provenance, "supplier_name", |s| s.supplier.clone());
        let document_number = resolve_field(ordered, &mut provenance, "document_number", |s| {
            s.invoice_numbers.first().cloned()
        });
        let document_date =
            resolve_field(ordered, &mut provenance, "document_date", |s| s.dates.first().copied());

        let confidence = weighted_confidence(ordered);
        let (needs_review, warnings) = self.review_flags(ordered, confidence);

        CanonicalDocument {
            canonical_id: format!("canonical-{}", group.group_id),
            doc_type: group.doc_type,
            supplier_name,
            document_number,
            document_date,
            source_segments: group.segment_ids.clone(),
            source_pages: source_pages(ordered),
            confidence,
            needs_review,
            warnings,
        }
    }

    fn review_flags(&self, ordered: &[&Segment], confidence: f64) -> (bool, Vec<String>) {
        let mut warnings = Vec::new();
        if confidence < self.low_confidence_threshold {
            warnings.push(format!(
                "overall confidence {confidence:.2} below review threshold {:.2}",
                self.low_confidence_threshold
            ));
        }
        for segment in ordered {
            if segment.low_confidence {
                warnings.push(format!(
                    "segment {} contains low-confidence page classifications",
                    segment.segment_id
                ));
            }
        }
        (!warnings.is_empty(), warnings)
    }
}

/// Value from the highest-confidence segment that has one; ties go to the
/// earlier segment in group order. Records provenance when resolved.
fn resolve_field<T>(
    ordered: &[&Segment],
    provenance: &mut BTreeMap<String, String>,
    field: &str,
    get: impl Fn(&Segment) -> Option<T>,
) -> Option<T> {
    let mut best: Option<(T, &Segment)> = None;
    for segment in ordered {
        if let Some(value) = get(segment) {
            let replace = match &best {
                Some((_, current)) => segment.confidence > current.confidence,
                None => true,
            };
            if replace {
                best = Some((value, segment));
            }
        }
    }
    best.map(|(value, segment)| {
        provenance.insert(field.to_string(), segment.segment_id.clone());
        value
    })
}

/// Line items from all segments in page order, exact duplicates suppressed.
///
/// Duplicate rows show up when a duplicate page escaped the deduper (only one
/// signal matched); identical normalized rows are collapsed here as a second
/// line of defense.
fn merged_line_items(ordered: &[&Segment]) -> Vec<LineItem> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for segment in ordered {
        for item in extract::line_items(&segment.text) {
            if seen.insert(item.dedup_key()) {
                items.push(item);
            }
        }
    }
    items
}

/// Page-count-weighted mean of segment confidences.
fn weighted_confidence(ordered: &[&Segment]) -> f64 {
    let total_pages: usize = ordered.iter().map(|s| s.page_ids.len()).sum();
    if total_pages == 0 {
        return 0.0;
    }
    ordered
        .iter()
        .map(|s| s.confidence * s.page_ids.len() as f64)
        .sum::<f64>()
        / total_pages as f64
}

fn source_pages(ordered: &[&Segment]) -> Vec<String> {
    ordered
        .iter()
        .flat_map(|s| s.page_ids.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::PageFingerprint;
    use chrono::{TimeZone, Utc};

    fn fingerprint() -> PageFingerprint {
        PageFingerprint {
            image_hash: None,
            header_hash: None,
            footer_hash: None,
            text_hash: "t".to_string(),
            degraded: true,
        }
    }

    fn segment(id: &str, text: &str, confidence: f64, pages: usize) -> Segment {
        Segment {
            segment_id: id.to_string(),
            file_id: id.split('#').next().unwrap_or("f").to_string(),
            page_ids: (0..pages).map(|i| format!("{id}-p{i}")).collect(),
            doc_type: DocType::Invoice,
            supplier: extract::supplier(text),
            invoice_numbers: extract::invoice_numbers(text),
            dates: extract::dates(text),
            has_opening_header: true,
            has_closing_totals: true,
            lead_fingerprint: fingerprint(),
            tail_fingerprint: fingerprint(),
            text: text.to_string(),
            confidence,
            low_confidence: false,
            page_marker: None,
            uploaded_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            first_ordinal: 0,
        }
    }

    fn group(id: &str, doc_type: DocType, segment_ids: &[&str]) -> StitchGroup {
        StitchGroup {
            group_id: id.to_string(),
            segment_ids: segment_ids.iter().map(|s| s.to_string()).collect(),
            doc_type,
            supplier: None,
            invoice_numbers: vec![],
            dates: vec![],
            score: 1.0,
            reasons: vec![],
        }
    }

    fn builder() -> CanonicalBuilder {
        CanonicalBuilder::new(&IntakeConfig::default())
    }

    #[test]
    fn test_invoice_fields_and_provenance() {
        let head = segment(
            "f1#s0",
            "INVOICE\nACME SUPPLIES LTD\nInvoice No: INV-100\nDate: 05/03/2024",
            0.9,
            1,
        );
        let tail = segment("f2#s0", "2 Widgets 3.50 7.00\nGrand Total: £7.00", 0.5, 1);
        let (invoices, documents) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0", "f2#s0"])], &[head, tail]);

        assert!(documents.is_empty());
        assert_eq!(invoices.len(), 1);
        let invoice = &invoices[0];
        assert_eq!(invoice.canonical_id, "canonical-stitch-0");
        assert_eq!(invoice.supplier_name.as_deref(), Some("ACME SUPPLIES LTD"));
        assert_eq!(invoice.invoice_number.as_deref(), Some("INV100"));
        assert_eq!(
            invoice.invoice_date,
            Some(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
        );
        assert_eq!(invoice.total_amount, Some(7.00));
        assert_eq!(invoice.currency.as_deref(), Some("GBP"));
        assert_eq!(invoice.line_items.len(), 1);
        // Supplier came from the header segment, total from the tail
        assert_eq!(invoice.field_provenance["supplier_name"], "f1#s0");
        assert_eq!(invoice.field_provenance["total_amount"], "f2#s0");
        assert_eq!(invoice.source_pages, vec!["f1#s0-p0", "f2#s0-p0"]);
        assert!(!invoice.needs_review);
    }

    #[test]
    fn test_conflicting_field_resolves_to_higher_confidence() {
        let low = segment("f1#s0", "INVOICE\nBETA METALS LTD\nInvoice No: INV-200", 0.4, 1);
        let high = segment("f2#s0", "INVOICE\nACME SUPPLIES LTD\nInvoice No: INV-200", 0.9, 1);
        let (invoices, _) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0", "f2#s0"])], &[low, high]);
        assert_eq!(
            invoices[0].supplier_name.as_deref(),
            Some("ACME SUPPLIES LTD")
        );
        assert_eq!(invoices[0].field_provenance["supplier_name"], "f2#s0");
    }

    #[test]
    fn test_field_tie_goes_to_earlier_segment() {
        let first = segment("f1#s0", "INVOICE\nBETA METALS LTD", 0.7, 1);
        let second = segment("f2#s0", "INVOICE\nACME SUPPLIES LTD", 0.7, 1);
        let (invoices, _) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0", "f2#s0"])], &[first, second]);
        assert_eq!(invoices[0].supplier_name.as_deref(), Some("BETA METALS LTD"));
    }

    #[test]
    fn test_duplicate_line_items_suppressed() {
        // The same rows surviving on a near-duplicate page
        let a = segment("f1#s0", "2 Widgets large 3.50 7.00\n1 Crate 12.00 12.00", 0.8, 1);
        let b = segment("f2#s0", "2 Widgets  large 3.50 7.00\n3 x Pallet wrap £9.00", 0.8, 1);
        let (invoices, _) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0", "f2#s0"])], &[a, b]);
        let descriptions: Vec<&str> = invoices[0]
            .line_items
            .iter()
            .map(|i| i.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["Widgets large", "Crate", "Pallet wrap"]);
    }

    #[test]
    fn test_confidence_is_page_weighted() {
        let big = segment("f1#s0", "INVOICE\nACME SUPPLIES LTD", 0.9, 3);
        let small = segment("f2#s0", "trailing page", 0.1, 1);
        let (invoices, _) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0", "f2#s0"])], &[big, small]);
        let expected = (0.9 * 3.0 + 0.1) / 4.0;
        assert!((invoices[0].confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_low_confidence_flags_review() {
        let mut seg = segment("f1#s0", "INVOICE\nACME SUPPLIES LTD", 0.9, 1);
        seg.low_confidence = true;
        let (invoices, _) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0"])], &[seg]);
        assert!(invoices[0].needs_review);
        assert!(invoices[0].warnings[0].contains("low-confidence"));
    }

    #[test]
    fn test_weak_overall_confidence_flags_review() {
        let seg = segment("f1#s0", "INVOICE\nACME SUPPLIES LTD", 0.2, 1);
        let (invoices, _) =
            builder().build(&[group("stitch-0", DocType::Invoice, &["f1#s0"])], &[seg]);
        assert!(invoices[0].needs_review);
        assert!(invoices[0].warnings[0].contains("below review threshold"));
    }

    #[test]
    fn test_non_invoice_group_becomes_document() {
        let mut seg = segment("f1#s0", "DELIVERY NOTE\nACME SUPPLIES LTD\nGoods received", 0.8, 1);
        seg.doc_type = DocType::Delivery;
        let (invoices, documents) =
            builder().build(&[group("stitch-0", DocType::Delivery, &["f1#s0"])], &[seg]);
        assert!(invoices.is_empty());
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].doc_type, DocType::Delivery);
        assert_eq!(documents[0].supplier_name.as_deref(), Some("ACME SUPPLIES LTD"));
    }

    #[test]
    fn test_one_entity_per_group() {
        let a = segment("f1#s0", "INVOICE\nACME SUPPLIES LTD", 0.8, 1);
        let b = segment("f2#s0", "RECEIPT\ncard payment", 0.8, 1);
        let groups = vec![
            group("stitch-0", DocType::Invoice, &["f1#s0"]),
            group("stitch-1", DocType::Receipt, &["f2#s0"]),
        ];
        let (invoices, documents) = builder().build(&groups, &[a, b]);
        assert_eq!(invoices.len() + documents.len(), groups.len());
    }
}
