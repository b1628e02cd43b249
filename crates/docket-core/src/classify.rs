//! Keyword/structure page classification.
//!
//! Classification is deterministic, threshold-driven scoring over fixed
//! vocabularies plus structural cues; no statistical model is involved, so a
//! given page text always classifies identically. A page is never rejected:
//! the best-effort label is always returned, tagged low-confidence when the
//! winning margin is thin.

use serde::{Deserialize, Serialize};

use crate::extract;

/// Document type assigned to a page or segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Invoice,
    Delivery,
    Receipt,
    Utility,
    Other,
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocType::Invoice => "invoice",
            DocType::Delivery => "delivery",
            DocType::Receipt => "receipt",
            DocType::Utility => "utility",
            DocType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Scored types, in tie-break priority order.
const SCORED_TYPES: [DocType; 4] = [
    DocType::Invoice,
    DocType::Delivery,
    DocType::Receipt,
    DocType::Utility,
];

const INVOICE_KEYWORDS: &[&str] = &[
    "invoice",
    "bill to",
    "invoice number",
    "invoice date",
    "payment due",
    "amount due",
    "total due",
    "billing",
    "statement",
    "balance",
    "outstanding",
];

const DELIVERY_KEYWORDS: &[&str] = &[
    "delivery note",
    "goods received",
    "delivered to",
    "received by",
    "delivery date",
    "delivery address",
    "delivery reference",
    "quantity received",
    "signature",
    "pod",
];

const RECEIPT_KEYWORDS: &[&str] = &[
    "receipt",
    "payment received",
    "thank you for your payment",
    "transaction",
    "purchase",
    "cash register",
    "card payment",
    "payment confirmation",
    "payment slip",
];

const UTILITY_KEYWORDS: &[&str] = &[
    "kwh",
    "standing charge",
    "meter reading",
    "electricity",
    "gas",
    "energy",
    "consumption",
    "usage",
    "water",
    "sewerage",
];

/// Weight of one vocabulary hit.
const KEYWORD_WEIGHT: f64 = 1.0;
/// Weight of a structural cue (stronger evidence than a single keyword).
const STRUCTURE_WEIGHT: f64 = 2.0;

/// Result of classifying one page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub doc_type: DocType,
    /// Winning score normalized against the total, in [0,1].
    pub confidence: f64,
    /// Normalized gap between the best and second-best type.
    pub margin: f64,
    /// True when `margin` fell below the configured minimum; the label is
    /// still the best guess, but downstream flags it for manual review.
    pub low_confidence: bool,
}

/// Deterministic page classifier.
#[derive(Debug, Clone)]
pub struct PageClassifier {
    min_margin: f64,
}

impl PageClassifier {
    pub fn new(min_margin: f64) -> Self {
        Self { min_margin }
    }

    /// Classify a page's OCR text. Never fails; a page with no signal at all
    /// is `Other` with zero confidence, tagged low-confidence.
    pub fn classify(&self, text: &str) -> Classification {
        let text_lower = text.to_lowercase();

        let mut scores = [0.0f64; SCORED_TYPES.len()];
        for (score, vocabulary) in scores.iter_mut().zip([
            INVOICE_KEYWORDS,
            DELIVERY_KEYWORDS,
            RECEIPT_KEYWORDS,
            UTILITY_KEYWORDS,
        ]) {
            *score = vocabulary
                .iter()
                .filter(|kw| text_lower.contains(*kw))
                .count() as f64
                * KEYWORD_WEIGHT;
        }

        // Structural cues outweigh individual vocabulary hits
        if !extract::invoice_numbers(text).is_empty() {
            scores[0] += STRUCTURE_WEIGHT;
        }
        if extract::has_vat_block(text) {
            scores[0] += STRUCTURE_WEIGHT;
        }
        if extract::has_delivery_block(text) {
            scores[1] += STRUCTURE_WEIGHT;
        }
        if extract::has_meter_pattern(text) {
            scores[3] += STRUCTURE_WEIGHT;
        }

        let total: f64 = scores.iter().sum();
        if total == 0.0 {
            return Classification {
                doc_type: DocType::Other,
                confidence: 0.0,
                margin: 0.0,
                low_confidence: true,
            };
        }

        // Strict > keeps ties on the earlier type, so ordering is stable
        let mut best = 0;
        for i in 1..scores.len() {
            if scores[i] > scores[best] {
                best = i;
            }
        }
        let second = scores
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best)
            .map(|(_, s)| *s)
            .fold(0.0f64, f64::max);

        let confidence = scores[best] / total;
        let margin = (scores[best] - second) / total;

        Classification {
            doc_type: SCORED_TYPES[best],
            confidence,
            margin,
            low_confidence: margin < self.min_margin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> PageClassifier {
        PageClassifier::new(0.15)
    }

    #[test]
    fn test_invoice_page() {
        let c = classifier().classify(
            "INVOICE\nInvoice Number: INV-4821\nBill to: Cafe Nine\nVAT summary\nAmount due: £120.00",
        );
        assert_eq!(c.doc_type, DocType::Invoice);
        assert!(c.confidence > 0.5);
        assert!(!c.low_confidence);
    }

    #[test]
    fn test_delivery_page() {
        let c = classifier()
            .classify("DELIVERY NOTE\nDelivered to: Cafe Nine\nGoods received by J. Smith\nSignature:");
        assert_eq!(c.doc_type, DocType::Delivery);
        assert!(!c.low_confidence);
    }

    #[test]
    fn test_receipt_page() {
        let c = classifier().classify("RECEIPT\nCard payment\nThank you for your payment\nTransaction 9913");
        assert_eq!(c.doc_type, DocType::Receipt);
    }

    #[test]
    fn test_utility_page() {
        let c = classifier()
            .classify("Electricity statement\nMeter reading: 48213\nConsumption 412 kWh\nStanding charge");
        assert_eq!(c.doc_type, DocType::Utility);
    }

    #[test]
    fn test_empty_text_is_other_low_confidence() {
        let c = classifier().classify("");
        assert_eq!(c.doc_type, DocType::Other);
        assert_eq!(c.confidence, 0.0);
        assert!(c.low_confidence);
    }

    #[test]
    fn test_no_signal_is_other() {
        let c = classifier().classify("the quick brown fox jumps over the lazy dog");
        assert_eq!(c.doc_type, DocType::Other);
        assert!(c.low_confidence);
    }

    #[test]
    fn test_thin_margin_flags_low_confidence() {
        // Invoice and delivery evidence nearly balanced
        let c = classifier().classify("invoice for goods received by delivery date signature billing");
        assert!(c.margin <= 0.5, "margin {} should be thin", c.margin);
        let strict = PageClassifier::new(0.99).classify("invoice\ndelivery note");
        assert!(strict.low_confidence);
    }

    #[test]
    fn test_deterministic() {
        let text = "INVOICE\nInvoice Number: INV-1\nTotal due: 5.00";
        let a = classifier().classify(text);
        let b = classifier().classify(text);
        assert_eq!(a, b);
    }
}
