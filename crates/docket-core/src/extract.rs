//! Deterministic text extraction shared by the classifier, segmenter,
//! stitcher and canonical builder.
//!
//! Everything here is regex- and rule-driven: the pipeline treats these
//! fields as opaque match keys for scoring, not as validated business data.
//! Downstream validators own the semantics.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static INVOICE_NO_LABELED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:invoice|inv)\s*(?:no|number|num)?\s*[:#]?\s*([A-Za-z][A-Za-z0-9\-_/]{2,19}|[0-9][A-Za-z0-9\-_/]{2,19})\b").unwrap()
});
static INVOICE_NO_PREFIXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(INV[0-9\-_/]{3,20})\b").unwrap());
static INVOICE_NO_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{2,4}-?[0-9]{3,8})\b").unwrap());

static DATE_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4}|\d{4}[/\-.]\d{1,2}[/\-.]\d{1,2})\b").unwrap());
static DATE_MONTH_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s+(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+(\d{4})\b").unwrap()
});

// Space (not \s) inside the class keeps matches on one line
static SUPPLIER_CAPS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][A-Z &.]{2,40}?(?:LTD|LIMITED|INC|CORP|LLC|PLC|CO|COMPANY))\b").unwrap()
});
static SUPPLIER_LABELED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^(?:from|supplier|company)\s*:\s*([A-Za-z0-9][A-Za-z0-9 &.]{2,40})$").unwrap()
});

static TOTALS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:grand\s+total|final\s+total|total\s+due|amount\s+due|balance\s+due|total)\s*:?\s*[£$€]?\s*([\d,]+\.\d{2})\b").unwrap()
});
static GRAND_TOTAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:grand\s+total|final\s+total|total\s+due|amount\s+due|balance\s+due)\s*:?\s*[£$€]?\s*([\d,]+\.\d{2})\b").unwrap()
});

static CURRENCY_SYMBOL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[£$€]").unwrap());
static CURRENCY_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(gbp|eur|usd|pounds?|euros?|dollars?)\b").unwrap());

static LINE_ITEM_TABULAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(\d+(?:\.\d+)?)\s+(.{3,60}?)\s+[£$€]?([\d,]+\.\d{2})\s+[£$€]?([\d,]+\.\d{2})\s*$").unwrap()
});
static LINE_ITEM_QTY_X: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(\d+)\s*[x×]\s*(.{3,60}?)\s+[£$€]?([\d,]+\.\d{2})\s*$").unwrap()
});

static PAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:page|pg|p)\s*\.?\s*(\d{1,3})\s*(?:of\s*(\d{1,3}))?\b").unwrap());

static VAT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:vat\s+(?:summary|total|amount|rate|reg)|tax\s+(?:summary|total|rate)|vat\s+@)\b").unwrap()
});
static DELIVERY_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:delivered\s+to|received\s+by|goods\s+received|delivery\s+(?:note|date|address)|pod)\b").unwrap()
});
static METER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:meter\s+reading|kwh|standing\s+charge|consumption|usage\s+period)\b").unwrap()
});

/// One parsed line item. Quantities and prices are opaque numbers here;
/// arithmetic coherence is a downstream validator's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    pub amount: f64,
}

impl LineItem {
    /// Normalized identity used to suppress exact duplicates that escaped
    /// page-level dedup.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.description.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" "),
            self.quantity,
            self.amount
        )
    }
}

/// All invoice-number-shaped tokens in the text, normalized, deduplicated and
/// sorted for stable downstream comparison.
pub fn invoice_numbers(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for re in [&*INVOICE_NO_LABELED, &*INVOICE_NO_PREFIXED, &*INVOICE_NO_BARE] {
        for cap in re.captures_iter(text) {
            let normalized = normalize_invoice_number(&cap[1]);
            // Bare digit runs and date fragments match too easily
            if normalized.len() >= 4 && normalized.chars().any(|c| c.is_ascii_digit()) {
                found.push(normalized);
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

/// Uppercase and strip separators so `inv-0042` and `INV 0042` compare equal.
pub fn normalize_invoice_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// All parseable document dates, deduplicated and sorted.
pub fn dates(text: &str) -> Vec<NaiveDate> {
    let mut found = Vec::new();
    for cap in DATE_NUMERIC.captures_iter(text) {
        if let Some(date) = parse_numeric_date(&cap[1]) {
            found.push(date);
        }
    }
    for cap in DATE_MONTH_NAME.captures_iter(text) {
        let formatted = format!("{} {} {}", &cap[1], &cap[2], &cap[3]);
        if let Ok(date) = NaiveDate::parse_from_str(&formatted, "%d %b %Y") {
            found.push(date);
        }
    }
    found.sort();
    found.dedup();
    found
}

fn parse_numeric_date(raw: &str) -> Option<NaiveDate> {
    let unified = raw.replace(['-', '.'], "/");
    let parts: Vec<&str> = unified.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    // Shape decides the format; trial order would let %Y swallow "24" as
    // the year 24
    let format = if parts[0].len() == 4 {
        "%Y/%m/%d"
    } else if parts[2].len() == 2 {
        "%d/%m/%y"
    } else {
        "%d/%m/%Y"
    };
    NaiveDate::parse_from_str(&unified, format).ok()
}

/// Best-guess supplier name, or `None` when nothing name-shaped appears.
pub fn supplier(text: &str) -> Option<String> {
    if let Some(cap) = SUPPLIER_CAPS.captures(text) {
        return Some(normalize_supplier(&cap[1]));
    }
    SUPPLIER_LABELED
        .captures(text)
        .map(|cap| normalize_supplier(&cap[1]))
}

fn normalize_supplier(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether the text carries a totals line ("grand total", "amount due", ...)
/// with an amount attached.
pub fn has_totals_line(text: &str) -> bool {
    TOTALS_LINE.is_match(text)
}

/// The strongest total amount on the page: an explicit grand-total/amount-due
/// line wins; otherwise the largest plain "total" line.
pub fn total_amount(text: &str) -> Option<f64> {
    if let Some(cap) = GRAND_TOTAL.captures(text) {
        return parse_amount(&cap[1]);
    }
    TOTALS_LINE
        .captures_iter(text)
        .filter_map(|cap| parse_amount(&cap[1]))
        .fold(None, |best: Option<f64>, amount| {
            Some(best.map_or(amount, |b| b.max(amount)))
        })
}

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse().ok()
}

/// ISO-ish currency code, from a symbol or a spelled-out word.
pub fn currency(text: &str) -> Option<&'static str> {
    if let Some(m) = CURRENCY_SYMBOL.find(text) {
        return Some(match m.as_str() {
            "£" => "GBP",
            "€" => "EUR",
            _ => "USD",
        });
    }
    CURRENCY_WORD.find(text).map(|m| {
        match m.as_str().to_lowercase().as_str() {
            "gbp" | "pound" | "pounds" => "GBP",
            "eur" | "euro" | "euros" => "EUR",
            _ => "USD",
        }
    })
}

/// Parse tabular and "N x item" rows into line items, in line order.
pub fn line_items(text: &str) -> Vec<LineItem> {
    let mut items = Vec::new();
    for cap in LINE_ITEM_TABULAR.captures_iter(text) {
        let description = cap[2].trim().to_string();
        // Totals rows satisfy the tabular shape too; they are not items
        if has_totals_line(&cap[0]) {
            continue;
        }
        items.push(LineItem {
            quantity: cap[1].parse().unwrap_or(1.0),
            description,
            unit_price: parse_amount(&cap[3]),
            amount: parse_amount(&cap[4]).unwrap_or(0.0),
        });
    }
    for cap in LINE_ITEM_QTY_X.captures_iter(text) {
        items.push(LineItem {
            quantity: cap[1].parse().unwrap_or(1.0),
            description: cap[2].trim().to_string(),
            unit_price: None,
            amount: parse_amount(&cap[3]).unwrap_or(0.0),
        });
    }
    items
}

/// "page N of M" marker, when the page carries one.
pub fn page_marker(text: &str) -> Option<(u32, Option<u32>)> {
    PAGE_MARKER.captures(text).map(|cap| {
        let page = cap[1].parse().unwrap_or(0);
        let of = cap.get(2).and_then(|m| m.as_str().parse().ok());
        (page, of)
    })
}

/// Document-start evidence in the top lines: an invoice-number label, a
/// doc-type keyword, or a supplier header next to a date.
pub fn has_opening_header(text: &str) -> bool {
    let top: String = text.lines().take(8).collect::<Vec<_>>().join("\n");
    if INVOICE_NO_LABELED.is_match(&top) || INVOICE_NO_PREFIXED.is_match(&top) {
        return true;
    }
    let top_lower = top.to_lowercase();
    if ["invoice", "delivery note", "receipt", "statement", "credit note"]
        .iter()
        .any(|kw| top_lower.contains(kw))
    {
        return true;
    }
    supplier(&top).is_some() && !dates(&top).is_empty()
}

/// Structural cue: a VAT/tax summary block.
pub fn has_vat_block(text: &str) -> bool {
    VAT_BLOCK.is_match(text)
}

/// Structural cue: a delivered/received block.
pub fn has_delivery_block(text: &str) -> bool {
    DELIVERY_BLOCK.is_match(text)
}

/// Structural cue: a utility meter-reading pattern.
pub fn has_meter_pattern(text: &str) -> bool {
    METER_PATTERN.is_match(text)
}
