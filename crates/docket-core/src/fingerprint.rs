//! Page fingerprinting for duplicate detection and cross-file stitching.
//!
//! Every page gets a four-part signature:
//! - `image_hash`: 64-bit average hash over the rendered page, for
//!   near-duplicate scans of the same physical sheet
//! - `header_hash` / `footer_hash`: 64-bit simhashes over the top and bottom
//!   text bands, which recognize "same letterhead/template" even when the
//!   body content differs
//! - `text_hash`: SHA-256 of whitespace-normalized text, for exact
//!   re-submissions
//!
//! Fingerprinting never fails: an unreadable or missing image yields a
//! degraded fingerprint with `image_hash = None`, because the text hashes
//! still allow exact dedup.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_64;

/// Shingle width for the header/footer simhash.
const SIMHASH_SHINGLE_LEN: usize = 4;

/// Side length of the downsampled grid for the average hash (8x8 = 64 bits).
const AVG_HASH_GRID: u32 = 8;

/// Fraction of a page's lines treated as the header band, and again as the
/// footer band.
const BAND_RATIO: f64 = 0.2;

/// Bit width of the simhash and average hash.
pub const HASH_BITS: u32 = 64;

/// Content signature of a single page.
///
/// `None` hashes mean the underlying signal was unavailable: no decodable
/// image, or a text band too short to shingle. `text_hash` is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFingerprint {
    pub image_hash: Option<u64>,
    pub header_hash: Option<u64>,
    pub footer_hash: Option<u64>,
    pub text_hash: String,
    /// True when any sub-computation fell back (e.g. image unreadable).
    pub degraded: bool,
}

/// A computed fingerprint plus any warnings raised while computing it.
#[derive(Debug, Clone)]
pub struct Fingerprinted {
    pub fingerprint: PageFingerprint,
    pub warnings: Vec<String>,
}

/// Compute the fingerprint for one page. Never fails.
///
/// `page_id` is only used to label warnings.
pub fn fingerprint_page(page_id: &str, text: &str, image: Option<&[u8]>) -> Fingerprinted {
    let mut warnings = Vec::new();

    let image_hash = match image {
        Some(bytes) => match image::load_from_memory(bytes) {
            Ok(img) => Some(average_hash(&img)),
            Err(err) => {
                warnings.push(format!(
                    "page {page_id}: image unreadable ({err}), falling back to text-only fingerprint"
                ));
                None
            }
        },
        None => None,
    };
    let degraded = image_hash.is_none();
    if image.is_none() {
        tracing::debug!(page = %page_id, "no page raster, image hash skipped");
    }

    let (header, footer) = header_footer_bands(text);
    let fingerprint = PageFingerprint {
        image_hash,
        header_hash: simhash(&header),
        footer_hash: simhash(&footer),
        text_hash: text_hash(text),
        degraded,
    };

    Fingerprinted {
        fingerprint,
        warnings,
    }
}

/// SHA-256 hex of the text with whitespace runs collapsed to single spaces.
pub fn text_hash(text: &str) -> String {
    let normalized = normalize_whitespace(text);
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{digest:x}")
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Top and bottom ~20% of the page's lines, lowercased.
fn header_footer_bands(text: &str) -> (String, String) {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return (String::new(), String::new());
    }
    let band = ((lines.len() as f64 * BAND_RATIO).ceil() as usize).clamp(1, lines.len());
    let header = lines[..band].join("\n").to_lowercase();
    let footer = lines[lines.len() - band..].join("\n").to_lowercase();
    (header, footer)
}

/// 64-bit simhash over character shingles.
///
/// Structurally similar text (same letterhead, same footer boilerplate)
/// yields hashes with small Hamming distance even when the rest of the page
/// differs. Returns `None` when the text is too short to form one shingle.
pub fn simhash(text: &str) -> Option<u64> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < SIMHASH_SHINGLE_LEN {
        return None;
    }

    let mut counts = [0i32; HASH_BITS as usize];
    let mut shingle = String::with_capacity(SIMHASH_SHINGLE_LEN * 4);
    for window in chars.windows(SIMHASH_SHINGLE_LEN) {
        shingle.clear();
        shingle.extend(window.iter());
        let h = xxh3_64(shingle.as_bytes());
        for (bit, count) in counts.iter_mut().enumerate() {
            if h & (1u64 << bit) != 0 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    }

    let mut hash = 0u64;
    for (bit, count) in counts.iter().enumerate() {
        if *count > 0 {
            hash |= 1 << bit;
        }
    }
    Some(hash)
}

/// 64-bit average hash of the rendered page.
///
/// Downsample to an 8x8 luminance grid, threshold each cell against the grid
/// mean, pack row-major. Robust to mild re-encoding; not rotation- or
/// crop-invariant.
pub fn average_hash(img: &image::DynamicImage) -> u64 {
    let gray = img
        .resize_exact(AVG_HASH_GRID, AVG_HASH_GRID, FilterType::Triangle)
        .to_luma8();
    let pixels: Vec<u64> = gray.pixels().map(|p| u64::from(p.0[0])).collect();
    let mean = pixels.iter().sum::<u64>() / pixels.len() as u64;

    let mut hash = 0u64;
    for (i, value) in pixels.iter().enumerate() {
        if *value > mean {
            hash |= 1 << i;
        }
    }
    hash
}

/// Number of differing bits between two 64-bit hashes.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Bitwise similarity in [0,1]: `1 - hamming/64`.
pub fn similarity(a: u64, b: u64) -> f64 {
    1.0 - f64::from(hamming(a, b)) / f64::from(HASH_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma};
    use std::io::Cursor;

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img.clone())
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn gradient_image(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([((x * 7 + y * 13) % 256) as u8]))
    }

    #[test]
    fn test_text_hash_normalizes_whitespace() {
        assert_eq!(text_hash("a  b\n c"), text_hash("a b c"));
        assert_ne!(text_hash("a b c"), text_hash("a b d"));
    }

    #[test]
    fn test_simhash_is_deterministic() {
        let h1 = simhash("ACME SUPPLIES LTD\n42 Depot Road");
        let h2 = simhash("ACME SUPPLIES LTD\n42 Depot Road");
        assert_eq!(h1, h2);
        assert!(h1.is_some());
    }

    #[test]
    fn test_simhash_too_short() {
        assert_eq!(simhash(""), None);
        assert_eq!(simhash("ab"), None);
    }

    #[test]
    fn test_simhash_locality() {
        let base = "acme supplies ltd, 42 depot road, unit 7, invoice department, \
                    registered in england, vat gb 987 6543 21, invoices@acme.example";
        let near = "acme supplies ltd, 42 depot road, unit 9, invoice department, \
                    registered in england, vat gb 987 6543 21, invoices@acme.example";
        let far = "completely unrelated text about electricity meter readings, kilowatt \
                   hours, standing charges and estimated consumption for the period";

        let h_base = simhash(base).unwrap();
        let h_near = simhash(near).unwrap();
        let h_far = simhash(far).unwrap();

        assert!(
            similarity(h_base, h_near) > similarity(h_base, h_far),
            "one-word edit should stay closer than unrelated text"
        );
        assert!(similarity(h_base, h_near) > 0.8);
    }

    #[test]
    fn test_header_footer_bands() {
        let text = "line0\nline1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\nline9";
        let (header, footer) = header_footer_bands(text);
        assert_eq!(header, "line0\nline1");
        assert_eq!(footer, "line8\nline9");
    }

    #[test]
    fn test_bands_single_line() {
        let (header, footer) = header_footer_bands("only line");
        assert_eq!(header, "only line");
        assert_eq!(footer, "only line");
    }

    #[test]
    fn test_average_hash_stable_across_reencode() {
        let img = gradient_image(64, 64);
        let dynamic = DynamicImage::ImageLuma8(img.clone());
        let reloaded = image::load_from_memory(&png_bytes(&img)).unwrap();
        // PNG is lossless, so the hash must match exactly
        assert_eq!(average_hash(&dynamic), average_hash(&reloaded));
    }

    #[test]
    fn test_average_hash_separates_different_pages() {
        let light = GrayImage::from_fn(32, 32, |x, _| Luma([if x < 16 { 230 } else { 20 }]));
        let dark = GrayImage::from_fn(32, 32, |_, y| Luma([if y < 16 { 230 } else { 20 }]));
        let d = hamming(
            average_hash(&DynamicImage::ImageLuma8(light)),
            average_hash(&DynamicImage::ImageLuma8(dark)),
        );
        assert!(d > 8, "orthogonal layouts should differ, got distance {d}");
    }

    #[test]
    fn test_fingerprint_without_image_is_degraded() {
        let result = fingerprint_page("f#p0", "INVOICE\nACME LTD\ntotal 10.00", None);
        assert!(result.fingerprint.degraded);
        assert!(result.fingerprint.image_hash.is_none());
        assert!(result.fingerprint.header_hash.is_some());
        assert!(!result.fingerprint.text_hash.is_empty());
        // Missing image is allowed by the input contract, not a warning
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_fingerprint_with_unreadable_image_warns() {
        let result = fingerprint_page("f#p0", "some text here", Some(&[0xde, 0xad, 0xbe, 0xef]));
        assert!(result.fingerprint.degraded);
        assert!(result.fingerprint.image_hash.is_none());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("image unreadable"));
    }

    #[test]
    fn test_fingerprint_with_image() {
        let bytes = png_bytes(&gradient_image(64, 64));
        let result = fingerprint_page("f#p0", "INVOICE 123", Some(&bytes));
        assert!(!result.fingerprint.degraded);
        assert!(result.fingerprint.image_hash.is_some());
    }

    #[test]
    fn test_hamming_and_similarity() {
        assert_eq!(hamming(0, 0), 0);
        assert_eq!(hamming(u64::MAX, 0), 64);
        assert_eq!(similarity(0, 0), 1.0);
        assert_eq!(similarity(u64::MAX, 0), 0.0);
        assert_eq!(hamming(0b1011, 0b0010), 2);
    }
}
