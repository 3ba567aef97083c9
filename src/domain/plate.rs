//! Jurisdiction plate classification
//!
//! Tokens are tested in the order the detector returned them; the first token
//! matching the plate grammar wins. Confidence is ignored.

use crate::domain::types::{Classification, TextDetection};

/// Plate grammar: one digit, three letters, three digits
const PLATE_LEN: usize = 7;

/// Uppercase and strip all whitespace
pub fn normalize(token: &str) -> String {
    token.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_uppercase).collect()
}

/// Check a normalized token against the jurisdiction plate grammar
pub fn is_jurisdiction_plate(token: &str) -> bool {
    let bytes = token.as_bytes();
    if bytes.len() != PLATE_LEN {
        return false;
    }
    bytes[0].is_ascii_digit()
        && bytes[1..4].iter().all(u8::is_ascii_uppercase)
        && bytes[4..7].iter().all(u8::is_ascii_digit)
}

/// Classify a detection result. Pure: same input, same output.
pub fn classify(detections: &[TextDetection]) -> Classification {
    detections
        .iter()
        .map(|d| normalize(&d.text))
        .find(|token| is_jurisdiction_plate(token))
        .map(|plate_number| Classification { plate_number, is_in_jurisdiction: true })
        .unwrap_or_else(Classification::out_of_jurisdiction)
}
