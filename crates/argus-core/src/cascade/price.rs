//! Price text normalization shared by the DOM and OCR strategies.

use std::sync::LazyLock;

use regex::Regex;

/// Words that mark a monthly-installment amount rather than the price.
const INSTALLMENT_MARKERS: &[&str] = &[
    "قسط",
    "ماهانه",
    "ماهیانه",
    "اقساط",
    "اسنپ",
    "installment",
    "per month",
    "/mo",
];

/// Toman amounts outside this range are almost always ids or phone numbers.
pub const TOMAN_RANGE: (f64, f64) = (1_000.0, 100_000_000.0);

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}(?:[,\s]\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").expect("static regex")
});

/// Replaces Persian and Arabic-Indic digits (and their separators) with ASCII.
pub fn fold_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '۰'..='۹' => char::from(b'0' + (c as u32 - '۰' as u32) as u8),
            '٠'..='٩' => char::from(b'0' + (c as u32 - '٠' as u32) as u8),
            '٬' | '،' => ',',
            '٫' => '.',
            _ => c,
        })
        .collect()
}

pub fn is_installment_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    INSTALLMENT_MARKERS.iter().any(|m| lowered.contains(m))
}

/// First plausible amount in `text`, with thousands separators removed.
///
/// Returns `None` for installment text and for non-positive amounts.
pub fn parse_price(text: &str) -> Option<f64> {
    if is_installment_text(text) {
        return None;
    }
    let folded = fold_digits(text);
    let raw = NUMBER.find(&folded)?.as_str();
    let digits: String = raw.chars().filter(|c| !matches!(c, ',' | ' ')).collect();
    digits
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| *v > 0.0 && v.is_finite())
}

/// ISO-like currency code named in `text`, if any.
pub fn detect_currency(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    let code = if lowered.contains("تومان") || lowered.contains("toman") {
        "IRT"
    } else if lowered.contains("ریال") || lowered.contains("rial") || lowered.contains("irr") {
        "IRR"
    } else if lowered.contains('$') || lowered.contains("usd") {
        "USD"
    } else if lowered.contains('€') || lowered.contains("eur") {
        "EUR"
    } else if lowered.contains('£') || lowered.contains("gbp") {
        "GBP"
    } else {
        return None;
    };
    Some(code.to_string())
}

/// Normalizes a declared currency (`priceCurrency`, oracle output) to a code.
pub fn normalize_currency(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    detect_currency(trimmed).or_else(|| Some(trimmed.to_uppercase()))
}

/// Rejects amounts that cannot be a product price in the given currency.
pub fn is_plausible(price: f64, currency: Option<&str>) -> bool {
    match currency {
        Some("IRT") => price > TOMAN_RANGE.0 && price < TOMAN_RANGE.1,
        Some("IRR") => price > TOMAN_RANGE.0 * 10.0 && price < TOMAN_RANGE.1 * 10.0,
        _ => price > 0.0 && price <= 1e9,
    }
}

/// True when the number in `text` also appears in the URL (a product id, not a price).
pub fn looks_like_product_id(text: &str, url: &str) -> bool {
    let digits: String = fold_digits(text)
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.len() >= 4 && url.contains(&digits)
}
