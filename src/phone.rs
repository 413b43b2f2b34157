//! Phone numbers are the voter identity. Every entered form is reduced to one
//! international form (digits only, country code first), which is also the
//! address notifications are delivered to.

use crate::error::AppError;

const MIN_DIGITS: usize = 10;
const MAX_DIGITS: usize = 15;
const COUNTRY_CODE: &str = "880";

/// Strips separators and rewrites the number in international form.
///
/// `+<digits>` is taken as already international. Without a `+`, local
/// `0…` numbers and bare subscriber numbers get the Bangladesh country code.
pub fn normalize(raw: &str) -> Result<String, AppError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    let (international, digits) = match cleaned.strip_prefix('+') {
        Some(digits) => (true, digits),
        None => (false, cleaned.as_str()),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }

    let canonical = if international || digits.starts_with(COUNTRY_CODE) {
        digits.to_string()
    } else if let Some(local) = digits.strip_prefix('0') {
        format!("{COUNTRY_CODE}{local}")
    } else {
        format!("{COUNTRY_CODE}{digits}")
    };

    if (MIN_DIGITS..=MAX_DIGITS).contains(&canonical.len()) {
        Ok(canonical)
    } else {
        Err(malformed())
    }
}

fn malformed() -> AppError {
    AppError::Validation("malformed phone number".into())
}

/// Keeps only the last three digits, for logs and public listings.
pub fn mask(phone: &str) -> String {
    let visible = phone.len().saturating_sub(3);
    phone
        .char_indices()
        .map(|(i, c)| if i < visible && c.is_ascii_digit() { '*' } else { c })
        .collect()
}
