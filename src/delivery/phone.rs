//! Recipient phone validation and normalization (Indonesian numbering).

use std::sync::LazyLock;

use regex::Regex;

/// Suffix the gateway expects on personal chat addresses.
const WHATSAPP_SUFFIX: &str = "@s.whatsapp.net";

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{10,15}$").expect("static phone regex"));

/// Mobile prefixes (digits after the `62` country code).
const MOBILE_PREFIXES: &[&str] = &[
    "811", "812", "813", "814", "815", "816", "817", "818", "819", // Telkomsel
    "821", "822", "823", "824", "825", "826", "827", "828", "829", // Telkomsel
    "851", "852", "853", "854", "855", "856", "857", "858", "859", // Telkomsel
    "831", "832", "833", "834", "835", "836", "837", "838", "839", // Axis
    "881", "882", "883", "884", "885", "886", "887", "888", "889", // Smartfren
    "895", "896", "897", "898", "899", // Three
];

/// Why a phone number was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number is too short")]
    TooShort,
    #[error("phone number is too long")]
    TooLong,
    #[error("phone number contains invalid characters")]
    InvalidCharacters,
    #[error("phone number must be Indonesian format (starting with 62 or 08)")]
    NotIndonesian,
}

/// A validated phone number in canonical `62…` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNumber {
    normalized: String,
}

impl PhoneNumber {
    /// Canonical digits, e.g. `6281234567890`.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Address used by the messaging gateway.
    pub fn whatsapp_address(&self) -> String {
        format!("{}{WHATSAPP_SUFFIX}", self.normalized)
    }

    /// Stricter check against known mobile operator prefixes.
    pub fn is_indonesian_mobile(&self) -> bool {
        self.normalized
            .get(2..5)
            .is_some_and(|prefix| MOBILE_PREFIXES.contains(&prefix))
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized)
    }
}

/// Validate and normalize a raw phone number.
pub fn validate_phone(raw: &str) -> Result<PhoneNumber, PhoneError> {
    let cleaned = clean(raw);
    if cleaned.is_empty() {
        return Err(PhoneError::Empty);
    }

    let normalized = normalize(&cleaned);

    if normalized.len() < 11 {
        return Err(PhoneError::TooShort);
    }
    if normalized.len() > 15 {
        return Err(PhoneError::TooLong);
    }
    if !DIGITS.is_match(&normalized) {
        return Err(PhoneError::InvalidCharacters);
    }
    if !normalized.starts_with("62") {
        return Err(PhoneError::NotIndonesian);
    }

    Ok(PhoneNumber { normalized })
}

/// Mask a phone number for log output: `628***789`.
pub fn mask_phone(phone: &str) -> String {
    let phone = phone.trim();
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() < 6 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}***{tail}")
}

fn clean(raw: &str) -> String {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    match stripped.strip_prefix('+') {
        Some(rest) => rest.to_string(),
        None => stripped,
    }
}

fn normalize(cleaned: &str) -> String {
    if cleaned.starts_with("62") {
        cleaned.to_string()
    } else if let Some(rest) = cleaned.strip_prefix('0').filter(|r| r.starts_with('8')) {
        format!("62{rest}")
    } else if cleaned.starts_with('8') {
        format!("62{cleaned}")
    } else {
        cleaned.to_string()
    }
}
