//! Normalization helpers for duplicate detection.
//!
//! All three entity indices key on normalized forms: VAT numbers reduced to
//! digits, phone numbers reduced to national digits, and name+locality
//! fingerprints with legal-form suffixes stripped.

use std::sync::OnceLock;

use regex::Regex;

/// Italian legal-form tokens dropped from names before comparison.
/// "Rossi S.r.l." and "ROSSI SRL" must fingerprint identically.
const LEGAL_FORM_TOKENS: &[&str] = &[
    "srl", "srls", "spa", "snc", "sas", "sapa", "scarl", "scrl", "ss", "sc", "coop",
];

fn token_splitter() -> &'static Regex {
    static SPLITTER: OnceLock<Regex> = OnceLock::new();
    SPLITTER.get_or_init(|| Regex::new(r"[^a-z0-9àèéìíòóùú]+").expect("valid regex"))
}

/// Normalize a company name: lowercase, split on non-alphanumerics (so
/// "S.r.l." becomes "s r l" only after dot removal — dots are dropped first),
/// drop legal-form tokens, rejoin with single spaces.
pub fn normalize_name(name: &str) -> String {
    // Dots inside abbreviations ("s.r.l.") would otherwise split one legal
    // token into meaningless single letters.
    let dotless = name.to_lowercase().replace('.', "");
    token_splitter()
        .split(&dotless)
        .filter(|t| !t.is_empty() && !LEGAL_FORM_TOKENS.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reduce a phone number to national digits: strip everything non-numeric,
/// then the international prefix (0039 / 39) when a plausible national
/// number remains.
pub fn phone_digits(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    for prefix in ["0039", "39"] {
        if let Some(rest) = digits.strip_prefix(prefix) {
            // Italian national numbers start with 0 (landline) or 3 (mobile).
            if rest.len() >= 6 && (rest.starts_with('0') || rest.starts_with('3')) {
                return rest.to_string();
            }
        }
    }

    digits
}

/// Reduce a VAT number to its digits (drops the "IT" prefix and spacing).
pub fn vat_digits(vat: &str) -> String {
    vat.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Name+locality fingerprint: normalized name and squashed city joined with
/// a separator that cannot occur in either part.
pub fn fingerprint(name: &str, city: &str) -> String {
    let city_key: String = city
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    format!("{}|{}", normalize_name(name), city_key)
}

/// Classic Levenshtein distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Edit-distance similarity ratio in [0, 1] between two normalized names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_suffixes_are_stripped() {
        assert_eq!(normalize_name("Rossi S.r.l."), "rossi");
        assert_eq!(normalize_name("ROSSI SRL"), "rossi");
        assert_eq!(normalize_name("Bianchi & Figli S.n.c."), "bianchi figli");
        assert_eq!(normalize_name("Verdi S.p.A."), "verdi");
    }

    #[test]
    fn legal_token_inside_name_is_kept() {
        // "spada" contains "spa" but is not a legal form token.
        assert_eq!(normalize_name("Spada Costruzioni"), "spada costruzioni");
    }

    #[test]
    fn phone_digits_strip_formatting_and_prefix() {
        assert_eq!(phone_digits("+39 02 1234567"), "021234567");
        assert_eq!(phone_digits("0039-02/1234567"), "021234567");
        assert_eq!(phone_digits("02.12.34.567"), "021234567");
        assert_eq!(phone_digits("345 678 9012"), "3456789012");
    }

    #[test]
    fn vat_digits_drop_country_prefix() {
        assert_eq!(vat_digits("IT 01234567890"), "01234567890");
        assert_eq!(vat_digits("01234567890"), "01234567890");
    }

    #[test]
    fn fingerprints_converge_across_formatting() {
        assert_eq!(
            fingerprint("Rossi S.r.l.", "Milano"),
            fingerprint("ROSSI SRL", "milano"),
        );
        assert_ne!(
            fingerprint("Rossi Srl", "Milano"),
            fingerprint("Rossi Srl", "Torino"),
        );
    }

    #[test]
    fn similarity_ratio() {
        assert_eq!(name_similarity("rossi", "rossi"), 1.0);
        assert!(name_similarity("rossi costruzioni", "rossi costruzione") > 0.9);
        assert!(name_similarity("rossi", "bianchi") < 0.5);
    }
}
