use std::sync::LazyLock;

use regex::Regex;

/// Letter, two digits, optional one- or two-digit subcategory.
static ICD10_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]\d{2}(\.\d{1,2})?$").expect("valid ICD-10 pattern"));

/// Common CID-10 codes seen in primary care, with Portuguese descriptions.
pub const COMMON_CODES: &[(&str, &str)] = &[
    ("J00", "Nasofaringite aguda [resfriado comum]"),
    ("J06.9", "Infecção aguda das vias aéreas superiores não especificada"),
    ("K29.7", "Gastrite não especificada"),
    ("M54.5", "Dor lombar baixa"),
    ("I10", "Hipertensão essencial (primária)"),
    ("E11", "Diabetes mellitus não-insulino-dependente"),
    ("R50.9", "Febre não especificada"),
    ("R51", "Cefaleia"),
    ("R10.4", "Outras dores abdominais e as não especificadas"),
];

/// Uppercase and trim a code as written by a model or a reviewer.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn is_valid_code(code: &str) -> bool {
    ICD10_SHAPE.is_match(code)
}

pub fn describe(code: &str) -> Option<&'static str> {
    COMMON_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
}
