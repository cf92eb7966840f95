//! Canonical sentiment/emotion taxonomies and the normalizer that maps
//! free-form classifier replies onto them.

/// Transcript sentinel used when a session produced no usable speech.
pub const NO_SPEECH_TRANSCRIPT: &str = "no speech detected";
/// Label sentinel written when classification was skipped.
pub const NOT_APPLICABLE: &str = "N/A";

/// Which fixed taxonomy a raw label should be resolved against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LabelDomain {
    Sentiment,
    Emotion,
}

impl LabelDomain {
    /// Canonical labels in enumeration order. Order is load-bearing: the
    /// substring fallback returns the first canonical label found in this
    /// order, not the first occurrence in the raw string.
    pub fn canonical(self) -> &'static [&'static str] {
        match self {
            LabelDomain::Sentiment => &["Positive", "Negative", "Neutral"],
            LabelDomain::Emotion => &["Joy", "Sadness", "Anger", "Fear", "Surprise"],
        }
    }

    /// System instruction sent to the classifier for this domain.
    pub fn system_instruction(self) -> &'static str {
        match self {
            LabelDomain::Sentiment => {
                "Reply with only one word: Positive, Negative, or Neutral."
            }
            LabelDomain::Emotion => {
                "Reply with only one word: Joy, Sadness, Anger, Fear, or Surprise."
            }
        }
    }
}

/// How unrecognized labels are handled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Unknown labels collapse to the empty marker. Used for chart bucketing
    /// where stray labels must not create phantom categories.
    Strict,
    /// Unknown labels pass through as the cleaned first token so novel
    /// classifier outputs still get their own bucket.
    Lenient,
}

/// Map a raw classifier reply onto a canonical label.
///
/// First the leading whitespace-delimited token is cleaned (surrounding
/// `,`/`.`/space stripped, title-cased) and matched exactly. Failing that, the
/// whole raw string is scanned case-insensitively for each canonical label in
/// enumeration order. Strict mode returns `""` when nothing matches; lenient
/// mode returns the cleaned token verbatim.
pub fn normalize(raw: &str, domain: LabelDomain, mode: NormalizeMode) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let first = trimmed.split_whitespace().next().unwrap_or("");
    let cleaned = title_case(first.trim_matches(|c| matches!(c, ',' | '.' | ' ')));

    if domain.canonical().contains(&cleaned.as_str()) {
        return cleaned;
    }

    let haystack = trimmed.to_lowercase();
    for candidate in domain.canonical() {
        if haystack.contains(&candidate.to_lowercase()) {
            return (*candidate).to_string();
        }
    }

    match mode {
        NormalizeMode::Strict => String::new(),
        NormalizeMode::Lenient => cleaned,
    }
}

fn title_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// A transcript counts as empty when it is blank, at most two characters, or
/// contains no alphanumeric character (punctuation-only artifacts like "..").
pub fn transcript_is_empty(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.chars().count() <= 2 || !trimmed.chars().any(char::is_alphanumeric)
}
