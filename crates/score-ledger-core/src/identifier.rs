use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rendering of [`Identifier::Unresolved`].
pub const SENTINEL_IDENTIFIER: &str = "00000000-0000-0000-0000-000000000000";

const CANONICAL_LEN: usize = 36;
const CANONICAL_HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// Judge, subject or tournament identifier, resolved once at ingress.
///
/// Downstream code matches on the variant and never re-inspects the raw text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Identifier {
    Canonical(Uuid),
    Legacy(LegacyId),
    /// Input that could not be classified. Renders as [`SENTINEL_IDENTIFIER`].
    Unresolved,
}

/// Bare decimal legacy id, kept digit for digit: `"007"` and `"7"` are
/// different ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LegacyId(String);

impl LegacyId {
    /// `None` unless `value` is one or more ASCII digits.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        (!value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit()))
            .then(|| Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Canonical,
    Legacy,
    Unresolved,
}

impl IdentifierKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::Legacy => "legacy",
            Self::Unresolved => "unresolved",
        }
    }
}

impl Identifier {
    #[must_use]
    pub fn kind(&self) -> IdentifierKind {
        match self {
            Self::Canonical(_) => IdentifierKind::Canonical,
            Self::Legacy(_) => IdentifierKind::Legacy,
            Self::Unresolved => IdentifierKind::Unresolved,
        }
    }

    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }

    /// Strict parse for values read back from storage.
    ///
    /// The sentinel maps back to [`Identifier::Unresolved`].
    ///
    /// # Errors
    /// Returns [`IdentifierError`] when the text is neither a canonical UUID
    /// nor a decimal legacy id.
    pub fn parse_stored(raw: &str) -> Result<Self, IdentifierError> {
        classify(raw).map_err(|reason| IdentifierError(format!("{raw:?}: {reason}")))
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Canonical(uuid) => write!(f, "{}", uuid.hyphenated()),
            Self::Legacy(value) => f.write_str(value.as_str()),
            Self::Unresolved => f.write_str(SENTINEL_IDENTIFIER),
        }
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_stored(&value)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid identifier {0}")]
pub struct IdentifierError(String);

/// Non-fatal notice that an identifier was coerced to the sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizationWarning {
    pub field: Option<String>,
    pub raw: String,
    pub reason: String,
    pub substituted: String,
}

impl NormalizationWarning {
    #[must_use]
    pub fn for_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}

impl Display for NormalizationWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "{field} {:?} replaced by sentinel {}: {}",
                self.raw, self.substituted, self.reason
            ),
            None => write!(
                f,
                "identifier {:?} replaced by sentinel {}: {}",
                self.raw, self.substituted, self.reason
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentifier {
    pub id: Identifier,
    pub warning: Option<NormalizationWarning>,
}

/// Classifies a raw identifier. Never fails.
///
/// Canonical hyphenated UUIDs and bare decimal legacy ids pass through.
/// Anything else becomes [`Identifier::Unresolved`] with a warning attached.
#[must_use]
pub fn normalize_identifier(raw: &str) -> NormalizedIdentifier {
    match classify(raw.trim()) {
        Ok(Identifier::Unresolved) => unresolved(raw, "identifier is the reserved sentinel"),
        Ok(id) => NormalizedIdentifier { id, warning: None },
        Err(reason) => unresolved(raw, reason),
    }
}

fn unresolved(raw: &str, reason: &str) -> NormalizedIdentifier {
    NormalizedIdentifier {
        id: Identifier::Unresolved,
        warning: Some(NormalizationWarning {
            field: None,
            raw: raw.to_string(),
            reason: reason.to_string(),
            substituted: SENTINEL_IDENTIFIER.to_string(),
        }),
    }
}

fn classify(value: &str) -> Result<Identifier, &'static str> {
    if value.is_empty() {
        return Err("identifier is empty");
    }

    if let Some(legacy) = LegacyId::parse(value) {
        return Ok(Identifier::Legacy(legacy));
    }

    if !is_hyphenated_uuid(value) {
        return Err("identifier is neither a canonical UUID nor a numeric legacy id");
    }

    let uuid = Uuid::parse_str(value).map_err(|_| "identifier is not a valid UUID")?;
    if uuid.is_nil() {
        return Ok(Identifier::Unresolved);
    }
    Ok(Identifier::Canonical(uuid))
}

fn is_hyphenated_uuid(value: &str) -> bool {
    value.len() == CANONICAL_LEN
        && value.char_indices().all(|(index, ch)| {
            if CANONICAL_HYPHENS.contains(&index) {
                ch == '-'
            } else {
                ch.is_ascii_hexdigit()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_identifier_passes_through_unchanged() {
        let normalized = normalize_identifier("f47ac10b-58cc-4372-a567-0e02b2c3d479");
        assert_eq!(normalized.warning, None);
        assert_eq!(normalized.id.kind(), IdentifierKind::Canonical);
        assert_eq!(
            normalized.id.to_string(),
            "f47ac10b-58cc-4372-a567-0e02b2c3d479"
        );
    }

    fn legacy(raw: &str) -> Identifier {
        match LegacyId::parse(raw) {
            Some(id) => Identifier::Legacy(id),
            None => panic!("{raw:?} is not a legacy id"),
        }
    }

    #[test]
    fn legacy_numeric_identifier_passes_through_unchanged() {
        let normalized = normalize_identifier("42");
        assert_eq!(normalized.warning, None);
        assert_eq!(normalized.id, legacy("42"));
        assert_eq!(normalized.id.to_string(), "42");
    }

    #[test]
    fn leading_zeros_are_kept_and_distinguish_ids() {
        let padded = normalize_identifier("007");
        assert_eq!(padded.warning, None);
        assert_eq!(padded.id.kind(), IdentifierKind::Legacy);
        assert_eq!(padded.id.to_string(), "007");
        assert_ne!(padded.id, normalize_identifier("7").id);
    }

    #[test]
    fn long_numeric_identifier_is_kept_verbatim() {
        let raw = "1234567890123456789012345";
        let normalized = normalize_identifier(raw);
        assert_eq!(normalized.warning, None);
        assert_eq!(normalized.id.to_string(), raw);
        assert_eq!(Identifier::parse_stored(raw), Ok(normalized.id));
    }

    #[test]
    fn empty_identifier_becomes_sentinel_with_warning() {
        let normalized = normalize_identifier("");
        assert_eq!(normalized.id, Identifier::Unresolved);
        assert_eq!(normalized.id.to_string(), SENTINEL_IDENTIFIER);
        let warning = match normalized.warning {
            Some(value) => value,
            None => panic!("expected a normalization warning"),
        };
        assert_eq!(warning.raw, "");
        assert_eq!(warning.substituted, SENTINEL_IDENTIFIER);
    }

    #[test]
    fn malformed_identifiers_become_sentinel() {
        for raw in [
            "J1",
            "   ",
            "f47ac10b58cc4372a5670e02b2c3d479",
            "{f47ac10b-58cc-4372-a567-0e02b2c3d479}",
            "f47ac10b-58cc-4372-a567-0e02b2c3d47z",
            "-5",
            "1.5",
        ] {
            let normalized = normalize_identifier(raw);
            assert!(normalized.id.is_unresolved(), "{raw:?} should be unresolved");
            assert!(normalized.warning.is_some(), "{raw:?} should warn");
        }
    }

    #[test]
    fn explicit_sentinel_input_still_warns() {
        let normalized = normalize_identifier(SENTINEL_IDENTIFIER);
        assert!(normalized.id.is_unresolved());
        assert!(normalized.warning.is_some());
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(normalize_identifier(" 7 ").id, legacy("7"));
    }

    #[test]
    fn stored_values_parse_strictly() {
        assert_eq!(
            Identifier::parse_stored(SENTINEL_IDENTIFIER),
            Ok(Identifier::Unresolved)
        );
        assert_eq!(Identifier::parse_stored("5"), Ok(legacy("5")));
        assert_eq!(Identifier::parse_stored("05"), Ok(legacy("05")));
        assert!(Identifier::parse_stored("J1").is_err());
        assert!(Identifier::parse_stored(" 5").is_err());
    }

    #[test]
    fn serde_uses_the_rendered_form() {
        let id = normalize_identifier("F47AC10B-58CC-4372-A567-0E02B2C3D479").id;
        let json = match serde_json::to_string(&id) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(json, "\"f47ac10b-58cc-4372-a567-0e02b2c3d479\"");
        let back: Identifier = match serde_json::from_str(&json) {
            Ok(value) => value,
            Err(err) => panic!("deserialize failed: {err}"),
        };
        assert_eq!(back, id);
    }
}
