//! Core domain model for the Portale Appalti importer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "appalti-core";

/// Width of the `lotto.luogo_istat` column.
pub const PLACE_CODE_MAX_CHARS: usize = 10;

/// Section carrying the award-procedure type.
pub const GENERAL_DATA_SECTION: &str = "SEZ. B - Dati Generali";

/// Type marker of lot entries inside the lot section's `items`.
pub const LOT_OBJECT_TYPE: &str = "lotto";

pub const SUMMARY_DESCRIPTION_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityRecord {
    pub fiscal_code: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub ocid: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeRecord {
    pub notice_id: String,
    pub ocid: String,
    pub notice_code: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
}

/// One `tipo_oggetto == "lotto"` entry, with its free-text codes still unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LotRecord {
    pub cig: Option<String>,
    pub description: Option<String>,
    pub nature_text: Option<String>,
    pub estimated_value: Option<f64>,
    pub award_criterion_text: Option<String>,
    pub receipt_deadline: Option<DateTime<Utc>>,
    pub framework_agreement: Option<bool>,
    pub dynamic_acquisition_system: Option<bool>,
    pub electronic_auction_text: Option<String>,
    pub place_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedNotice {
    pub authority: AuthorityRecord,
    pub tender: TenderRecord,
    pub notice: NoticeRecord,
    pub procedure_type: Option<String>,
    pub lots: Vec<LotRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LookupTable {
    ContractingAuthority,
    NatureOfContract,
    AwardCriterion,
}

impl LookupTable {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::ContractingAuthority => "ente_appaltante",
            Self::NatureOfContract => "natura_principale",
            Self::AwardCriterion => "criterio_aggiudicazione",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            Self::ContractingAuthority => "codice_fiscale",
            Self::NatureOfContract | Self::AwardCriterion => "codice",
        }
    }
}

/// What a lookup does when the natural key has no row yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingLookup {
    Create,
    ReturnNone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeMap {
    entries: BTreeMap<String, String>,
}

impl CodeMap {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut map = Self::default();
        for (text, code) in pairs {
            map.insert(text, code);
        }
        map
    }

    pub fn insert(&mut self, text: impl AsRef<str>, code: impl Into<String>) {
        self.entries
            .insert(text.as_ref().trim().to_string(), code.into());
    }

    pub fn canonical(&self, text: &str) -> Option<&str> {
        self.entries.get(text.trim()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMaps {
    pub nature: CodeMap,
    pub award_criterion: CodeMap,
}

impl Default for CodeMaps {
    fn default() -> Self {
        Self {
            nature: CodeMap::from_pairs([
                ("Servizi", "services"),
                ("Services", "services"),
                ("Forniture", "goods"),
                ("Supplies", "goods"),
                ("Goods", "goods"),
                ("Lavori", "works"),
                ("Works", "works"),
            ]),
            award_criterion: CodeMap::from_pairs([
                ("Prezzo", "price"),
                ("Price", "price"),
                ("Qualità", "quality"),
                ("Quality", "quality"),
            ]),
        }
    }
}

/// Case-insensitive `"true"`, with no surrounding whitespace, is the only value that sets the flag.
pub fn electronic_auction_flag(text: Option<&str>) -> bool {
    text.map(|t| t.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Keeps at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &input[..byte_idx],
        None => input,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_maps_translate_italian_and_english_labels() {
        let maps = CodeMaps::default();
        assert_eq!(maps.nature.canonical("Servizi"), Some("services"));
        assert_eq!(maps.nature.canonical("Services"), Some("services"));
        assert_eq!(maps.nature.canonical(" Lavori "), Some("works"));
        assert_eq!(maps.award_criterion.canonical("Qualità"), Some("quality"));
        assert_eq!(maps.nature.canonical("Concessioni"), None);
    }

    #[test]
    fn electronic_auction_only_accepts_true_text() {
        assert!(electronic_auction_flag(Some("true")));
        assert!(electronic_auction_flag(Some("TRUE")));
        assert!(electronic_auction_flag(Some("True")));
        assert!(!electronic_auction_flag(Some("false")));
        assert!(!electronic_auction_flag(Some("yes")));
        assert!(!electronic_auction_flag(Some("")));
        assert!(!electronic_auction_flag(None));
    }

    #[test]
    fn padded_auction_text_is_not_true() {
        assert!(!electronic_auction_flag(Some(" true ")));
        assert!(!electronic_auction_flag(Some("true\n")));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("058091", PLACE_CODE_MAX_CHARS), "058091");
        assert_eq!(truncate_chars("ITI43-058091", PLACE_CODE_MAX_CHARS), "ITI43-0580");
        assert_eq!(truncate_chars("àèìòùàèìòùà", PLACE_CODE_MAX_CHARS), "àèìòùàèìòù");
        assert_eq!(truncate_chars("", PLACE_CODE_MAX_CHARS), "");
        assert_eq!(truncate_chars("  ITI43-058091", PLACE_CODE_MAX_CHARS), "  ITI43-05");
    }

    #[test]
    fn lookup_tables_name_their_columns() {
        assert_eq!(LookupTable::ContractingAuthority.table_name(), "ente_appaltante");
        assert_eq!(LookupTable::ContractingAuthority.key_column(), "codice_fiscale");
        assert_eq!(LookupTable::AwardCriterion.key_column(), "codice");
    }
}
