//! Named accessors over the Portale Appalti notice layout.
//!
//! The upstream document is a loosely typed tree; every positional assumption
//! about it lives in the path constants below.

use appalti_core::{
    AuthorityRecord, ExtractedNotice, LotRecord, NoticeRecord, TenderRecord, GENERAL_DATA_SECTION,
    LOT_OBJECT_TYPE,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("missing required field `{path}`")]
    MissingField { path: String },
    #[error("field `{path}` is not {expected}")]
    UnexpectedType { path: String, expected: &'static str },
}

#[derive(Debug, Clone, Copy)]
enum Seg {
    Key(&'static str),
    Idx(usize),
}

use Seg::{Idx, Key};

const FORM: &[Seg] = &[Key("template"), Idx(0), Key("template")];
const AVVISO: &[Seg] = &[Key("template"), Idx(0), Key("avviso"), Idx(0)];
const AUTHORITY: &[Seg] = &[Key("sections"), Idx(0), Key("fields"), Key("soggetti_sa"), Idx(0)];
const TENDER_DESCRIPTION: &[Seg] = &[Key("metadata"), Key("descrizione")];
const SECTIONS: &[Seg] = &[Key("sections")];
const LOT_ITEMS: &[Seg] = &[Key("sections"), Idx(2), Key("items")];

const PROCEDURE_TYPE_FIELD: &str = "tipo_procedura_aggiudicazione";

#[derive(Debug, Clone)]
struct Node<'v> {
    value: &'v JsonValue,
    path: String,
}

impl<'v> Node<'v> {
    fn root(value: &'v JsonValue) -> Self {
        Self {
            value,
            path: "$".to_string(),
        }
    }

    fn child(&self, seg: Seg) -> Option<Node<'v>> {
        let (value, path) = match seg {
            Key(key) => (self.value.get(key)?, format!("{}.{key}", self.path)),
            Idx(idx) => (self.value.get(idx)?, format!("{}[{idx}]", self.path)),
        };
        if value.is_null() {
            return None;
        }
        Some(Node { value, path })
    }

    fn at(&self, path: &[Seg]) -> Option<Node<'v>> {
        let mut cur = self.clone();
        for seg in path {
            cur = cur.child(*seg)?;
        }
        Some(cur)
    }

    fn require(&self, path: &[Seg]) -> Result<Node<'v>, ExtractError> {
        let mut cur = self.clone();
        for seg in path {
            cur = match cur.child(*seg) {
                Some(next) => next,
                None => {
                    return Err(ExtractError::MissingField {
                        path: render_path(&self.path, path),
                    })
                }
            };
        }
        Ok(cur)
    }

    fn require_array(&self, path: &[Seg]) -> Result<(String, &'v Vec<JsonValue>), ExtractError> {
        let node = self.require(path)?;
        match node.value.as_array() {
            Some(items) => Ok((node.path, items)),
            None => Err(ExtractError::UnexpectedType {
                path: node.path,
                expected: "an array",
            }),
        }
    }

    fn require_text(&self, path: &[Seg]) -> Result<String, ExtractError> {
        let node = self.require(path)?;
        if node.value.is_object() || node.value.is_array() || node.value.is_boolean() {
            return Err(ExtractError::UnexpectedType {
                path: node.path,
                expected: "text",
            });
        }
        text_value(node.value).ok_or(ExtractError::MissingField { path: node.path })
    }

    /// Natural keys are compared trimmed; every other text is kept as given.
    fn require_key(&self, path: &[Seg]) -> Result<String, ExtractError> {
        self.require_text(path).map(|text| text.trim().to_string())
    }

    fn text(&self, key: &'static str) -> Option<String> {
        self.child(Key(key)).and_then(|n| text_value(n.value))
    }

    fn key(&self, key: &'static str) -> Option<String> {
        self.text(key).map(|text| text.trim().to_string())
    }

    fn timestamp(&self, key: &'static str) -> Option<DateTime<Utc>> {
        let node = self.child(Key(key))?;
        let Some(raw) = node.value.as_str() else {
            warn!(field = %node.path, raw = %node.value, "timestamp is not text; storing no value");
            return None;
        };
        if raw.trim().is_empty() {
            return None;
        }
        let parsed = parse_flexible_timestamp(raw);
        if parsed.is_none() {
            warn!(field = %node.path, raw, "unparseable timestamp; storing no value");
        }
        parsed
    }
}

fn render_path(base: &str, path: &[Seg]) -> String {
    let mut out = base.to_string();
    for seg in path {
        match seg {
            Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Idx(idx) => out.push_str(&format!("[{idx}]")),
        }
    }
    out
}

/// Text that is not blank, unchanged; numbers are rendered as text.
fn text_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn flag_value(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) if s.trim().eq_ignore_ascii_case("true") => Some(true),
        JsonValue::String(s) if s.trim().eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// ISO-8601-ish text to an instant. Offset-less values are taken as UTC.
pub fn parse_flexible_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Pulls the authority, tender, notice, procedure type and lots out of one document.
///
/// Absent required paths fail the document; optional ones come back as `None`.
pub fn extract_notice(doc: &JsonValue) -> Result<ExtractedNotice, ExtractError> {
    if !doc.is_object() {
        return Err(ExtractError::UnexpectedType {
            path: "$".to_string(),
            expected: "an object",
        });
    }
    let root = Node::root(doc);
    let notice_id = root.require_key(&[Key("idAvviso")])?;
    let ocid = root.require_key(&[Key("idAppalto")])?;
    let form = root.require(FORM)?;
    let avviso = root.require(AVVISO)?;

    let authority_node = form.require(AUTHORITY)?;
    let authority = AuthorityRecord {
        fiscal_code: authority_node.require_key(&[Key("codice_fiscale")])?,
        display_name: authority_node.text("denominazione_amministrazione"),
    };

    let published_at = root.timestamp("dataPubblicazione");
    let tender = TenderRecord {
        ocid: ocid.clone(),
        description: form.require_text(TENDER_DESCRIPTION)?,
        published_at,
    };

    let notice = NoticeRecord {
        notice_id,
        ocid,
        notice_code: root.text("codiceScheda"),
        published_at,
        expires_at: root.timestamp("dataScadenza"),
        registered_at: avviso.timestamp("dataPCP"),
    };

    let procedure_type = procedure_type(&form)?;
    let lots = lots(&form)?;

    Ok(ExtractedNotice {
        authority,
        tender,
        notice,
        procedure_type,
        lots,
    })
}

fn procedure_type(form: &Node<'_>) -> Result<Option<String>, ExtractError> {
    let (path, sections) = form.require_array(SECTIONS)?;
    let general = sections.iter().enumerate().find(|(_, section)| {
        section.get("name").and_then(JsonValue::as_str) == Some(GENERAL_DATA_SECTION)
            && section.get("fields").is_some()
    });
    let Some((idx, section)) = general else {
        return Ok(None);
    };
    let node = Node {
        value: section,
        path: format!("{path}[{idx}]"),
    };
    Ok(node
        .at(&[Key("fields"), Key(PROCEDURE_TYPE_FIELD)])
        .and_then(|n| text_value(n.value)))
}

fn lots(form: &Node<'_>) -> Result<Vec<LotRecord>, ExtractError> {
    let (path, items) = form.require_array(LOT_ITEMS)?;
    Ok(items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.get("tipo_oggetto").and_then(JsonValue::as_str) == Some(LOT_OBJECT_TYPE))
        .map(|(idx, item)| {
            let node = Node {
                value: item,
                path: format!("{path}[{idx}]"),
            };
            lot(&node)
        })
        .collect())
}

fn lot(node: &Node<'_>) -> LotRecord {
    let field = |key: &'static str| node.child(Key(key)).map(|n| n.value);
    LotRecord {
        cig: node.key("cig"),
        description: node.text("descrizione"),
        nature_text: node.text("natura_principale"),
        estimated_value: field("valore_complessivo_stimato").and_then(number_value),
        award_criterion_text: node.text("criteri_aggiudicazione"),
        receipt_deadline: node.timestamp("termine_ricezione"),
        framework_agreement: field("accordo_quadro").and_then(flag_value),
        dynamic_acquisition_system: field("sistema_dinamico_acquisizione").and_then(flag_value),
        electronic_auction_text: field("asta_elettronica").and_then(|v| match v {
            JsonValue::Bool(b) => Some(b.to_string()),
            other => text_value(other),
        }),
        place_code: node.text("luogo_istat"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn fixture(rel: &str) -> JsonValue {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/notices")
            .join(rel);
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read fixture")).expect("parse fixture")
    }

    fn minimal(sections: JsonValue) -> JsonValue {
        json!({
            "idAvviso": 991,
            "idAppalto": "ocds-x",
            "template": [{
                "avviso": [{}],
                "template": {
                    "metadata": {"descrizione": "Gara"},
                    "sections": sections
                }
            }]
        })
    }

    fn authority_section() -> JsonValue {
        json!({"fields": {"soggetti_sa": [{"codice_fiscale": "123"}]}})
    }

    #[test]
    fn extracts_full_notice_fixture() {
        let notice = extract_notice(&fixture("single/avviso-8f1c.json")).unwrap();

        assert_eq!(notice.authority.fiscal_code, "80012345678");
        assert_eq!(notice.authority.display_name.as_deref(), Some("Comune di Esempio"));
        assert_eq!(notice.tender.ocid, "ocds-appalti-2025-0001");
        assert!(notice.tender.description.starts_with("Servizio di manutenzione"));
        assert_eq!(notice.notice.notice_id, "8f1c2a34-5b6d-4e7f-9a01-23456789abcd");
        assert_eq!(notice.notice.notice_code.as_deref(), Some("P1_16"));
        assert_eq!(
            notice.notice.published_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 5, 7, 30, 0).unwrap())
        );
        assert!(notice.notice.registered_at.is_some());
        assert_eq!(notice.procedure_type.as_deref(), Some("aperta"));

        assert_eq!(notice.lots.len(), 2, "non-lot items are ignored");
        let first = &notice.lots[0];
        assert_eq!(first.cig.as_deref(), Some("B1A2C3D4E5"));
        assert_eq!(first.nature_text.as_deref(), Some("Servizi"));
        assert_eq!(first.estimated_value, Some(125000.5));
        assert_eq!(first.framework_agreement, Some(false));
        assert_eq!(first.dynamic_acquisition_system, Some(false));
        assert_eq!(first.electronic_auction_text.as_deref(), Some("TRUE"));
        assert_eq!(first.place_code.as_deref(), Some("ITI43-058091"));

        let second = &notice.lots[1];
        assert_eq!(second.estimated_value, Some(48000.0));
        assert_eq!(second.receipt_deadline, None, "free text deadline degrades to no value");
        assert_eq!(second.framework_agreement, Some(true));
        assert_eq!(second.dynamic_acquisition_system, None);
    }

    #[test]
    fn missing_general_data_section_yields_no_procedure_type() {
        let notice = extract_notice(&fixture("same-tender/01-avviso-preinformazione.json")).unwrap();
        assert_eq!(notice.procedure_type, None);
        assert_eq!(notice.notice.expires_at, None, "empty text is no value");
        assert_eq!(
            notice.notice.registered_at,
            Some(Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn missing_authority_is_a_structural_failure() {
        let doc = minimal(json!([{"fields": {}}, {}, {"items": []}]));
        let err = extract_notice(&doc).unwrap_err();
        assert_eq!(
            err,
            ExtractError::MissingField {
                path: "$.template[0].template.sections[0].fields.soggetti_sa[0]".to_string()
            }
        );
    }

    #[test]
    fn missing_lot_section_is_a_structural_failure() {
        let doc = minimal(json!([authority_section()]));
        assert!(matches!(
            extract_notice(&doc),
            Err(ExtractError::MissingField { path }) if path.ends_with("sections[2].items")
        ));
    }

    #[test]
    fn numeric_notice_id_is_accepted_as_text() {
        let doc = minimal(json!([authority_section(), {}, {"items": []}]));
        let notice = extract_notice(&doc).unwrap();
        assert_eq!(notice.notice.notice_id, "991");
        assert!(notice.lots.is_empty());
        assert_eq!(notice.authority.display_name, None);
    }

    #[test]
    fn procedure_section_without_field_yields_none() {
        let doc = minimal(json!([
            authority_section(),
            {"name": "SEZ. B - Dati Generali", "fields": {"altro": "x"}},
            {"items": []}
        ]));
        assert_eq!(extract_notice(&doc).unwrap().procedure_type, None);
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(matches!(
            extract_notice(&json!([1, 2])),
            Err(ExtractError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn lot_items_must_be_an_array() {
        let doc = minimal(json!([authority_section(), {}, {"items": {"cig": "X"}}]));
        assert!(matches!(
            extract_notice(&doc),
            Err(ExtractError::UnexpectedType { expected: "an array", .. })
        ));
    }

    #[test]
    fn boolean_auction_flag_is_kept_as_text() {
        let doc = minimal(json!([
            authority_section(),
            {},
            {"items": [{"tipo_oggetto": "lotto", "cig": "Z1", "asta_elettronica": true, "luogo_istat": 58091}]}
        ]));
        let notice = extract_notice(&doc).unwrap();
        assert_eq!(notice.lots[0].electronic_auction_text.as_deref(), Some("true"));
        assert_eq!(notice.lots[0].place_code.as_deref(), Some("58091"));
    }

    #[test]
    fn text_is_stored_as_given_and_keys_are_trimmed() {
        let mut doc = minimal(json!([
            authority_section(),
            {},
            {"items": [{
                "tipo_oggetto": "lotto",
                "cig": " Z1 ",
                "descrizione": "  Lotto unico ",
                "asta_elettronica": " true ",
                "luogo_istat": "  ITI43-058091"
            }]}
        ]));
        doc["idAppalto"] = json!(" ocds-x ");
        doc["template"][0]["template"]["metadata"]["descrizione"] = json!("  Gara  ");

        let notice = extract_notice(&doc).unwrap();
        assert_eq!(notice.tender.ocid, "ocds-x");
        assert_eq!(notice.tender.description, "  Gara  ");
        let lot = &notice.lots[0];
        assert_eq!(lot.cig.as_deref(), Some("Z1"));
        assert_eq!(lot.description.as_deref(), Some("  Lotto unico "));
        assert_eq!(lot.electronic_auction_text.as_deref(), Some(" true "));
        assert_eq!(lot.place_code.as_deref(), Some("  ITI43-058091"));
    }

    #[test]
    fn flexible_timestamps() {
        let at = |y, mo, d, h, mi, s| Some(Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap());
        assert_eq!(parse_flexible_timestamp("2025-06-05T10:00:00Z"), at(2025, 6, 5, 10, 0, 0));
        assert_eq!(parse_flexible_timestamp("2025-06-05T10:00:00+02:00"), at(2025, 6, 5, 8, 0, 0));
        assert_eq!(parse_flexible_timestamp("2025-06-05T10:00:00"), at(2025, 6, 5, 10, 0, 0));
        assert_eq!(parse_flexible_timestamp("2025-06-05 10:00:00"), at(2025, 6, 5, 10, 0, 0));
        assert_eq!(parse_flexible_timestamp("2025-06-05"), at(2025, 6, 5, 0, 0, 0));
        assert_eq!(parse_flexible_timestamp(" "), None);
        assert_eq!(parse_flexible_timestamp("entro luglio"), None);
        assert_eq!(parse_flexible_timestamp("2025-13-40"), None);
    }
}
