//! Code resolution + conflict-resolving writes for notice rows.

use appalti_core::{CodeMap, LookupTable, MissingLookup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod pg;
mod writer;

pub use memory::{MemoryDatabase, MemorySnapshot, MemoryTransaction};
pub use pg::{row_counts, PgNoticeStore};
pub use writer::{write_notice, WrittenNotice};

pub const CRATE_NAME: &str = "appalti-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("constraint violated on {table}: {detail}")]
    Constraint { table: &'static str, detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TenderRow {
    pub ocid: String,
    pub authority_id: i64,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoticeRow {
    pub notice_id: String,
    pub tender_id: i64,
    pub ocid: String,
    pub notice_code: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LotRow {
    pub tender_id: i64,
    pub cig: String,
    pub description: Option<String>,
    pub nature_id: Option<i64>,
    pub estimated_value: Option<f64>,
    pub award_criterion_id: Option<i64>,
    pub receipt_deadline: Option<DateTime<Utc>>,
    pub framework_agreement: Option<bool>,
    pub dynamic_acquisition_system: Option<bool>,
    pub electronic_auction: bool,
    pub place_code: Option<String>,
}

/// Extra attribute written alongside the natural key when a lookup row is created.
pub type ExtraColumn<'a> = (&'static str, Option<&'a str>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowCounts {
    pub ente_appaltante: i64,
    pub gara: i64,
    pub avviso_gara: i64,
    pub bando_dettaglio: i64,
    pub lotto: i64,
    pub natura_principale: i64,
    pub criterio_aggiudicazione: i64,
}

/// Write surface used by the notice writer. All calls share the caller's transaction.
#[async_trait]
pub trait NoticeStore: Send {
    /// Natural-key lookup, optionally creating the row with `extra` attributes.
    async fn resolve_lookup(
        &mut self,
        table: LookupTable,
        key: &str,
        on_missing: MissingLookup,
        extra: &[ExtraColumn<'_>],
    ) -> Result<Option<i64>, StoreError>;

    /// Insert-or-fetch by OCID; an existing row is returned untouched.
    async fn upsert_tender(&mut self, row: &TenderRow) -> Result<i64, StoreError>;

    /// Insert by notice id; on conflict only the tender reference is updated.
    async fn upsert_notice(&mut self, row: &NoticeRow) -> Result<(), StoreError>;

    async fn upsert_procedure_detail(&mut self, tender_id: i64, procedure_type: &str) -> Result<(), StoreError>;

    /// Insert-or-fetch by (tender, CIG); an existing row is returned untouched.
    async fn upsert_lot(&mut self, row: &LotRow) -> Result<i64, StoreError>;

    async fn savepoint(&mut self) -> Result<(), StoreError>;
    async fn release_savepoint(&mut self) -> Result<(), StoreError>;
    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BatchStore: NoticeStore + Sized {
    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}

/// Free text -> canonical code -> lookup id. Unmapped text is a null reference.
pub async fn resolve_code<S: NoticeStore + ?Sized>(
    store: &mut S,
    table: LookupTable,
    map: &CodeMap,
    free_text: Option<&str>,
    on_missing: MissingLookup,
) -> Result<Option<i64>, StoreError> {
    let Some(code) = free_text.and_then(|text| map.canonical(text)) else {
        return Ok(None);
    };
    store.resolve_lookup(table, code, on_missing, &[]).await
}
