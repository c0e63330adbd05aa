//! In-process store with the same conflict semantics as the PostgreSQL tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use appalti_core::{LookupTable, MissingLookup};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{BatchStore, ExtraColumn, LotRow, NoticeRow, NoticeStore, RowCounts, StoreError, TenderRow};

#[derive(Debug, Clone, PartialEq)]
pub struct LookupEntry {
    pub id: i64,
    pub extra: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    pub lookups: BTreeMap<LookupTable, BTreeMap<String, LookupEntry>>,
    pub tenders: BTreeMap<String, (i64, TenderRow)>,
    pub notices: BTreeMap<String, NoticeRow>,
    pub procedure_details: BTreeMap<i64, String>,
    pub lots: BTreeMap<(i64, String), (i64, LotRow)>,
    sequences: BTreeMap<&'static str, i64>,
}

impl MemorySnapshot {
    fn next_id(&mut self, table: &'static str) -> i64 {
        let seq = self.sequences.entry(table).or_insert(0);
        *seq += 1;
        *seq
    }

    fn lookup_count(&self, table: LookupTable) -> i64 {
        self.lookups.get(&table).map(|rows| rows.len() as i64).unwrap_or(0)
    }

    fn has_lookup_id(&self, table: LookupTable, id: i64) -> bool {
        self.lookups
            .get(&table)
            .map(|rows| rows.values().any(|row| row.id == id))
            .unwrap_or(false)
    }

    fn has_tender_id(&self, id: i64) -> bool {
        self.tenders.values().any(|(tender_id, _)| *tender_id == id)
    }

    pub fn row_counts(&self) -> RowCounts {
        RowCounts {
            ente_appaltante: self.lookup_count(LookupTable::ContractingAuthority),
            gara: self.tenders.len() as i64,
            avviso_gara: self.notices.len() as i64,
            bando_dettaglio: self.procedure_details.len() as i64,
            lotto: self.lots.len() as i64,
            natura_principale: self.lookup_count(LookupTable::NatureOfContract),
            criterio_aggiudicazione: self.lookup_count(LookupTable::AwardCriterion),
        }
    }

    pub fn lookup_id(&self, table: LookupTable, key: &str) -> Option<i64> {
        self.lookups.get(&table)?.get(key).map(|row| row.id)
    }

    pub fn tender_id(&self, ocid: &str) -> Option<i64> {
        self.tenders.get(ocid).map(|(id, _)| *id)
    }

    pub fn lot(&self, tender_id: i64, cig: &str) -> Option<&LotRow> {
        self.lots
            .get(&(tender_id, cig.to_string()))
            .map(|(_, row)| row)
    }

    pub fn lot_cigs(&self) -> BTreeSet<String> {
        self.lots.keys().map(|(_, cig)| cig.clone()).collect()
    }
}

/// Shared committed state; each [`MemoryDatabase::begin`] works on a private copy.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    committed: Arc<Mutex<MemorySnapshot>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self) -> MemoryTransaction {
        let work = self.committed.lock().await.clone();
        MemoryTransaction {
            db: self.clone(),
            work,
            savepoint: None,
            rejected_cigs: BTreeSet::new(),
        }
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        self.committed.lock().await.clone()
    }
}

pub struct MemoryTransaction {
    db: MemoryDatabase,
    work: MemorySnapshot,
    savepoint: Option<MemorySnapshot>,
    rejected_cigs: BTreeSet<String>,
}

impl MemoryTransaction {
    /// Makes lot writes for `cig` fail, standing in for a database-side rejection.
    pub fn reject_lot(mut self, cig: impl Into<String>) -> Self {
        self.rejected_cigs.insert(cig.into());
        self
    }

    pub fn pending(&self) -> &MemorySnapshot {
        &self.work
    }
}

#[async_trait]
impl NoticeStore for MemoryTransaction {
    async fn resolve_lookup(
        &mut self,
        table: LookupTable,
        key: &str,
        on_missing: MissingLookup,
        extra: &[ExtraColumn<'_>],
    ) -> Result<Option<i64>, StoreError> {
        if let Some(id) = self.work.lookup_id(table, key) {
            return Ok(Some(id));
        }
        if on_missing == MissingLookup::ReturnNone {
            return Ok(None);
        }
        let id = self.work.next_id(table.table_name());
        let extra = extra
            .iter()
            .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
            .collect();
        self.work
            .lookups
            .entry(table)
            .or_default()
            .insert(key.to_string(), LookupEntry { id, extra });
        Ok(Some(id))
    }

    async fn upsert_tender(&mut self, row: &TenderRow) -> Result<i64, StoreError> {
        if let Some((id, _)) = self.work.tenders.get(&row.ocid) {
            return Ok(*id);
        }
        if !self.work.has_lookup_id(LookupTable::ContractingAuthority, row.authority_id) {
            return Err(StoreError::Constraint {
                table: "gara",
                detail: format!("unknown ente_appaltante_id {}", row.authority_id),
            });
        }
        let id = self.work.next_id("gara");
        self.work.tenders.insert(row.ocid.clone(), (id, row.clone()));
        Ok(id)
    }

    async fn upsert_notice(&mut self, row: &NoticeRow) -> Result<(), StoreError> {
        if !self.work.has_tender_id(row.tender_id) {
            return Err(StoreError::Constraint {
                table: "avviso_gara",
                detail: format!("unknown gara_id {}", row.tender_id),
            });
        }
        match self.work.notices.get_mut(&row.notice_id) {
            Some(existing) => existing.tender_id = row.tender_id,
            None => {
                self.work.notices.insert(row.notice_id.clone(), row.clone());
            }
        }
        Ok(())
    }

    async fn upsert_procedure_detail(&mut self, tender_id: i64, procedure_type: &str) -> Result<(), StoreError> {
        if !self.work.has_tender_id(tender_id) {
            return Err(StoreError::Constraint {
                table: "bando_dettaglio",
                detail: format!("unknown gara_id {tender_id}"),
            });
        }
        self.work
            .procedure_details
            .insert(tender_id, procedure_type.to_string());
        Ok(())
    }

    async fn upsert_lot(&mut self, row: &LotRow) -> Result<i64, StoreError> {
        if self.rejected_cigs.contains(&row.cig) {
            return Err(StoreError::Constraint {
                table: "lotto",
                detail: format!("cig {} rejected", row.cig),
            });
        }
        let key = (row.tender_id, row.cig.clone());
        if let Some((id, _)) = self.work.lots.get(&key) {
            return Ok(*id);
        }
        let nature_ok = row
            .nature_id
            .map_or(true, |id| self.work.has_lookup_id(LookupTable::NatureOfContract, id));
        let criterion_ok = row
            .award_criterion_id
            .map_or(true, |id| self.work.has_lookup_id(LookupTable::AwardCriterion, id));
        if !self.work.has_tender_id(row.tender_id) || !nature_ok || !criterion_ok {
            return Err(StoreError::Constraint {
                table: "lotto",
                detail: format!("dangling reference for cig {}", row.cig),
            });
        }
        let id = self.work.next_id("lotto");
        self.work.lots.insert(key, (id, row.clone()));
        Ok(id)
    }

    async fn savepoint(&mut self) -> Result<(), StoreError> {
        self.savepoint = Some(self.work.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StoreError> {
        self.savepoint = None;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError> {
        if let Some(saved) = self.savepoint.take() {
            self.work = saved;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchStore for MemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        *self.db.committed.lock().await = self.work;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
