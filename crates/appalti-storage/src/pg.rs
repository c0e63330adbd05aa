use appalti_core::{LookupTable, MissingLookup};
use async_trait::async_trait;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::debug;

use crate::{BatchStore, ExtraColumn, LotRow, NoticeRow, NoticeStore, RowCounts, StoreError, TenderRow};

const DOCUMENT_SAVEPOINT: &str = "appalti_document";

pub struct PgNoticeStore<'c> {
    tx: Transaction<'c, Postgres>,
}

impl<'c> PgNoticeStore<'c> {
    pub async fn begin(conn: &'c mut PgConnection) -> Result<Self, StoreError> {
        let tx = sqlx::Connection::begin(conn).await?;
        Ok(Self { tx })
    }
}

#[async_trait]
impl<'c> NoticeStore for PgNoticeStore<'c> {
    async fn resolve_lookup(
        &mut self,
        table: LookupTable,
        key: &str,
        on_missing: MissingLookup,
        extra: &[ExtraColumn<'_>],
    ) -> Result<Option<i64>, StoreError> {
        let select = format!(
            "SELECT id FROM {} WHERE {} = $1",
            table.table_name(),
            table.key_column()
        );
        let existing: Option<i64> = sqlx::query_scalar(&select)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        if existing.is_some() || on_missing == MissingLookup::ReturnNone {
            return Ok(existing);
        }

        let columns = std::iter::once(table.key_column())
            .chain(extra.iter().map(|(name, _)| *name))
            .collect::<Vec<_>>();
        let placeholders = (1..=columns.len())
            .map(|n| format!("${n}"))
            .collect::<Vec<_>>();
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            table.table_name(),
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut query = sqlx::query_scalar::<_, i64>(&insert).bind(key);
        for (_, value) in extra {
            query = query.bind(*value);
        }
        let id = query.fetch_one(&mut *self.tx).await?;
        debug!(table = table.table_name(), key, id, "created lookup row");
        Ok(Some(id))
    }

    async fn upsert_tender(&mut self, row: &TenderRow) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO gara (ocid, ente_appaltante_id, descrizione, data_pubblicazione)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ocid) DO UPDATE SET ocid = EXCLUDED.ocid
            RETURNING id
            "#,
        )
        .bind(&row.ocid)
        .bind(row.authority_id)
        .bind(&row.description)
        .bind(row.published_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_notice(&mut self, row: &NoticeRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO avviso_gara (id, gara_id, id_appalto, codice_scheda, data_pubblicazione, data_scadenza, data_pcp)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET gara_id = EXCLUDED.gara_id
            "#,
        )
        .bind(&row.notice_id)
        .bind(row.tender_id)
        .bind(&row.ocid)
        .bind(&row.notice_code)
        .bind(row.published_at)
        .bind(row.expires_at)
        .bind(row.registered_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_procedure_detail(&mut self, tender_id: i64, procedure_type: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bando_dettaglio (gara_id, tipo_scelta_contraente)
            VALUES ($1, $2)
            ON CONFLICT (gara_id) DO UPDATE SET tipo_scelta_contraente = EXCLUDED.tipo_scelta_contraente
            "#,
        )
        .bind(tender_id)
        .bind(procedure_type)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_lot(&mut self, row: &LotRow) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO lotto (
              gara_id, cig, descrizione, natura_principale_id, valore,
              criterio_aggiudicazione_id, termine_ricezione, accordo_quadro,
              sistema_dinamico_acq, asta_elettronica, luogo_istat
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (gara_id, cig) DO UPDATE SET cig = EXCLUDED.cig
            RETURNING id
            "#,
        )
        .bind(row.tender_id)
        .bind(&row.cig)
        .bind(&row.description)
        .bind(row.nature_id)
        .bind(row.estimated_value)
        .bind(row.award_criterion_id)
        .bind(row.receipt_deadline)
        .bind(row.framework_agreement)
        .bind(row.dynamic_acquisition_system)
        .bind(row.electronic_auction)
        .bind(&row.place_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(&format!("SAVEPOINT {DOCUMENT_SAVEPOINT}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(&format!("RELEASE SAVEPOINT {DOCUMENT_SAVEPOINT}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {DOCUMENT_SAVEPOINT}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<'c> BatchStore for PgNoticeStore<'c> {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

pub async fn row_counts(conn: &mut PgConnection) -> Result<RowCounts, StoreError> {
    let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
          (SELECT COUNT(*) FROM ente_appaltante),
          (SELECT COUNT(*) FROM gara),
          (SELECT COUNT(*) FROM avviso_gara),
          (SELECT COUNT(*) FROM bando_dettaglio),
          (SELECT COUNT(*) FROM lotto),
          (SELECT COUNT(*) FROM natura_principale),
          (SELECT COUNT(*) FROM criterio_aggiudicazione)
        "#,
    )
    .fetch_one(conn)
    .await?;
    Ok(RowCounts {
        ente_appaltante: row.0,
        gara: row.1,
        avviso_gara: row.2,
        bando_dettaglio: row.3,
        lotto: row.4,
        natura_principale: row.5,
        criterio_aggiudicazione: row.6,
    })
}
