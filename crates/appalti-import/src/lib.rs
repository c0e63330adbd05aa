//! Batch import: documents in, one transaction out.

use std::path::Path;

use anyhow::{Context, Result};
use appalti_adapters::{extract_notice, DocumentOrigin, DocumentSource, RawDocument, SourceError};
use appalti_core::{truncate_chars, CodeMaps, SUMMARY_DESCRIPTION_CHARS};
use appalti_storage::{write_notice, BatchStore, NoticeStore, PgNoticeStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, PgConnection};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;

pub use config::{load_code_maps, DatabaseConfig, ErrorPolicy, ImportConfig, UnknownErrorPolicy};

pub const CRATE_NAME: &str = "appalti-import";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub origin: String,
    pub notice_id: String,
    pub ocid: String,
    pub tender_id: i64,
    pub tender_description: String,
    pub lots: usize,
    pub lots_without_cig: usize,
    pub procedure_detail_written: bool,
}

pub trait ImportObserver: Send + Sync {
    fn document_imported(&self, report: &DocumentReport);
    fn document_skipped(&self, origin: &DocumentOrigin, error: &anyhow::Error);
}

#[derive(Debug, Default)]
pub struct TracingObserver;

impl ImportObserver for TracingObserver {
    fn document_imported(&self, report: &DocumentReport) {
        info!(
            tender = %truncate_chars(&report.tender_description, SUMMARY_DESCRIPTION_CHARS),
            ocid = %report.ocid,
            lots = report.lots,
            "imported notice {}",
            report.notice_id
        );
    }

    fn document_skipped(&self, origin: &DocumentOrigin, error: &anyhow::Error) {
        warn!(origin = %origin, error = %format!("{error:#}"), "document skipped");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub documents_seen: usize,
    pub documents_imported: usize,
    pub documents_skipped: usize,
    pub lots_written: usize,
    pub committed: bool,
}

impl BatchOutcome {
    fn record(&mut self, report: &DocumentReport) {
        self.documents_imported += 1;
        self.lots_written += report.lots;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: String,
    pub documents_seen: usize,
    pub documents_imported: usize,
    pub documents_skipped: usize,
    pub lots_written: usize,
    pub committed: bool,
}

/// Runs every document of `source` through `store` without committing.
pub async fn import_documents<S: NoticeStore>(
    store: &mut S,
    source: &DocumentSource,
    codes: &CodeMaps,
    policy: ErrorPolicy,
    observer: &dyn ImportObserver,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    for item in source.documents() {
        outcome.documents_seen += 1;
        let origin = match &item {
            Ok(doc) => doc.origin.clone(),
            Err(err) => origin_of(err),
        };
        let span = info_span!("document", origin = %origin);

        match policy {
            ErrorPolicy::AbortBatch => {
                let report = import_one(store, codes, item).instrument(span).await?;
                observer.document_imported(&report);
                outcome.record(&report);
            }
            ErrorPolicy::SkipDocument => {
                store.savepoint().await.context("opening document savepoint")?;
                match import_one(store, codes, item).instrument(span).await {
                    Ok(report) => {
                        store
                            .release_savepoint()
                            .await
                            .context("releasing document savepoint")?;
                        observer.document_imported(&report);
                        outcome.record(&report);
                    }
                    Err(err) => {
                        store
                            .rollback_to_savepoint()
                            .await
                            .context("rolling back document savepoint")?;
                        store
                            .release_savepoint()
                            .await
                            .context("releasing document savepoint")?;
                        observer.document_skipped(&origin, &err);
                        outcome.documents_skipped += 1;
                    }
                }
            }
        }
    }
    Ok(outcome)
}

fn origin_of(err: &SourceError) -> DocumentOrigin {
    DocumentOrigin {
        path: err.path().to_path_buf(),
        index: None,
    }
}

async fn import_one<S: NoticeStore>(
    store: &mut S,
    codes: &CodeMaps,
    item: Result<RawDocument, SourceError>,
) -> Result<DocumentReport> {
    let doc = item?;
    let notice = extract_notice(&doc.value).with_context(|| format!("extracting {}", doc.origin))?;
    let written = write_notice(store, codes, &notice)
        .await
        .with_context(|| format!("writing notice {} from {}", notice.notice.notice_id, doc.origin))?;
    Ok(DocumentReport {
        origin: doc.origin.to_string(),
        notice_id: written.notice_id,
        ocid: written.ocid,
        tender_id: written.tender_id,
        tender_description: written.tender_description,
        lots: written.lot_ids.len(),
        lots_without_cig: written.lots_without_cig,
        procedure_detail_written: written.procedure_detail_written,
    })
}

/// Imports the batch and ends the transaction: commit, or roll back on error or `dry_run`.
pub async fn run_batch<S: BatchStore>(
    mut store: S,
    source: &DocumentSource,
    codes: &CodeMaps,
    policy: ErrorPolicy,
    dry_run: bool,
    observer: &dyn ImportObserver,
) -> Result<BatchOutcome> {
    match import_documents(&mut store, source, codes, policy, observer).await {
        Ok(mut outcome) => {
            if dry_run {
                store.rollback().await.context("rolling back dry run")?;
            } else {
                store.commit().await.context("committing import")?;
                outcome.committed = true;
            }
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = store.rollback().await {
                warn!(error = %rollback_err, "rollback after failed batch also failed");
            }
            Err(err)
        }
    }
}

pub struct ImportPipeline {
    config: ImportConfig,
    codes: CodeMaps,
    observer: Box<dyn ImportObserver>,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig) -> Result<Self> {
        let codes = load_code_maps(config.code_maps_path.as_deref())?;
        Ok(Self {
            config,
            codes,
            observer: Box::<TracingObserver>::default(),
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn ImportObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub async fn run(&self, input: &Path) -> Result<ImportSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let source = DocumentSource::open(input)?;

        let options = self.config.database.connect_options()?;
        let mut conn = PgConnection::connect_with(&options)
            .await
            .with_context(|| format!("connecting to {}", self.config.database.display_target()))?;
        info!(%run_id, input = %input.display(), policy = ?self.config.on_error, dry_run = self.config.dry_run, "import started");

        let result = self.run_on(&mut conn, &source).await;
        let closed = conn.close().await.context("closing database connection");
        let outcome = result?;
        if let Err(err) = closed {
            warn!(error = %format!("{err:#}"), "connection close failed after import");
        }

        let summary = ImportSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input: input.display().to_string(),
            documents_seen: outcome.documents_seen,
            documents_imported: outcome.documents_imported,
            documents_skipped: outcome.documents_skipped,
            lots_written: outcome.lots_written,
            committed: outcome.committed,
        };
        info!(
            %run_id,
            documents = summary.documents_seen,
            imported = summary.documents_imported,
            skipped = summary.documents_skipped,
            lots = summary.lots_written,
            committed = summary.committed,
            "import finished"
        );
        Ok(summary)
    }

    async fn run_on(&self, conn: &mut PgConnection, source: &DocumentSource) -> Result<BatchOutcome> {
        let store = PgNoticeStore::begin(conn)
            .await
            .context("beginning import transaction")?;
        run_batch(
            store,
            source,
            &self.codes,
            self.config.on_error,
            self.config.dry_run,
            self.observer.as_ref(),
        )
        .await
    }
}
