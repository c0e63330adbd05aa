use appalti_core::{
    electronic_auction_flag, truncate_chars, CodeMaps, ExtractedNotice, LookupTable, LotRecord, MissingLookup,
    PLACE_CODE_MAX_CHARS,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{resolve_code, LotRow, NoticeRow, NoticeStore, StoreError, TenderRow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenNotice {
    pub authority_id: i64,
    pub tender_id: i64,
    pub notice_id: String,
    pub ocid: String,
    pub tender_description: String,
    pub lot_ids: Vec<i64>,
    pub lots_without_cig: usize,
    pub procedure_detail_written: bool,
}

/// Writes authority -> tender -> notice -> procedure detail -> lots, in that order.
pub async fn write_notice<S: NoticeStore + ?Sized>(
    store: &mut S,
    codes: &CodeMaps,
    notice: &ExtractedNotice,
) -> Result<WrittenNotice, StoreError> {
    let authority_id = store
        .resolve_lookup(
            LookupTable::ContractingAuthority,
            &notice.authority.fiscal_code,
            MissingLookup::Create,
            &[("denominazione", notice.authority.display_name.as_deref())],
        )
        .await?
        .ok_or_else(|| StoreError::Constraint {
            table: "ente_appaltante",
            detail: format!("no row for codice_fiscale {}", notice.authority.fiscal_code),
        })?;

    let tender_id = store
        .upsert_tender(&TenderRow {
            ocid: notice.tender.ocid.clone(),
            authority_id,
            description: notice.tender.description.clone(),
            published_at: notice.tender.published_at,
        })
        .await?;

    store
        .upsert_notice(&NoticeRow {
            notice_id: notice.notice.notice_id.clone(),
            tender_id,
            ocid: notice.notice.ocid.clone(),
            notice_code: notice.notice.notice_code.clone(),
            published_at: notice.notice.published_at,
            expires_at: notice.notice.expires_at,
            registered_at: notice.notice.registered_at,
        })
        .await?;

    let procedure_detail_written = match notice.procedure_type.as_deref() {
        Some(procedure_type) => {
            store.upsert_procedure_detail(tender_id, procedure_type).await?;
            true
        }
        None => false,
    };

    let mut lot_ids = Vec::with_capacity(notice.lots.len());
    let mut lots_without_cig = 0usize;
    for lot in &notice.lots {
        let Some(row) = lot_row(store, codes, tender_id, lot).await? else {
            warn!(ocid = %notice.tender.ocid, "lot without cig skipped");
            lots_without_cig += 1;
            continue;
        };
        let lot_id = store.upsert_lot(&row).await?;
        debug!(cig = %row.cig, lot_id, "lot written");
        lot_ids.push(lot_id);
    }

    Ok(WrittenNotice {
        authority_id,
        tender_id,
        notice_id: notice.notice.notice_id.clone(),
        ocid: notice.tender.ocid.clone(),
        tender_description: notice.tender.description.clone(),
        lot_ids,
        lots_without_cig,
        procedure_detail_written,
    })
}

async fn lot_row<S: NoticeStore + ?Sized>(
    store: &mut S,
    codes: &CodeMaps,
    tender_id: i64,
    lot: &LotRecord,
) -> Result<Option<LotRow>, StoreError> {
    let Some(cig) = lot.cig.clone() else {
        return Ok(None);
    };
    let nature_id = resolve_code(
        store,
        LookupTable::NatureOfContract,
        &codes.nature,
        lot.nature_text.as_deref(),
        MissingLookup::Create,
    )
    .await?;
    let award_criterion_id = resolve_code(
        store,
        LookupTable::AwardCriterion,
        &codes.award_criterion,
        lot.award_criterion_text.as_deref(),
        MissingLookup::ReturnNone,
    )
    .await?;
    Ok(Some(LotRow {
        tender_id,
        cig,
        description: lot.description.clone(),
        nature_id,
        estimated_value: lot.estimated_value,
        award_criterion_id,
        receipt_deadline: lot.receipt_deadline,
        framework_agreement: lot.framework_agreement,
        dynamic_acquisition_system: lot.dynamic_acquisition_system,
        electronic_auction: electronic_auction_flag(lot.electronic_auction_text.as_deref()),
        place_code: lot
            .place_code
            .as_deref()
            .map(|code| truncate_chars(code, PLACE_CODE_MAX_CHARS).to_string()),
    }))
}
