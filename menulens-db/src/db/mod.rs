//! Synchronous store operations. Every mutating function opens one
//! transaction and appends the event row(s) describing its state change in
//! that same transaction, which is what keeps event ids contiguous and makes
//! "one event per state change" structurally true.

use crate::models::{
    DbItemStage, DbMenuItem, DbMenuItemImage, DbProcessingProvider, DbSession, DbSessionEvent,
    NewItemStage, NewMenuItem, NewMenuItemImage, NewProcessingProvider, NewSession,
    NewSessionEvent,
};
use crate::store::StoreError;
use crate::types::{
    EventDraft, EventRow, FailureKind, ItemImage, MenuItem, Progress, ProviderInfo,
    ProviderRecord, Session, SessionSnapshot, SessionStatus, Stage, StageCounts, StageFailure,
    StagePayload, StageStatus, StuckStage, session_summary_payload,
};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use hashbrown::HashMap;
use log::debug;
use providers::ProviderAttempt;
use serde_json::json;
use std::collections::BTreeMap;
use strum::IntoEnumIterator;

fn parse_enum<T>(s: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>()
        .map_err(|e| StoreError::Query(diesel::result::Error::DeserializationError(Box::new(e))))
}

fn string_vec(value: Option<serde_json::Value>) -> Result<Option<Vec<String>>, StoreError> {
    value
        .map(|v| {
            serde_json::from_value(v).map_err(|e| {
                StoreError::Query(diesel::result::Error::DeserializationError(Box::new(e)))
            })
        })
        .transpose()
}

fn session_from_db(session: DbSession) -> Result<Session, StoreError> {
    Ok(Session {
        status: parse_enum(&session.status)?,
        session_id: session.session_id,
        total_items: session.total_items,
        metadata: session.metadata,
        created_at: session.created_at.and_utc(),
        updated_at: session.updated_at.and_utc(),
        completed_at: session.completed_at.map(|t| t.and_utc()),
    })
}

fn image_from_db(image: DbMenuItemImage) -> Result<ItemImage, StoreError> {
    Ok(ItemImage {
        stage: parse_enum(&image.stage)?,
        image_url: image.image_url,
        storage_key: image.storage_key,
        prompt: image.prompt,
        provider: image.provider,
        fallback_used: image.fallback_used,
        metadata: image.image_metadata,
        created_at: image.created_at.and_utc(),
    })
}

fn item_from_db(item: DbMenuItem, images: Vec<ItemImage>) -> Result<MenuItem, StoreError> {
    Ok(MenuItem {
        translation_status: parse_enum(&item.translation_status)?,
        description_status: parse_enum(&item.description_status)?,
        image_status: parse_enum(&item.image_status)?,
        allergens: string_vec(item.allergens)?,
        ingredients: string_vec(item.ingredients)?,
        session_id: item.session_id,
        item_id: item.item_id,
        japanese_text: item.japanese_text,
        english_text: item.english_text,
        category: item.category,
        description: item.description,
        images,
        created_at: item.created_at.and_utc(),
        updated_at: item.updated_at.and_utc(),
    })
}

fn event_from_db(event: DbSessionEvent) -> Result<EventRow, StoreError> {
    Ok(EventRow {
        event_type: parse_enum(&event.event_type)?,
        stage: event.stage.as_deref().map(parse_enum).transpose()?,
        event_id: event.event_id,
        session_id: event.session_id,
        item_id: event.item_id,
        payload: event.payload,
        provider: event.provider,
        elapsed_ms: event.elapsed_ms,
        fallback_used: event.fallback_used,
        timestamp: event.occurred_at.and_utc(),
    })
}

/// Bumps the session's event counter and inserts the event row, both inside
/// the caller's transaction. The counter update also serializes concurrent
/// publishers for the session.
fn append_event(
    conn: &mut PgConnection,
    session_id: &str,
    draft: EventDraft,
) -> Result<EventRow, StoreError> {
    use crate::sessions::dsl as sessions_dsl;

    let now = Utc::now();
    let event_id = diesel::update(sessions_dsl::sessions.filter(sessions_dsl::session_id.eq(session_id)))
        .set((
            sessions_dsl::last_event_id.eq(sessions_dsl::last_event_id + 1),
            sessions_dsl::updated_at.eq(now.naive_utc()),
        ))
        .returning(sessions_dsl::last_event_id)
        .get_result::<i64>(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

    let stage_str = draft.stage.map(|s| s.to_string());
    NewSessionEvent {
        session_id,
        event_id,
        item_id: draft.item_id,
        stage: stage_str.as_deref(),
        event_type: &draft.event_type.to_string(),
        payload: &draft.payload,
        provider: draft.provider.as_deref(),
        elapsed_ms: draft.elapsed_ms,
        fallback_used: draft.fallback_used,
        occurred_at: now.naive_utc(),
    }
    .insert_into(crate::session_events::dsl::session_events)
    .execute(conn)?;

    Ok(EventRow {
        event_id,
        session_id: session_id.to_string(),
        item_id: draft.item_id,
        stage: draft.stage,
        event_type: draft.event_type,
        payload: draft.payload,
        provider: draft.provider,
        elapsed_ms: draft.elapsed_ms,
        fallback_used: draft.fallback_used,
        timestamp: now,
    })
}

pub fn create_session(
    conn: &mut PgConnection,
    session_id: &str,
    items: &[String],
    metadata: &serde_json::Value,
) -> Result<(SessionSnapshot, Vec<EventRow>), StoreError> {
    conn.transaction(|conn| {
        let insert_result = NewSession {
            session_id,
            total_items: items.len() as i32,
            status: &SessionStatus::Processing.to_string(),
            metadata,
        }
        .insert_into(crate::sessions::dsl::sessions)
        .execute(conn);

        match insert_result {
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                return Err(StoreError::Conflict(session_id.to_string()));
            }
            other => other?,
        };

        let new_items: Vec<NewMenuItem> = items
            .iter()
            .enumerate()
            .map(|(index, japanese_text)| NewMenuItem {
                session_id,
                item_id: index as i32,
                japanese_text,
            })
            .collect();
        new_items
            .insert_into(crate::menu_items::dsl::menu_items)
            .execute(conn)?;

        let pending = StageStatus::Pending.to_string();
        let pending = pending.as_str();
        let stage_names: Vec<String> = Stage::iter().map(|s| s.to_string()).collect();
        let new_stages: Vec<NewItemStage> = (0..items.len() as i32)
            .flat_map(|item_id| {
                stage_names.iter().map(move |stage| NewItemStage {
                    session_id,
                    item_id,
                    stage: stage.as_str(),
                    status: pending,
                })
            })
            .collect();
        new_stages
            .insert_into(crate::item_stages::dsl::item_stages)
            .execute(conn)?;

        let mut events = Vec::with_capacity(items.len() + 1);
        events.push(append_event(
            conn,
            session_id,
            EventDraft::session_started(items.len() as i32),
        )?);
        for (index, japanese_text) in items.iter().enumerate() {
            events.push(append_event(
                conn,
                session_id,
                EventDraft::item_created(index as i32, japanese_text),
            )?);
        }

        debug!("Created session {session_id} with {} items", items.len());
        let snapshot = get_session_tx(conn, session_id)?;
        Ok((snapshot, events))
    })
}

fn get_session_tx(conn: &mut PgConnection, session_id: &str) -> Result<SessionSnapshot, StoreError> {
    use crate::menu_item_images::dsl as images_dsl;
    use crate::menu_items::dsl as items_dsl;
    use crate::sessions::dsl as sessions_dsl;

    let session: DbSession = sessions_dsl::sessions
        .find(session_id)
        .select(DbSession::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

    let items: Vec<DbMenuItem> = items_dsl::menu_items
        .filter(items_dsl::session_id.eq(session_id))
        .order_by(items_dsl::item_id.asc())
        .select(DbMenuItem::as_select())
        .load(conn)?;

    let images: Vec<DbMenuItemImage> = images_dsl::menu_item_images
        .filter(images_dsl::session_id.eq(session_id))
        .order_by(images_dsl::id.asc())
        .select(DbMenuItemImage::as_select())
        .load(conn)?;

    let mut images_by_item: HashMap<i32, Vec<ItemImage>> = HashMap::new();
    for image in images {
        let item_id = image.item_id;
        images_by_item
            .entry(item_id)
            .or_default()
            .push(image_from_db(image)?);
    }

    let items = items
        .into_iter()
        .map(|item| {
            let images = images_by_item.remove(&item.item_id).unwrap_or_default();
            item_from_db(item, images)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SessionSnapshot {
        session: session_from_db(session)?,
        items,
    })
}

pub fn get_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<SessionSnapshot, StoreError> {
    conn.transaction(|conn| get_session_tx(conn, session_id))
}

pub fn get_item(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
) -> Result<MenuItem, StoreError> {
    use crate::menu_item_images::dsl as images_dsl;
    use crate::menu_items::dsl as items_dsl;

    conn.transaction(|conn| {
        let item: DbMenuItem = items_dsl::menu_items
            .find((session_id, item_id))
            .select(DbMenuItem::as_select())
            .first(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("{session_id}/{item_id}")))?;

        let images = images_dsl::menu_item_images
            .filter(images_dsl::session_id.eq(session_id))
            .filter(images_dsl::item_id.eq(item_id))
            .order_by(images_dsl::id.asc())
            .select(DbMenuItemImage::as_select())
            .load(conn)?
            .into_iter()
            .map(image_from_db)
            .collect::<Result<Vec<_>, _>>()?;

        item_from_db(item, images)
    })
}

fn lock_stage_row(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
) -> Result<DbItemStage, StoreError> {
    use crate::item_stages::dsl as stages_dsl;

    stages_dsl::item_stages
        .find((session_id, item_id, stage.to_string()))
        .select(DbItemStage::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("{session_id}/{item_id}/{stage}")))
}

fn set_stage_status(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
    status: StageStatus,
    failure: Option<&StageFailure>,
) -> Result<(), StoreError> {
    use crate::item_stages::dsl as stages_dsl;

    diesel::update(
        stages_dsl::item_stages.filter(
            stages_dsl::session_id
                .eq(session_id)
                .and(stages_dsl::item_id.eq(item_id))
                .and(stages_dsl::stage.eq(stage.to_string())),
        ),
    )
    .set((
        stages_dsl::status.eq(status.to_string()),
        stages_dsl::error_class.eq(failure.map(|f| f.kind.to_string())),
        stages_dsl::error_message.eq(failure.map(|f| f.message.clone())),
        stages_dsl::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;

    sync_item_status_columns(conn, session_id, item_id, stage, status)
}

/// Maintains the denormalized status columns on `menu_items`. The image
/// column merges the two image stages: failed beats completed beats
/// processing beats pending.
fn sync_item_status_columns(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
    status: StageStatus,
) -> Result<(), StoreError> {
    use crate::item_stages::dsl as stages_dsl;
    use crate::menu_items::dsl as items_dsl;

    let now = Utc::now().naive_utc();
    let item_filter = items_dsl::menu_items.filter(
        items_dsl::session_id
            .eq(session_id)
            .and(items_dsl::item_id.eq(item_id)),
    );

    match stage {
        Stage::Translation => {
            diesel::update(item_filter)
                .set((
                    items_dsl::translation_status.eq(status.to_string()),
                    items_dsl::updated_at.eq(now),
                ))
                .execute(conn)?;
        }
        Stage::Description => {
            diesel::update(item_filter)
                .set((
                    items_dsl::description_status.eq(status.to_string()),
                    items_dsl::updated_at.eq(now),
                ))
                .execute(conn)?;
        }
        Stage::Allergen | Stage::Ingredient => {
            diesel::update(item_filter)
                .set(items_dsl::updated_at.eq(now))
                .execute(conn)?;
        }
        Stage::ImageSearch | Stage::ImageGen => {
            let image_stage_rows: Vec<DbItemStage> = stages_dsl::item_stages
                .filter(
                    stages_dsl::session_id
                        .eq(session_id)
                        .and(stages_dsl::item_id.eq(item_id))
                        .and(stages_dsl::stage.eq_any(vec![
                            Stage::ImageSearch.to_string(),
                            Stage::ImageGen.to_string(),
                        ])),
                )
                .select(DbItemStage::as_select())
                .load(conn)?;

            let statuses = image_stage_rows
                .iter()
                .map(|row| parse_enum::<StageStatus>(&row.status))
                .collect::<Result<Vec<_>, _>>()?;
            let merged = merge_image_statuses(&statuses);
            diesel::update(item_filter)
                .set((
                    items_dsl::image_status.eq(merged.to_string()),
                    items_dsl::updated_at.eq(now),
                ))
                .execute(conn)?;
        }
    }

    Ok(())
}

pub(crate) fn merge_image_statuses(statuses: &[StageStatus]) -> StageStatus {
    if statuses.iter().any(|s| *s == StageStatus::Failed) {
        StageStatus::Failed
    } else if statuses.iter().all(|s| *s == StageStatus::Completed) {
        StageStatus::Completed
    } else if statuses.iter().any(|s| *s == StageStatus::Processing) {
        StageStatus::Processing
    } else {
        StageStatus::Pending
    }
}

pub fn mark_stage_processing(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
) -> Result<Option<EventRow>, StoreError> {
    use crate::item_stages::dsl as stages_dsl;

    conn.transaction(|conn| {
        let row = lock_stage_row(conn, session_id, item_id, stage)?;
        if parse_enum::<StageStatus>(&row.status)? != StageStatus::Pending {
            return Ok(None);
        }

        diesel::update(
            stages_dsl::item_stages.filter(
                stages_dsl::session_id
                    .eq(session_id)
                    .and(stages_dsl::item_id.eq(item_id))
                    .and(stages_dsl::stage.eq(stage.to_string())),
            ),
        )
        .set((
            stages_dsl::status.eq(StageStatus::Processing.to_string()),
            stages_dsl::attempt_count.eq(stages_dsl::attempt_count + 1),
            stages_dsl::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
        sync_item_status_columns(conn, session_id, item_id, stage, StageStatus::Processing)?;

        let event = append_event(
            conn,
            session_id,
            EventDraft::stage_processing(item_id, stage),
        )?;
        Ok(Some(event))
    })
}

fn insert_attempt_rows(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
    attempts: &[ProviderAttempt],
) -> Result<(), StoreError> {
    let stage_str = stage.to_string();
    let rows: Vec<NewProcessingProvider> = attempts
        .iter()
        .map(|attempt| NewProcessingProvider {
            session_id,
            item_id,
            stage: &stage_str,
            provider: &attempt.provider,
            succeeded: attempt.error_kind.is_none(),
            error_class: attempt
                .error_kind
                .map(|kind| FailureKind::from(kind).to_string()),
            error_message: attempt.error_message.as_deref(),
            processing_time_ms: attempt.elapsed_ms,
            fallback_used: attempt.fallback_used,
            provider_metadata: None,
        })
        .collect();

    if !rows.is_empty() {
        rows.insert_into(crate::processing_providers::dsl::processing_providers)
            .execute(conn)?;
    }
    Ok(())
}

fn write_stage_payload(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    payload: &StagePayload,
    info: &ProviderInfo,
) -> Result<(), StoreError> {
    use crate::menu_items::dsl as items_dsl;

    let item_filter = items_dsl::menu_items.filter(
        items_dsl::session_id
            .eq(session_id)
            .and(items_dsl::item_id.eq(item_id)),
    );

    match payload {
        StagePayload::Translation { english, category } => {
            diesel::update(item_filter)
                .set((
                    items_dsl::english_text.eq(english),
                    items_dsl::category.eq(category),
                ))
                .execute(conn)?;
        }
        StagePayload::Description { description } => {
            diesel::update(item_filter)
                .set(items_dsl::description.eq(description))
                .execute(conn)?;
        }
        StagePayload::Allergens { allergens } => {
            diesel::update(item_filter)
                .set(items_dsl::allergens.eq(json!(allergens)))
                .execute(conn)?;
        }
        StagePayload::Ingredients { ingredients } => {
            diesel::update(item_filter)
                .set(items_dsl::ingredients.eq(json!(ingredients)))
                .execute(conn)?;
        }
        StagePayload::ImageSearch { images } => {
            insert_image_rows(conn, session_id, item_id, Stage::ImageSearch, images, info)?;
        }
        StagePayload::ImageGen { image } => {
            insert_image_rows(
                conn,
                session_id,
                item_id,
                Stage::ImageGen,
                std::slice::from_ref(image),
                info,
            )?;
        }
    }
    Ok(())
}

fn insert_image_rows(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
    images: &[crate::types::ImageRecord],
    info: &ProviderInfo,
) -> Result<(), StoreError> {
    let stage_str = stage.to_string();
    let rows: Vec<NewMenuItemImage> = images
        .iter()
        .map(|image| NewMenuItemImage {
            session_id,
            item_id,
            stage: &stage_str,
            image_url: &image.image_url,
            storage_key: image.storage_key.as_deref(),
            prompt: image.prompt.as_deref(),
            provider: &info.provider,
            fallback_used: info.fallback_used,
            image_metadata: image.metadata.as_ref(),
        })
        .collect();

    if !rows.is_empty() {
        rows.insert_into(crate::menu_item_images::dsl::menu_item_images)
            .execute(conn)?;
    }
    Ok(())
}

pub fn record_stage_success(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
    payload: &StagePayload,
    info: &ProviderInfo,
) -> Result<Option<EventRow>, StoreError> {
    conn.transaction(|conn| {
        let row = lock_stage_row(conn, session_id, item_id, stage)?;
        // The audit trail records every attempt, replays included.
        insert_attempt_rows(conn, session_id, item_id, stage, &info.attempts)?;

        if parse_enum::<StageStatus>(&row.status)?.is_terminal() {
            debug!("Ignoring duplicate result for {session_id}/{item_id}/{stage}");
            return Ok(None);
        }

        write_stage_payload(conn, session_id, item_id, payload, info)?;
        set_stage_status(conn, session_id, item_id, stage, StageStatus::Completed, None)?;

        let event = append_event(
            conn,
            session_id,
            EventDraft::stage_completed(item_id, stage, payload.event_payload(), info),
        )?;
        Ok(Some(event))
    })
}

pub fn record_stage_failure(
    conn: &mut PgConnection,
    session_id: &str,
    item_id: i32,
    stage: Stage,
    failure: &StageFailure,
    info: &ProviderInfo,
) -> Result<Option<EventRow>, StoreError> {
    conn.transaction(|conn| {
        let row = lock_stage_row(conn, session_id, item_id, stage)?;
        insert_attempt_rows(conn, session_id, item_id, stage, &info.attempts)?;

        // Terminal states are sticky; a late failure report can't undo a
        // recorded success.
        if parse_enum::<StageStatus>(&row.status)?.is_terminal() {
            debug!("Ignoring late failure for {session_id}/{item_id}/{stage}");
            return Ok(None);
        }

        set_stage_status(
            conn,
            session_id,
            item_id,
            stage,
            StageStatus::Failed,
            Some(failure),
        )?;

        let event = append_event(
            conn,
            session_id,
            EventDraft::stage_failed(item_id, stage, failure, info),
        )?;
        Ok(Some(event))
    })
}

pub fn get_progress(conn: &mut PgConnection, session_id: &str) -> Result<Progress, StoreError> {
    use crate::item_stages::dsl as stages_dsl;
    use crate::sessions::dsl as sessions_dsl;

    conn.transaction(|conn| {
        let total: i32 = sessions_dsl::sessions
            .find(session_id)
            .select(sessions_dsl::total_items)
            .first(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let rows: Vec<DbItemStage> = stages_dsl::item_stages
            .filter(stages_dsl::session_id.eq(session_id))
            .select(DbItemStage::as_select())
            .load(conn)?;

        let mut per_stage_counts: BTreeMap<Stage, StageCounts> = BTreeMap::new();
        let mut terminal_by_item: HashMap<i32, bool> = HashMap::new();
        let mut terminal_stages = 0usize;

        for row in &rows {
            let stage: Stage = parse_enum(&row.stage)?;
            let status: StageStatus = parse_enum(&row.status)?;
            per_stage_counts.entry(stage).or_default().add(status);
            let entry = terminal_by_item.entry(row.item_id).or_insert(true);
            *entry = *entry && status.is_terminal();
            if status.is_terminal() {
                terminal_stages += 1;
            }
        }

        let fully_completed = terminal_by_item.values().filter(|t| **t).count() as i64;
        let percentage = if rows.is_empty() {
            0.0
        } else {
            terminal_stages as f64 / rows.len() as f64 * 100.0
        };

        Ok(Progress {
            total: total as i64,
            per_stage_counts,
            fully_completed,
            percentage,
        })
    })
}

pub fn search_items(
    conn: &mut PgConnection,
    query: &str,
    category: Option<&str>,
    limit: i64,
) -> Result<Vec<MenuItem>, StoreError> {
    use crate::menu_item_images::dsl as images_dsl;
    use crate::menu_items::dsl as items_dsl;

    conn.transaction(|conn| {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));

        let mut item_query = items_dsl::menu_items
            .filter(
                items_dsl::japanese_text
                    .ilike(pattern.clone())
                    .nullable()
                    .or(items_dsl::english_text.ilike(pattern)),
            )
            .select(DbMenuItem::as_select())
            .into_boxed();
        if let Some(category) = category {
            item_query = item_query.filter(items_dsl::category.eq(category.to_string()));
        }

        let items: Vec<DbMenuItem> = item_query
            .order_by(items_dsl::updated_at.desc())
            .limit(limit)
            .load(conn)?;

        let session_ids: Vec<String> = items.iter().map(|i| i.session_id.clone()).collect();
        let images: Vec<DbMenuItemImage> = images_dsl::menu_item_images
            .filter(images_dsl::session_id.eq_any(&session_ids))
            .order_by(images_dsl::id.asc())
            .select(DbMenuItemImage::as_select())
            .load(conn)?;

        let mut images_by_item: HashMap<(String, i32), Vec<ItemImage>> = HashMap::new();
        for image in images {
            let key = (image.session_id.clone(), image.item_id);
            images_by_item
                .entry(key)
                .or_default()
                .push(image_from_db(image)?);
        }

        items
            .into_iter()
            .map(|item| {
                let key = (item.session_id.clone(), item.item_id);
                let images = images_by_item.remove(&key).unwrap_or_default();
                item_from_db(item, images)
            })
            .collect()
    })
}

fn load_stage_statuses(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<Vec<(i32, Stage, StageStatus)>, StoreError> {
    use crate::item_stages::dsl as stages_dsl;

    let rows: Vec<DbItemStage> = stages_dsl::item_stages
        .filter(stages_dsl::session_id.eq(session_id))
        .select(DbItemStage::as_select())
        .load(conn)?;

    rows.iter()
        .map(|row| {
            Ok((
                row.item_id,
                parse_enum::<Stage>(&row.stage)?,
                parse_enum::<StageStatus>(&row.status)?,
            ))
        })
        .collect()
}

pub fn complete_session_if_done(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<Option<EventRow>, StoreError> {
    use crate::sessions::dsl as sessions_dsl;

    conn.transaction(|conn| {
        let session: DbSession = sessions_dsl::sessions
            .find(session_id)
            .select(DbSession::as_select())
            .for_update()
            .first(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        if parse_enum::<SessionStatus>(&session.status)? != SessionStatus::Processing {
            return Ok(None);
        }

        let statuses = load_stage_statuses(conn, session_id)?;
        if statuses.iter().any(|(_, _, status)| !status.is_terminal()) {
            return Ok(None);
        }

        let now = Utc::now().naive_utc();
        diesel::update(sessions_dsl::sessions.filter(sessions_dsl::session_id.eq(session_id)))
            .set((
                sessions_dsl::status.eq(SessionStatus::Completed.to_string()),
                sessions_dsl::completed_at.eq(now),
                sessions_dsl::updated_at.eq(now),
            ))
            .execute(conn)?;

        let payload =
            session_summary_payload(SessionStatus::Completed, session.total_items, &statuses);
        let event = append_event(conn, session_id, EventDraft::session_completed(payload))?;
        Ok(Some(event))
    })
}

pub fn cancel_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<EventRow, StoreError> {
    use crate::sessions::dsl as sessions_dsl;

    conn.transaction(|conn| {
        let session: DbSession = sessions_dsl::sessions
            .find(session_id)
            .select(DbSession::as_select())
            .for_update()
            .first(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        if parse_enum::<SessionStatus>(&session.status)?.is_terminal() {
            return Err(StoreError::AlreadyTerminal(session_id.to_string()));
        }

        let now = Utc::now().naive_utc();
        diesel::update(sessions_dsl::sessions.filter(sessions_dsl::session_id.eq(session_id)))
            .set((
                sessions_dsl::status.eq(SessionStatus::Failed.to_string()),
                sessions_dsl::completed_at.eq(now),
                sessions_dsl::updated_at.eq(now),
            ))
            .execute(conn)?;

        let statuses = load_stage_statuses(conn, session_id)?;
        let payload = session_summary_payload(SessionStatus::Failed, session.total_items, &statuses);
        append_event(conn, session_id, EventDraft::session_completed(payload))
    })
}

pub fn events_after(
    conn: &mut PgConnection,
    session_id: &str,
    after_event_id: i64,
) -> Result<Vec<EventRow>, StoreError> {
    use crate::session_events::dsl as events_dsl;
    use crate::sessions::dsl as sessions_dsl;

    conn.transaction(|conn| {
        let exists: Option<String> = sessions_dsl::sessions
            .find(session_id)
            .select(sessions_dsl::session_id)
            .first(conn)
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(session_id.to_string()));
        }

        events_dsl::session_events
            .filter(
                events_dsl::session_id
                    .eq(session_id)
                    .and(events_dsl::event_id.gt(after_event_id)),
            )
            .order_by(events_dsl::event_id.asc())
            .select(DbSessionEvent::as_select())
            .load(conn)?
            .into_iter()
            .map(event_from_db)
            .collect()
    })
}

pub fn provider_records(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<Vec<ProviderRecord>, StoreError> {
    use crate::processing_providers::dsl as providers_dsl;

    let rows: Vec<DbProcessingProvider> = providers_dsl::processing_providers
        .filter(providers_dsl::session_id.eq(session_id))
        .order_by(providers_dsl::id.asc())
        .select(DbProcessingProvider::as_select())
        .load(conn)?;

    rows.into_iter()
        .map(|row| {
            Ok(ProviderRecord {
                stage: parse_enum(&row.stage)?,
                item_id: row.item_id,
                provider: row.provider,
                succeeded: row.succeeded,
                error_class: row.error_class,
                error_message: row.error_message,
                processed_at: row.processed_at.and_utc(),
                processing_time_ms: row.processing_time_ms,
                fallback_used: row.fallback_used,
            })
        })
        .collect()
}

pub fn stuck_stages(
    conn: &mut PgConnection,
    stage: Stage,
    cutoff: NaiveDateTime,
) -> Result<Vec<StuckStage>, StoreError> {
    use crate::item_stages::dsl as stages_dsl;

    let rows: Vec<DbItemStage> = stages_dsl::item_stages
        .filter(
            stages_dsl::stage
                .eq(stage.to_string())
                .and(stages_dsl::status.eq(StageStatus::Processing.to_string()))
                .and(stages_dsl::updated_at.lt(cutoff)),
        )
        .select(DbItemStage::as_select())
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|row| StuckStage {
            session_id: row.session_id,
            item_id: row.item_id,
            stage,
        })
        .collect())
}

pub fn prune_events(
    conn: &mut PgConnection,
    terminal_before: NaiveDateTime,
) -> Result<usize, StoreError> {
    use crate::session_events::dsl as events_dsl;
    use crate::sessions::dsl as sessions_dsl;

    let expired_sessions: Vec<String> = sessions_dsl::sessions
        .filter(
            sessions_dsl::status
                .ne(SessionStatus::Processing.to_string())
                .and(sessions_dsl::completed_at.lt(terminal_before)),
        )
        .select(sessions_dsl::session_id)
        .load(conn)?;

    if expired_sessions.is_empty() {
        return Ok(0);
    }

    let deleted = diesel::delete(
        events_dsl::session_events.filter(events_dsl::session_id.eq_any(&expired_sessions)),
    )
    .execute(conn)?;
    Ok(deleted)
}
