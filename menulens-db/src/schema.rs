diesel::table! {
    sessions (session_id) {
        session_id -> Text,
        total_items -> Int4,
        status -> Text,
        last_event_id -> Int8,
        metadata -> Jsonb,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    menu_items (session_id, item_id) {
        session_id -> Text,
        item_id -> Int4,
        japanese_text -> Text,
        english_text -> Nullable<Text>,
        category -> Nullable<Text>,
        description -> Nullable<Text>,
        allergens -> Nullable<Jsonb>,
        ingredients -> Nullable<Jsonb>,
        translation_status -> Text,
        description_status -> Text,
        image_status -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    item_stages (session_id, item_id, stage) {
        session_id -> Text,
        item_id -> Int4,
        stage -> Text,
        status -> Text,
        error_class -> Nullable<Text>,
        error_message -> Nullable<Text>,
        attempt_count -> Int4,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    processing_providers (id) {
        id -> Int8,
        session_id -> Text,
        item_id -> Int4,
        stage -> Text,
        provider -> Text,
        succeeded -> Bool,
        error_class -> Nullable<Text>,
        error_message -> Nullable<Text>,
        processed_at -> Timestamp,
        processing_time_ms -> Int8,
        fallback_used -> Bool,
        provider_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    menu_item_images (id) {
        id -> Int8,
        session_id -> Text,
        item_id -> Int4,
        stage -> Text,
        image_url -> Text,
        storage_key -> Nullable<Text>,
        prompt -> Nullable<Text>,
        provider -> Text,
        fallback_used -> Bool,
        image_metadata -> Nullable<Jsonb>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    session_events (session_id, event_id) {
        session_id -> Text,
        event_id -> Int8,
        item_id -> Nullable<Int4>,
        stage -> Nullable<Text>,
        event_type -> Text,
        payload -> Jsonb,
        provider -> Nullable<Text>,
        elapsed_ms -> Nullable<Int8>,
        fallback_used -> Nullable<Bool>,
        occurred_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    sessions,
    menu_items,
    item_stages,
    processing_providers,
    menu_item_images,
    session_events,
);
