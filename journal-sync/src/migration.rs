//! One-time migration from the flat single-class layout
//!
//! Older versions kept students, daily records and todos in three separate
//! keys with no notion of classes. Migration folds them into one default
//! class inside the versioned document. It is idempotent: once the document
//! key exists and no earlier attempt failed it does nothing. Legacy keys
//! are never modified.

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::document::{ClassData, ClassInfo, DailyRecord, Document, Student, TodoItem, DEFAULT_CLASS_NAME};
use crate::error::{SyncError, SyncResult};
use crate::local_store::keys;
use crate::storage::KeyValueStore;

/// Result of [`run_migration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The versioned document already exists.
    AlreadyCurrent,
    /// No legacy keys were found.
    NothingToMigrate,
    Migrated {
        students: usize,
        records: usize,
        todos: usize,
    },
}

/// Migrate legacy data into the versioned document if needed.
///
/// Malformed legacy JSON yields [`SyncError::Migration`], writes nothing to
/// the document and leaves a pending marker behind. While the marker is set
/// the migration is retried on every run, folding the legacy class into the
/// document even if the document was created in the meantime.
pub async fn run_migration(storage: &dyn KeyValueStore) -> SyncResult<MigrationOutcome> {
    let existing = storage.get(keys::DOCUMENT).await?;
    let pending = storage.get(keys::MIGRATION_PENDING).await?.is_some();
    if existing.is_some() && !pending {
        return Ok(MigrationOutcome::AlreadyCurrent);
    }

    let data = match read_legacy_class(storage).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            if pending {
                storage.remove(keys::MIGRATION_PENDING).await?;
            }
            return Ok(MigrationOutcome::NothingToMigrate);
        }
        Err(e) => {
            storage.set(keys::MIGRATION_PENDING, &e.to_string()).await?;
            return Err(e);
        }
    };

    let outcome = MigrationOutcome::Migrated {
        students: data.students.len(),
        records: data.records.len(),
        todos: data.todos.len(),
    };

    let mut document = match &existing {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| SyncError::Deserialization(format!("local document: {e}")))?,
        None => Document::default(),
    };

    let class_id = uuid::Uuid::new_v4().to_string();
    document.classes.push(ClassInfo {
        id: class_id.clone(),
        name: DEFAULT_CLASS_NAME.to_string(),
        order: u32::try_from(document.classes.len()).unwrap_or(u32::MAX),
        timetable: None,
    });
    document.class_data.insert(class_id.clone(), data);
    if document.active_class_id.is_none() {
        document.active_class_id = Some(class_id);
    }
    if existing.is_some() {
        // a late fold is a local edit that still has to be uploaded
        document.updated_at = Some(Utc::now());
    }

    let raw = serde_json::to_string(&document)?;
    storage.set(keys::DOCUMENT, &raw).await?;
    if pending {
        storage.remove(keys::MIGRATION_PENDING).await?;
    }

    tracing::info!(?outcome, retried = pending, "Migrated legacy journal data");
    Ok(outcome)
}

/// The legacy keys as one class, or `None` when none of them exist.
async fn read_legacy_class(storage: &dyn KeyValueStore) -> SyncResult<Option<ClassData>> {
    let students: Option<Vec<Student>> = read_legacy(storage, keys::LEGACY_STUDENTS).await?;
    let records: Option<Vec<DailyRecord>> = read_legacy(storage, keys::LEGACY_RECORDS).await?;
    let todos: Option<Vec<TodoItem>> = read_legacy(storage, keys::LEGACY_TODOS).await?;

    if students.is_none() && records.is_none() && todos.is_none() {
        return Ok(None);
    }

    Ok(Some(ClassData {
        students: students.unwrap_or_default(),
        records: records.unwrap_or_default(),
        todos: todos.unwrap_or_default(),
    }))
}

async fn read_legacy<T: DeserializeOwned>(
    storage: &dyn KeyValueStore,
    key: &str,
) -> SyncResult<Option<T>> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };

    serde_json::from_str(&raw).map(Some).map_err(|e| {
        tracing::warn!(key, error = %e, "Legacy data is malformed, leaving it untouched");
        SyncError::Migration(format!("{key}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const STUDENTS: &str = r#"[{"id":"s1","name":"Kim","number":1,"notes":[]}]"#;
    const RECORDS: &str = r#"[{"date":"2024-03-04","weather":"Sunny","atmosphere":"Calm",
        "attendance":[],"lessonLogs":[],"classLog":"x","studentNotes":{}}]"#;

    #[tokio::test]
    async fn test_migrates_into_default_class() {
        let storage = MemoryStorage::with_entries([
            (keys::LEGACY_STUDENTS, STUDENTS),
            (keys::LEGACY_RECORDS, RECORDS),
        ]);

        let outcome = run_migration(&storage).await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                students: 1,
                records: 1,
                todos: 0
            }
        );

        let raw = storage.get(keys::DOCUMENT).await.unwrap().unwrap();
        let doc: Document = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc.classes.len(), 1);
        assert_eq!(doc.classes[0].name, DEFAULT_CLASS_NAME);

        let class_id = doc.active_class_id.clone().unwrap();
        assert_eq!(doc.record(&class_id, "2024-03-04").unwrap().class_log, "x");

        // legacy keys stay in place
        assert!(storage.get(keys::LEGACY_STUDENTS).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let storage = MemoryStorage::with_entries([(keys::LEGACY_STUDENTS, STUDENTS)]);

        run_migration(&storage).await.unwrap();
        let first = storage.get(keys::DOCUMENT).await.unwrap();

        assert_eq!(
            run_migration(&storage).await.unwrap(),
            MigrationOutcome::AlreadyCurrent
        );
        assert_eq!(storage.get(keys::DOCUMENT).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_fresh_install_has_nothing_to_migrate() {
        let storage = MemoryStorage::new();
        assert_eq!(
            run_migration(&storage).await.unwrap(),
            MigrationOutcome::NothingToMigrate
        );
        assert!(storage.get(keys::DOCUMENT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_legacy_data_is_left_untouched() {
        let storage = MemoryStorage::with_entries([
            (keys::LEGACY_STUDENTS, STUDENTS),
            (keys::LEGACY_TODOS, "[{broken"),
        ]);

        let result = run_migration(&storage).await;
        assert!(matches!(result, Err(SyncError::Migration(_))));

        assert!(storage.get(keys::DOCUMENT).await.unwrap().is_none());
        assert_eq!(
            storage.get(keys::LEGACY_TODOS).await.unwrap().as_deref(),
            Some("[{broken")
        );
        assert_eq!(
            storage.get(keys::LEGACY_STUDENTS).await.unwrap().as_deref(),
            Some(STUDENTS)
        );
    }

    #[tokio::test]
    async fn test_failed_migration_is_retried_after_local_edits() {
        let storage = MemoryStorage::with_entries([
            (keys::LEGACY_STUDENTS, STUDENTS),
            (keys::LEGACY_TODOS, "[{broken"),
        ]);

        assert!(run_migration(&storage).await.is_err());
        assert!(storage.get(keys::MIGRATION_PENDING).await.unwrap().is_some());

        // the user starts over before the legacy data is repaired
        let mut edited = Document::new();
        edited.add_class("2-3");
        storage
            .set(keys::DOCUMENT, &serde_json::to_string(&edited).unwrap())
            .await
            .unwrap();
        assert!(run_migration(&storage).await.is_err());

        storage.set(keys::LEGACY_TODOS, "[]").await.unwrap();
        assert_eq!(
            run_migration(&storage).await.unwrap(),
            MigrationOutcome::Migrated {
                students: 1,
                records: 0,
                todos: 0
            }
        );

        let raw = storage.get(keys::DOCUMENT).await.unwrap().unwrap();
        let doc: Document = serde_json::from_str(&raw).unwrap();
        let names: Vec<&str> = doc.classes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["2-3", DEFAULT_CLASS_NAME]);
        assert!(doc.updated_at.is_some());
        assert!(storage.get(keys::MIGRATION_PENDING).await.unwrap().is_none());

        assert_eq!(
            run_migration(&storage).await.unwrap(),
            MigrationOutcome::AlreadyCurrent
        );
    }
}
