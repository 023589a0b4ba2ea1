//! Whole-entry merge of two journal documents
//!
//! Collections keyed by id (classes, students, todos, subjects, templates)
//! are unioned by id; date-keyed daily records are unioned by date. When
//! both sides hold the same key, the side with the later implicit timestamp
//! wins the entire entry. Fields are never merged inside an entry.
//!
//! The local timestamp is the document's own `updatedAt`, falling back to
//! the last-synced watermark. Remote wins ties.
//!
//! A union cannot tell "deleted on one side" from "added on the other", so
//! an entry deleted locally but still present remotely comes back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use crate::document::{
    ClassData, ClassInfo, DailyRecord, Document, Student, Subject, TimetableTemplate, TodoItem,
};

/// What a merge did, for notices and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Colliding entries were taken from the local side.
    pub local_wins: bool,
    /// Entries that only existed remotely.
    pub added_from_remote: usize,
    /// Colliding entries that differed between the two sides.
    pub conflicting_entries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub document: Document,
    pub report: MergeReport,
}

trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

macro_rules! keyed_by_id {
    ($($ty:ty),*) => {
        $(impl Keyed for $ty {
            type Key = String;

            fn key(&self) -> String {
                self.id.clone()
            }
        })*
    };
}

keyed_by_id!(ClassInfo, Student, TodoItem, Subject, TimetableTemplate);

impl Keyed for DailyRecord {
    type Key = String;

    fn key(&self) -> String {
        self.date.clone()
    }
}

/// Merge `local` and `remote` into one document. Deterministic in its
/// inputs.
pub fn merge_documents(
    local: &Document,
    remote: &Document,
    local_last_synced_at: Option<DateTime<Utc>>,
    remote_updated_at: DateTime<Utc>,
) -> MergeOutcome {
    let local_time = local.updated_at.or(local_last_synced_at);
    let prefer_local = local_time.is_some_and(|t| t > remote_updated_at);

    let mut report = MergeReport {
        local_wins: prefer_local,
        ..MergeReport::default()
    };

    let classes = union_by_key(&local.classes, &remote.classes, prefer_local, &mut report);

    let class_ids: BTreeSet<&String> = local.class_data.keys().chain(remote.class_data.keys()).collect();
    let class_data = class_ids
        .into_iter()
        .map(|id| {
            let data = match (local.class_data.get(id), remote.class_data.get(id)) {
                (Some(l), Some(r)) => merge_class_data(l, r, prefer_local, &mut report),
                (Some(l), None) => l.clone(),
                (None, Some(r)) => {
                    report.added_from_remote += r.students.len() + r.records.len() + r.todos.len();
                    r.clone()
                }
                (None, None) => ClassData::default(),
            };
            (id.clone(), data)
        })
        .collect();

    let templates = union_by_key(&local.templates, &remote.templates, prefer_local, &mut report);
    let subjects = union_by_key(&local.subjects, &remote.subjects, prefer_local, &mut report);

    let class_exists = |id: &Option<String>| {
        id.as_ref()
            .filter(|id| classes.iter().any(|c: &ClassInfo| &c.id == *id))
            .cloned()
    };
    let active_class_id = class_exists(&local.active_class_id)
        .or_else(|| class_exists(&remote.active_class_id))
        .or_else(|| classes.first().map(|c| c.id.clone()));

    let document = Document {
        schema_version: local.schema_version.max(remote.schema_version),
        classes,
        class_data,
        templates,
        subjects,
        active_class_id,
        updated_at: local.updated_at.max(remote.updated_at),
    };

    MergeOutcome { document, report }
}

fn merge_class_data(
    local: &ClassData,
    remote: &ClassData,
    prefer_local: bool,
    report: &mut MergeReport,
) -> ClassData {
    let mut records = union_by_key(&local.records, &remote.records, prefer_local, report);
    records.sort_by(|a, b| a.date.cmp(&b.date));

    ClassData {
        students: union_by_key(&local.students, &remote.students, prefer_local, report),
        records,
        todos: union_by_key(&local.todos, &remote.todos, prefer_local, report),
    }
}

/// Local entries in local order (colliding ones replaced by the winner),
/// followed by remote-only entries in remote order. Duplicate keys within
/// one side keep their first occurrence.
fn union_by_key<T>(local: &[T], remote: &[T], prefer_local: bool, report: &mut MergeReport) -> Vec<T>
where
    T: Keyed + Clone + PartialEq,
{
    let mut remote_by_key: HashMap<T::Key, &T> = HashMap::with_capacity(remote.len());
    for item in remote {
        remote_by_key.entry(item.key()).or_insert(item);
    }

    let mut seen = std::collections::HashSet::with_capacity(local.len() + remote.len());
    let mut merged = Vec::with_capacity(local.len() + remote.len());

    for item in local {
        let key = item.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        match remote_by_key.get(&key) {
            Some(theirs) if *theirs != item => {
                report.conflicting_entries += 1;
                merged.push(if prefer_local { item.clone() } else { (*theirs).clone() });
            }
            _ => merged.push(item.clone()),
        }
    }

    for item in remote {
        if seen.insert(item.key()) {
            report.added_from_remote += 1;
            merged.push(item.clone());
        }
    }

    merged
}
