//! The journal document: everything a teacher records, as one value
//!
//! Serialized with camelCase field names so blobs written by older clients
//! decode unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 2;

/// Name given to the class created when migrating single-class data.
pub const DEFAULT_CLASS_NAME: &str = "My Class";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub classes: Vec<ClassInfo>,
    #[serde(default)]
    pub class_data: BTreeMap<String, ClassData>,
    #[serde(default)]
    pub templates: Vec<TimetableTemplate>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_class_id: Option<String>,
    /// Time of the last local mutation. Stamped by the local store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn current_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for Document {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            classes: Vec::new(),
            class_data: BTreeMap::new(),
            templates: Vec::new(),
            subjects: Vec::new(),
            active_class_id: None,
            updated_at: None,
        }
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the document holds no user data at all.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
            && self.templates.is_empty()
            && self.subjects.is_empty()
            && self.class_data.values().all(ClassData::is_empty)
    }

    pub fn class(&self, class_id: &str) -> Option<&ClassInfo> {
        self.classes.iter().find(|c| c.id == class_id)
    }

    pub fn class_data(&self, class_id: &str) -> Option<&ClassData> {
        self.class_data.get(class_id)
    }

    /// Per-class data, created empty on first access.
    pub fn class_data_mut(&mut self, class_id: &str) -> &mut ClassData {
        self.class_data.entry(class_id.to_string()).or_default()
    }

    /// Create a class at the end of the ordering and return its id.
    pub fn add_class(&mut self, name: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let order = u32::try_from(self.classes.len()).unwrap_or(u32::MAX);
        self.classes.push(ClassInfo {
            id: id.clone(),
            name: name.into(),
            order,
            timetable: None,
        });
        self.class_data.insert(id.clone(), ClassData::default());
        if self.active_class_id.is_none() {
            self.active_class_id = Some(id.clone());
        }
        id
    }

    /// Remove a class together with its data. Returns false if absent.
    pub fn delete_class(&mut self, class_id: &str) -> bool {
        let before = self.classes.len();
        self.classes.retain(|c| c.id != class_id);
        self.class_data.remove(class_id);

        if self.active_class_id.as_deref() == Some(class_id) {
            self.active_class_id = self.classes.first().map(|c| c.id.clone());
        }

        self.classes.len() != before
    }

    /// Insert or replace the record for `record.date` in a class.
    pub fn upsert_record(&mut self, class_id: &str, record: DailyRecord) {
        let data = self.class_data_mut(class_id);
        match data.records.iter_mut().find(|r| r.date == record.date) {
            Some(existing) => *existing = record,
            None => data.records.push(record),
        }
    }

    pub fn record(&self, class_id: &str, date: &str) -> Option<&DailyRecord> {
        self.class_data(class_id)?
            .records
            .iter()
            .find(|r| r.date == date)
    }

    /// Short summary of the document's size for logs and status output.
    pub fn summary(&self) -> DocumentSummary {
        let mut summary = DocumentSummary {
            classes: self.classes.len(),
            ..DocumentSummary::default()
        };
        for data in self.class_data.values() {
            summary.students += data.students.len();
            summary.records += data.records.len();
            summary.todos += data.todos.len();
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub classes: usize,
    pub students: usize,
    pub records: usize,
    pub todos: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timetable: Option<Timetable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassData {
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(default)]
    pub records: Vec<DailyRecord>,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
}

impl ClassData {
    pub fn is_empty(&self) -> bool {
        self.students.is_empty() && self.records.is_empty() && self.todos.is_empty()
    }
}

/// Weekday (0 = Monday .. 4 = Friday) to period (1..=7) to cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timetable {
    #[serde(default)]
    pub days: BTreeMap<u8, BTreeMap<u8, TimetableCell>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableCell {
    pub subject: String,
    /// "HH:mm"
    pub start_time: String,
    /// "HH:mm"
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableTemplate {
    pub id: String,
    pub name: String,
    pub data: Timetable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRecord {
    /// ISO date, `YYYY-MM-DD`
    pub date: String,
    #[serde(default)]
    pub weather: Weather,
    #[serde(default)]
    pub atmosphere: Atmosphere,
    #[serde(default)]
    pub attendance: Vec<AttendanceEntry>,
    #[serde(default)]
    pub lesson_logs: Vec<LessonLog>,
    /// Markdown
    #[serde(default)]
    pub class_log: String,
    /// Student id to note
    #[serde(default)]
    pub student_notes: BTreeMap<String, String>,
}

impl DailyRecord {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            weather: Weather::default(),
            atmosphere: Atmosphere::default(),
            attendance: Vec::new(),
            lesson_logs: Vec::new(),
            class_log: String::new(),
            student_notes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    pub student_id: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    #[serde(rename = "Early Leave")]
    EarlyLeave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonLog {
    pub period: u8,
    pub subject: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weather {
    #[default]
    Sunny,
    Cloudy,
    Rainy,
    Snowy,
    Windy,
    Stormy,
    Foggy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atmosphere {
    #[default]
    Calm,
    Energetic,
    Distracted,
    Tired,
    Passionate,
    Harmonious,
    Tense,
    Joyful,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_camel_case_record() {
        let json = r#"{
            "date": "2024-03-04",
            "weather": "Rainy",
            "atmosphere": "Joyful",
            "attendance": [{"studentId": "s1", "status": "Early Leave"}],
            "lessonLogs": [{"period": 2, "subject": "Math", "content": "fractions"}],
            "classLog": "x",
            "studentNotes": {"s1": "left at noon"}
        }"#;

        let record: DailyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.weather, Weather::Rainy);
        assert_eq!(record.attendance[0].status, AttendanceStatus::EarlyLeave);
        assert_eq!(record.lesson_logs[0].period, 2);
        assert_eq!(record.student_notes.get("s1").unwrap(), "left at noon");
    }

    #[test]
    fn test_timetable_uses_numeric_keys() {
        let json = r#"{"days": {"0": {"1": {"subject": "Art", "startTime": "09:00", "endTime": "09:40"}}}}"#;
        let timetable: Timetable = serde_json::from_str(json).unwrap();
        assert_eq!(timetable.days[&0][&1].subject, "Art");

        let encoded = serde_json::to_string(&timetable).unwrap();
        assert!(encoded.contains("\"startTime\":\"09:00\""));
    }

    #[test]
    fn test_missing_fields_default() {
        let doc: Document = serde_json::from_str("{}").unwrap();
        assert_eq!(doc.schema_version, SCHEMA_VERSION);
        assert!(doc.is_empty());
        assert!(doc.updated_at.is_none());
    }

    #[test]
    fn test_add_and_delete_class() {
        let mut doc = Document::new();
        let first = doc.add_class("1-1");
        let second = doc.add_class("1-2");

        assert_eq!(doc.active_class_id.as_deref(), Some(first.as_str()));
        assert_eq!(doc.class(&second).unwrap().order, 1);

        assert!(doc.delete_class(&first));
        assert!(doc.class_data(&first).is_none());
        assert_eq!(doc.active_class_id.as_deref(), Some(second.as_str()));
        assert!(!doc.delete_class(&first));
    }

    #[test]
    fn test_upsert_record_replaces_same_date() {
        let mut doc = Document::new();
        let class_id = doc.add_class("1-1");

        let mut record = DailyRecord::new("2024-03-04");
        record.class_log = "first".into();
        doc.upsert_record(&class_id, record.clone());

        record.class_log = "second".into();
        doc.upsert_record(&class_id, record);

        assert_eq!(doc.class_data(&class_id).unwrap().records.len(), 1);
        assert_eq!(doc.record(&class_id, "2024-03-04").unwrap().class_log, "second");
        assert_eq!(doc.summary().records, 1);
    }
}
