//! Document records: the closed set of record kinds shared by the local
//! store, the CRDT replica and the presence layer.
//!
//! Every record carries a `typeName` discriminator on the wire and an id of
//! the form `<typeName>:<suffix>`. Only document-scoped records (shapes,
//! pages, the document singleton) are replicated and persisted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Separator between the type prefix and the unique suffix of a record id.
pub const ID_SEPARATOR: char = ':';

/// Record validation and decoding errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("invalid record id '{0}'")]
    InvalidId(String),
    #[error("record id '{id}' does not match type '{expected}'")]
    KindMismatch { id: String, expected: &'static str },
    #[error("record json error: {0}")]
    Json(String),
}

/// Record identifier, e.g. `shape:1` or `page:page`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Build an id from a kind and a suffix.
    pub fn new(kind: RecordKind, suffix: impl fmt::Display) -> Self {
        Self(format!("{}{ID_SEPARATOR}{suffix}", kind.type_name()))
    }

    /// Parse a raw id, checking that it has a known type prefix and a suffix.
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        let id = Self(raw.to_string());
        match id.split() {
            Some((prefix, suffix)) if !suffix.is_empty() && RecordKind::from_type_name(prefix).is_some() => {
                Ok(id)
            }
            _ => Err(RecordError::InvalidId(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type prefix (`shape` for `shape:1`).
    pub fn type_prefix(&self) -> Option<&str> {
        self.split().map(|(prefix, _)| prefix)
    }

    /// The kind named by the prefix, if it is a known one.
    pub fn kind(&self) -> Option<RecordKind> {
        self.type_prefix().and_then(RecordKind::from_type_name)
    }

    fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once(ID_SEPARATOR)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which layer a record kind lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordScope {
    /// Replicated through the CRDT and persisted with the room snapshot.
    Document,
    /// Local to one editing session (camera, pointer, selection state).
    Session,
    /// Ephemeral peer state materialized from awareness; never replicated.
    Presence,
}

/// Record kinds, one per `typeName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Shape,
    Page,
    Document,
    Camera,
    Instance,
    InstancePageState,
    Pointer,
    InstancePresence,
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        RecordKind::Shape,
        RecordKind::Page,
        RecordKind::Document,
        RecordKind::Camera,
        RecordKind::Instance,
        RecordKind::InstancePageState,
        RecordKind::Pointer,
        RecordKind::InstancePresence,
    ];

    pub fn type_name(self) -> &'static str {
        match self {
            RecordKind::Shape => "shape",
            RecordKind::Page => "page",
            RecordKind::Document => "document",
            RecordKind::Camera => "camera",
            RecordKind::Instance => "instance",
            RecordKind::InstancePageState => "instance_page_state",
            RecordKind::Pointer => "pointer",
            RecordKind::InstancePresence => "instance_presence",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }

    pub fn scope(self) -> RecordScope {
        match self {
            RecordKind::Shape | RecordKind::Page | RecordKind::Document => RecordScope::Document,
            RecordKind::Camera
            | RecordKind::Instance
            | RecordKind::InstancePageState
            | RecordKind::Pointer => RecordScope::Session,
            RecordKind::InstancePresence => RecordScope::Presence,
        }
    }
}

/// User content placed on a page (or nested inside another shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeRecord {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub shape_type: String,
    /// Containing page or shape.
    pub parent_id: RecordId,
    #[serde(default)]
    pub index: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub props: Map<String, Value>,
}

impl ShapeRecord {
    pub fn new(
        id: RecordId,
        shape_type: impl Into<String>,
        parent_id: RecordId,
        x: f64,
        y: f64,
    ) -> Self {
        Self {
            id,
            shape_type: shape_type.into(),
            parent_id,
            index: "a1".to_string(),
            x,
            y,
            rotation: 0.0,
            props: Map::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub index: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_grid_size")]
    pub grid_size: f64,
}

fn default_grid_size() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: RecordId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: RecordId,
    pub current_page_id: RecordId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePageStateRecord {
    pub id: RecordId,
    pub page_id: RecordId,
    #[serde(default)]
    pub selected_shape_ids: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerRecord {
    pub id: RecordId,
    pub x: f64,
    pub y: f64,
}

/// Cursor position in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// A peer's presence, materialized into the local store only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: RecordId,
    pub user_id: String,
    pub user_name: String,
    /// CSS color string (`#rrggbb`).
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub selected_shape_ids: Vec<RecordId>,
    #[serde(default)]
    pub current_page_id: Option<RecordId>,
}

/// Tagged union over every record kind, discriminated by `typeName`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeName", rename_all = "snake_case")]
pub enum Record {
    Shape(ShapeRecord),
    Page(PageRecord),
    Document(DocumentRecord),
    Camera(CameraRecord),
    Instance(InstanceRecord),
    InstancePageState(InstancePageStateRecord),
    Pointer(PointerRecord),
    InstancePresence(PresenceRecord),
}

impl Record {
    pub fn id(&self) -> &RecordId {
        match self {
            Record::Shape(r) => &r.id,
            Record::Page(r) => &r.id,
            Record::Document(r) => &r.id,
            Record::Camera(r) => &r.id,
            Record::Instance(r) => &r.id,
            Record::InstancePageState(r) => &r.id,
            Record::Pointer(r) => &r.id,
            Record::InstancePresence(r) => &r.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Shape(_) => RecordKind::Shape,
            Record::Page(_) => RecordKind::Page,
            Record::Document(_) => RecordKind::Document,
            Record::Camera(_) => RecordKind::Camera,
            Record::Instance(_) => RecordKind::Instance,
            Record::InstancePageState(_) => RecordKind::InstancePageState,
            Record::Pointer(_) => RecordKind::Pointer,
            Record::InstancePresence(_) => RecordKind::InstancePresence,
        }
    }

    pub fn scope(&self) -> RecordScope {
        self.kind().scope()
    }

    pub fn as_shape(&self) -> Option<&ShapeRecord> {
        match self {
            Record::Shape(shape) => Some(shape),
            _ => None,
        }
    }

    /// Check that the id prefix names this record's kind.
    pub fn validate(&self) -> Result<(), RecordError> {
        let id = self.id();
        let expected = self.kind().type_name();
        match id.split() {
            Some((prefix, suffix)) if prefix == expected && !suffix.is_empty() => Ok(()),
            Some(_) => Err(RecordError::KindMismatch {
                id: id.to_string(),
                expected,
            }),
            None => Err(RecordError::InvalidId(id.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(|e| RecordError::Json(e.to_string()))
    }

    /// Decode and validate a record from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let record: Record =
            serde_json::from_str(json).map_err(|e| RecordError::Json(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }
}

impl From<ShapeRecord> for Record {
    fn from(shape: ShapeRecord) -> Self {
        Record::Shape(shape)
    }
}

impl From<PageRecord> for Record {
    fn from(page: PageRecord) -> Self {
        Record::Page(page)
    }
}

impl From<DocumentRecord> for Record {
    fn from(document: DocumentRecord) -> Self {
        Record::Document(document)
    }
}

impl From<PresenceRecord> for Record {
    fn from(presence: PresenceRecord) -> Self {
        Record::InstancePresence(presence)
    }
}
