//! Shared types for logscope
//!
//! This crate contains the log data model used across the logscope crates:
//! events as produced by importers, the items the engine stores, property
//! values and their shapes, and the small value types passed between the
//! engine and the session layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// Levels
// ============================================================================

/// Log severity level, ordered from least to most severe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LogLevel {
    Verbose,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// Number of distinct levels
    pub const COUNT: usize = 6;

    /// All levels in ordinal order
    pub const ALL: [LogLevel; Self::COUNT] = [
        Self::Verbose,
        Self::Debug,
        Self::Information,
        Self::Warning,
        Self::Error,
        Self::Fatal,
    ];

    /// Zero-based ordinal (Verbose = 0, Fatal = 5)
    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|n| Self::ALL.get(n).copied())
    }

    /// Parse log level from common formats
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "verbose" | "trace" | "trc" | "vrb" => Some(Self::Verbose),
            "debug" | "dbg" => Some(Self::Debug),
            "information" | "info" | "inf" => Some(Self::Information),
            "warning" | "warn" | "wrn" => Some(Self::Warning),
            "error" | "err" | "eror" => Some(Self::Error),
            "fatal" | "critical" | "crit" | "ftl" => Some(Self::Fatal),
            _ => None,
        }
    }

    /// Full level name
    pub fn name(self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verbose => "VRB",
            Self::Debug => "DBG",
            Self::Information => "INF",
            Self::Warning => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Property Values
// ============================================================================

/// Coarse shape of a property value, as tracked by the property catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    None,
    String,
    Float,
    Integer,
    Unsigned,
    List,
    Map,
    Object,
}

/// A leaf property value
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl ScalarValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Null => PropertyKind::None,
            // Booleans have no dedicated shape and are grouped with strings
            Self::Bool(_) | Self::String(_) => PropertyKind::String,
            Self::Int(_) => PropertyKind::Integer,
            Self::UInt(_) => PropertyKind::Unsigned,
            Self::Float(_) => PropertyKind::Float,
        }
    }

    /// Plain string form, `None` for null
    pub fn to_plain_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Render with strings quoted, the way values appear inside messages
    fn render(&self, out: &mut String) {
        match self {
            Self::String(s) => {
                out.push('"');
                for ch in s.chars() {
                    if ch == '"' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push('"');
            }
            other => out.push_str(&other.to_string()),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::String(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{}", n),
            Self::UInt(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
        }
    }
}

/// A structured object value with an optional type tag
#[derive(Clone, Debug, PartialEq, Default)]
pub struct StructureValue {
    pub type_tag: Option<String>,
    pub properties: Vec<(String, PropertyValue)>,
}

/// A property value attached to a log event
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Scalar(ScalarValue),
    Sequence(Vec<PropertyValue>),
    Map(Vec<(ScalarValue, PropertyValue)>),
    Structure(StructureValue),
}

impl PropertyValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Scalar(ScalarValue::String(s.into()))
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Scalar(s) => s.kind(),
            Self::Sequence(_) => PropertyKind::List,
            Self::Map(_) => PropertyKind::Map,
            Self::Structure(_) => PropertyKind::Object,
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// String form of a scalar value; `None` for null scalars and non-scalars
    pub fn scalar_string(&self) -> Option<String> {
        self.as_scalar().and_then(ScalarValue::to_plain_string)
    }

    /// Render the value with nested strings quoted
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Self::Scalar(s) => s.render(out),
            Self::Sequence(items) => {
                out.push('[');
                for (n, item) in items.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(out);
                }
                out.push(']');
            }
            Self::Map(entries) => {
                out.push('{');
                for (n, (key, value)) in entries.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    out.push('[');
                    key.render(out);
                    out.push_str("]: ");
                    value.render_into(out);
                }
                out.push('}');
            }
            Self::Structure(structure) => {
                if let Some(tag) = &structure.type_tag {
                    out.push_str(tag);
                    out.push(' ');
                }
                out.push_str("{ ");
                for (n, (name, value)) in structure.properties.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(name);
                    out.push_str(": ");
                    value.render_into(out);
                }
                out.push_str(" }");
            }
        }
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Scalar(ScalarValue::Null),
            Value::Bool(b) => Self::Scalar(ScalarValue::Bool(b)),
            Value::String(s) => Self::Scalar(ScalarValue::String(s)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Scalar(ScalarValue::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Self::Scalar(ScalarValue::UInt(u))
                } else {
                    Self::Scalar(ScalarValue::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::Array(items) => Self::Sequence(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => {
                let mut structure = StructureValue::default();
                for (name, value) in fields {
                    match (name.as_str(), value) {
                        ("$type", Value::String(tag)) => structure.type_tag = Some(tag),
                        (_, value) => structure.properties.push((name, Self::from(value))),
                    }
                }
                Self::Structure(structure)
            }
        }
    }
}

// ============================================================================
// Events and Items
// ============================================================================

/// An immutable log event as produced by an importer
#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message_template: String,
    pub exception: Option<String>,
    pub properties: HashMap<String, PropertyValue>,
}

impl LogEvent {
    /// Create a new event without properties
    pub fn new(timestamp: DateTime<Utc>, level: LogLevel, message_template: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message_template: message_template.into(),
            exception: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Render the message template, substituting property holes
    ///
    /// Holes look like `{Name}`, optionally with a `@`/`$` operator and an
    /// alignment or format suffix (`{Name,10}`, `{Name:l}`). `{{` and `}}`
    /// escape braces. Holes naming unknown properties are kept verbatim.
    pub fn render_message(&self) -> String {
        let template = self.message_template.as_str();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }

            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }

            let Some(end) = tail.find('}') else {
                out.push_str(tail);
                return out;
            };

            let hole = &tail[1..end];
            let name_and_align = hole.split(':').next().unwrap_or(hole);
            let name = name_and_align
                .split(',')
                .next()
                .unwrap_or(name_and_align)
                .trim_start_matches(['@', '$']);
            let literal = hole.split_once(':').is_some_and(|(_, format)| format.contains('l'));

            match self.properties.get(name) {
                Some(PropertyValue::Scalar(ScalarValue::String(s))) if literal => out.push_str(s),
                Some(value) => out.push_str(&value.render()),
                None => out.push_str(&tail[..=end]),
            }
            rest = &tail[end + 1..];
        }

        out.push_str(rest);
        out
    }
}

/// Identifier of an imported source file
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored log event
///
/// Ids are assigned by the store in append order and never reused. The
/// bookmark flag is the only mutable part of an item.
#[derive(Debug)]
pub struct LogItem {
    pub id: u64,
    pub file_id: FileId,
    pub event: LogEvent,
    bookmarked: AtomicBool,
}

impl LogItem {
    pub fn new(id: u64, file_id: FileId, event: LogEvent) -> Self {
        Self {
            id,
            file_id,
            event,
            bookmarked: AtomicBool::new(false),
        }
    }

    pub fn is_bookmarked(&self) -> bool {
        self.bookmarked.load(Ordering::Relaxed)
    }

    pub fn set_bookmarked(&self, bookmarked: bool) {
        self.bookmarked.store(bookmarked, Ordering::Relaxed);
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.event.timestamp
    }

    pub fn level(&self) -> LogLevel {
        self.event.level
    }

    /// Shape of the named property, `None` kind if absent
    pub fn property_kind(&self, name: &str) -> PropertyKind {
        self.event
            .properties
            .get(name)
            .map_or(PropertyKind::None, PropertyValue::kind)
    }

    /// Scalar string value of the named property
    ///
    /// `None` if the property is missing, null, or not a scalar.
    pub fn scalar_string(&self, name: &str) -> Option<String> {
        self.event
            .properties
            .get(name)
            .and_then(PropertyValue::scalar_string)
    }
}

/// A source file that has been (or is being) imported
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFile {
    pub id: FileId,
    pub path: PathBuf,
    /// Size in bytes at the last import
    pub size: u64,
    /// Byte offset after the last event that was committed to the store
    pub imported_offset: u64,
    /// Whether the last import of this file was cancelled before its end
    pub import_cancelled: bool,
}

impl LogFile {
    pub fn new(id: FileId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            size: 0,
            imported_offset: 0,
            import_cancelled: false,
        }
    }
}

/// A property name seen in at least one event, with every shape observed for it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PropertyModel {
    pub id: u64,
    pub name: String,
    pub kinds: BTreeSet<PropertyKind>,
}

impl PropertyModel {
    pub fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            kinds: BTreeSet::new(),
        }
    }

    pub fn has_kind(&self, kind: PropertyKind) -> bool {
        self.kinds.contains(&kind)
    }
}

// ============================================================================
// Import and Stats Types
// ============================================================================

/// Inclusive time bounds for importing events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// No bounds: every event is accepted
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Both bounds must hold for the timestamp to be accepted
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| timestamp >= start)
            && self.end.is_none_or(|end| timestamp <= end)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Summary of the stored log data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogDataStats {
    pub item_count: usize,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

impl LogDataStats {
    /// Stats of an empty store: no items, both timestamps at the minimum instant
    pub const EMPTY: LogDataStats = LogDataStats {
        item_count: 0,
        first_timestamp: DateTime::<Utc>::MIN_UTC,
        last_timestamp: DateTime::<Utc>::MIN_UTC,
    };

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }
}

/// One progress bar
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct ProgressData {
    pub max: f64,
    pub value: f64,
    pub indeterminate: bool,
}

impl ProgressData {
    pub fn new(max: f64, value: f64) -> Self {
        Self {
            max,
            value,
            indeterminate: false,
        }
    }

    pub fn indeterminate() -> Self {
        Self {
            max: 0.0,
            value: 0.0,
            indeterminate: true,
        }
    }

    /// Percentage rounded to one decimal, 0 when the maximum is unknown
    pub fn percent(&self) -> f64 {
        if self.indeterminate || self.max <= 0.0 {
            return 0.0;
        }
        (self.value / self.max * 1000.0).round() / 10.0
    }
}

/// Two-level import progress: overall bytes and bytes of the current file
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ImportProgress {
    pub action: String,
    pub item: Option<String>,
    pub main: ProgressData,
    pub secondary: Option<ProgressData>,
    pub can_cancel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_level_ordinals() {
        assert_eq!(LogLevel::Verbose.ordinal(), 0);
        assert_eq!(LogLevel::Fatal.ordinal(), 5);
        assert_eq!(LogLevel::from_ordinal(3), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_ordinal(6), None);
        assert_eq!(LogLevel::from_ordinal(-1), None);
        assert_eq!(LogLevel::parse("WRN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("nope"), None);
    }

    #[test]
    fn test_property_kinds() {
        assert_eq!(PropertyValue::string("x").kind(), PropertyKind::String);
        assert_eq!(PropertyValue::Scalar(ScalarValue::Null).kind(), PropertyKind::None);
        assert_eq!(PropertyValue::Scalar(ScalarValue::Bool(true)).kind(), PropertyKind::String);

        let json: PropertyValue = serde_json::json!({"$type": "Point", "X": 1, "Y": [1.5, -2]}).into();
        assert_eq!(json.kind(), PropertyKind::Object);
        let PropertyValue::Structure(s) = &json else {
            panic!("expected structure");
        };
        assert_eq!(s.type_tag.as_deref(), Some("Point"));
        assert_eq!(s.properties.len(), 2);

        let big: PropertyValue = serde_json::json!(u64::MAX).into();
        assert_eq!(big.kind(), PropertyKind::Unsigned);
    }

    #[test]
    fn test_render_message() {
        let event = LogEvent::new(ts(0), LogLevel::Information, "User {User} logged in from {@Ip} {{ok}} {Missing}")
            .with_property("User", PropertyValue::string("bob"))
            .with_property("Ip", PropertyValue::Scalar(ScalarValue::Int(7)));
        assert_eq!(event.render_message(), r#"User "bob" logged in from 7 {ok} {Missing}"#);

        let literal = LogEvent::new(ts(0), LogLevel::Information, "Hi {User:l}")
            .with_property("User", PropertyValue::string("bob"));
        assert_eq!(literal.render_message(), "Hi bob");
    }

    #[test]
    fn test_time_range_requires_both_bounds() {
        let range = TimeRange::between(Some(ts(10)), Some(ts(20)));
        assert!(range.contains(ts(10)));
        assert!(range.contains(ts(20)));
        assert!(!range.contains(ts(5)));
        assert!(!range.contains(ts(25)));
        assert!(TimeRange::all().contains(ts(0)));
    }

    #[test]
    fn test_empty_stats() {
        assert!(LogDataStats::EMPTY.is_empty());
        assert_eq!(LogDataStats::EMPTY.first_timestamp, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(ProgressData::new(200.0, 50.0).percent(), 25.0);
        assert_eq!(ProgressData::indeterminate().percent(), 0.0);
    }
}
