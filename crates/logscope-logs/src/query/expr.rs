use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use logscope_types::{LogItem, LogLevel, PropertyValue, ScalarValue};

/// Typed view of a property value, selected by the prefix in `it["x:Name"]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Projection {
    /// `s:` scalar as string
    String,
    /// `f:` floating point scalars only
    Float,
    /// `i:` signed integer scalars only
    Integer,
    /// `u:` unsigned integer scalars only
    Unsigned,
    /// `l:` sequences
    List,
    /// `m:` maps
    Map,
    /// `o:` structured objects
    Object,
    /// No prefix: scalars as string, other values rendered
    Untyped,
}

impl Projection {
    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            's' => Some(Self::String),
            'f' => Some(Self::Float),
            'i' => Some(Self::Integer),
            'u' => Some(Self::Unsigned),
            'l' => Some(Self::List),
            'm' => Some(Self::Map),
            'o' => Some(Self::Object),
            _ => None,
        }
    }

    pub fn prefix(self) -> Option<char> {
        match self {
            Self::String => Some('s'),
            Self::Float => Some('f'),
            Self::Integer => Some('i'),
            Self::Unsigned => Some('u'),
            Self::List => Some('l'),
            Self::Map => Some('m'),
            Self::Object => Some('o'),
            Self::Untyped => None,
        }
    }

    /// Split a property key like `s:Name` into projection and name
    pub fn split_key(key: &str) -> (Self, &str) {
        let mut chars = key.chars();
        if let (Some(prefix), Some(':')) = (chars.next(), chars.next())
            && key.len() > 2
            && let Some(projection) = Self::from_prefix(prefix)
        {
            return (projection, &key[2..]);
        }
        (Self::Untyped, key)
    }
}

/// A field of a log item that expressions can read
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    FileId,
    Timestamp,
    Level,
    /// Rendered message
    Message,
    MessageTemplate,
    Exception,
    IsBookmarked,
    Property { name: String, projection: Projection },
}

impl Field {
    pub fn property(name: impl Into<String>, projection: Projection) -> Self {
        Self::Property {
            name: name.into(),
            projection,
        }
    }

    /// Read the field from an item
    ///
    /// Projection mismatches yield `Value::Null` rather than an error.
    pub fn project<'a>(&self, item: &'a LogItem) -> Value<'a> {
        match self {
            Self::Id => Value::UInt(item.id),
            Self::FileId => Value::UInt(u64::from(item.file_id.0)),
            Self::Timestamp => Value::Timestamp(item.event.timestamp),
            Self::Level => Value::Level(item.event.level),
            Self::Message => Value::Str(Cow::Owned(item.event.render_message())),
            Self::MessageTemplate => Value::Str(Cow::Borrowed(&item.event.message_template)),
            Self::Exception => item
                .event
                .exception
                .as_deref()
                .map_or(Value::Null, |x| Value::Str(Cow::Borrowed(x))),
            Self::IsBookmarked => Value::Bool(item.is_bookmarked()),
            Self::Property { name, projection } => match item.event.properties.get(name) {
                Some(value) => project_property(value, *projection),
                None => Value::Null,
            },
        }
    }
}

fn project_property(value: &PropertyValue, projection: Projection) -> Value<'_> {
    match (projection, value) {
        (Projection::String | Projection::Untyped, PropertyValue::Scalar(scalar)) => scalar_as_str(scalar),
        (Projection::Untyped, other) => Value::Str(Cow::Owned(other.render())),
        (Projection::Float, PropertyValue::Scalar(ScalarValue::Float(x))) => Value::Float(*x),
        (Projection::Integer, PropertyValue::Scalar(ScalarValue::Int(n))) => Value::Int(*n),
        (Projection::Unsigned, PropertyValue::Scalar(ScalarValue::UInt(n))) => Value::UInt(*n),
        (Projection::List, PropertyValue::Sequence(_))
        | (Projection::Map, PropertyValue::Map(_))
        | (Projection::Object, PropertyValue::Structure(_)) => Value::Complex(value),
        _ => Value::Null,
    }
}

fn scalar_as_str(scalar: &ScalarValue) -> Value<'_> {
    match scalar {
        ScalarValue::Null => Value::Null,
        ScalarValue::String(s) => Value::Str(Cow::Borrowed(s)),
        other => Value::Str(Cow::Owned(other.to_string())),
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id => f.write_str("Id"),
            Self::FileId => f.write_str("FileId"),
            Self::Timestamp => f.write_str("Timestamp"),
            Self::Level => f.write_str("Level"),
            Self::Message => f.write_str("Message"),
            Self::MessageTemplate => f.write_str("MessageTemplate"),
            Self::Exception => f.write_str("Exception"),
            Self::IsBookmarked => f.write_str("IsBookmarked"),
            Self::Property { name, projection } => {
                f.write_str("it[\"")?;
                if let Some(prefix) = projection.prefix() {
                    write!(f, "{}:", prefix)?;
                }
                write_escaped(f, name)?;
                f.write_str("\"]")
            }
        }
    }
}

/// Doubles embedded quotes
fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for part in s.split_inclusive('"') {
        f.write_str(part)?;
        if part.ends_with('"') {
            f.write_str("\"")?;
        }
    }
    Ok(())
}

/// A runtime value read from an item
#[derive(Clone, Debug, PartialEq)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(Cow<'a, str>),
    Timestamp(DateTime<Utc>),
    Level(LogLevel),
    Complex(&'a PropertyValue),
}

impl Value<'_> {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::UInt(_) | Self::Float(_) => 2,
            Self::Timestamp(_) => 3,
            Self::Level(_) => 4,
            Self::Str(_) => 5,
            Self::Complex(_) => 6,
        }
    }

    /// Total order used for sorting; nulls first, values of different kinds by kind
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Level(a), Self::Level(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Complex(a), Self::Complex(b)) => a.render().cmp(&b.render()),
            (a, b) if a.rank() == 2 && b.rank() == 2 => {
                numeric_cmp(a, b).unwrap_or_else(|| a.as_f64().total_cmp(&b.as_f64()))
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Self::Int(n) => *n as f64,
            Self::UInt(n) => *n as f64,
            Self::Float(x) => *x,
            _ => f64::NAN,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int(n) => Some(i128::from(*n)),
            Self::UInt(n) => Some(i128::from(*n)),
            _ => None,
        }
    }

    /// Compare against a literal; `None` when the two are not comparable
    pub fn compare_literal(&self, literal: &Literal) -> Option<Ordering> {
        match (self, literal) {
            (Self::Null, Literal::Null) => Some(Ordering::Equal),
            (Self::Null, _) | (_, Literal::Null) => None,
            (Self::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
            (Self::Str(a), Literal::String(b)) => Some(a.as_ref().cmp(b.as_str())),
            (Self::Timestamp(a), Literal::String(b)) => DateTime::parse_from_rfc3339(b)
                .ok()
                .map(|b| a.cmp(&b.with_timezone(&Utc))),
            (Self::Level(a), Literal::String(b)) => LogLevel::parse(b).map(|b| a.cmp(&b)),
            (Self::Level(a), Literal::Int(b)) => Some((a.ordinal() as i64).cmp(b)),
            (Self::Level(a), Literal::UInt(b)) => Some((a.ordinal() as u64).cmp(b)),
            (value, literal) if value.rank() == 2 => numeric_cmp(value, &literal.as_value()),
            _ => None,
        }
    }
}

fn numeric_cmp(a: &Value<'_>, b: &Value<'_>) -> Option<Ordering> {
    match (a.as_i128(), b.as_i128()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ if a.rank() == 2 && b.rank() == 2 => a.as_f64().partial_cmp(&b.as_f64()),
        _ => None,
    }
}

/// A constant in an expression
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl Literal {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    fn as_value(&self) -> Value<'_> {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::Int(*n),
            Self::UInt(n) => Value::UInt(*n),
            Self::Float(x) => Value::Float(*x),
            Self::String(s) => Value::Str(Cow::Borrowed(s)),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::UInt(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::String(s) => {
                f.write_str("\"")?;
                write_escaped(f, s)?;
                f.write_str("\"")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn test(self, ordering: Option<Ordering>) -> bool {
        match self {
            Self::Eq => ordering == Some(Ordering::Equal),
            Self::Ne => ordering != Some(Ordering::Equal),
            Self::Lt => ordering == Some(Ordering::Less),
            Self::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Self::Gt => ordering == Some(Ordering::Greater),
            Self::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Boolean predicate over log items
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(bool),
    Compare {
        field: Field,
        op: CompareOp,
        value: Literal,
    },
    In {
        field: Field,
        values: Vec<Literal>,
    },
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn compare(field: Field, op: CompareOp, value: Literal) -> Self {
        Self::Compare { field, op, value }
    }

    /// `it["s:name"] == value`, where `None` matches a missing or null property
    pub fn property_equals(name: &str, value: Option<&str>) -> Self {
        Self::compare(
            Field::property(name, Projection::String),
            CompareOp::Eq,
            value.map_or(Literal::Null, Literal::string),
        )
    }

    /// `Level in (...)`
    pub fn level_in(levels: impl IntoIterator<Item = LogLevel>) -> Self {
        Self::In {
            field: Field::Level,
            values: levels
                .into_iter()
                .map(|l| Literal::Int(l.ordinal() as i64))
                .collect(),
        }
    }

    /// Conjunction, flattening nested conjunctions; a single operand is returned as is
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Self {
        let mut parts = Vec::new();
        for expr in exprs {
            match expr {
                Self::And(inner) => parts.extend(inner),
                Self::Const(true) => {}
                other => parts.push(other),
            }
        }
        if parts.len() == 1 {
            return parts.remove(0);
        }
        Self::And(parts)
    }

    /// Disjunction, flattening nested disjunctions; a single operand is returned as is
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Self {
        let mut parts = Vec::new();
        for expr in exprs {
            match expr {
                Self::Or(inner) => parts.extend(inner),
                Self::Const(false) => {}
                other => parts.push(other),
            }
        }
        if parts.len() == 1 {
            return parts.remove(0);
        }
        Self::Or(parts)
    }

    /// Evaluate against an item
    pub fn matches(&self, item: &LogItem) -> bool {
        match self {
            Self::Const(b) => *b,
            Self::Compare { field, op, value } => op.test(field.project(item).compare_literal(value)),
            Self::In { field, values } => {
                let projected = field.project(item);
                values
                    .iter()
                    .any(|v| projected.compare_literal(v) == Some(Ordering::Equal))
            }
            Self::Not(inner) => !inner.matches(item),
            Self::And(parts) => parts.iter().all(|p| p.matches(item)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(item)),
        }
    }

    fn is_composite(&self) -> bool {
        matches!(self, Self::And(parts) | Self::Or(parts) if parts.len() > 1)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(b) => write!(f, "{}", b),
            Self::Compare { field, op, value } => write!(f, "{} {} {}", field, op.as_str(), value),
            Self::In { field, values } => {
                write!(f, "{} in (", field)?;
                for (n, value) in values.iter().enumerate() {
                    if n > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str(")")
            }
            Self::Not(inner) => write!(f, "not ({})", inner),
            Self::And(parts) | Self::Or(parts) => {
                let (joiner, empty) = match self {
                    Self::And(_) => (" and ", "true"),
                    _ => (" or ", "false"),
                };
                if parts.is_empty() {
                    return f.write_str(empty);
                }
                for (n, part) in parts.iter().enumerate() {
                    if n > 0 {
                        f.write_str(joiner)?;
                    }
                    if part.is_composite() {
                        write!(f, "({})", part)?;
                    } else {
                        write!(f, "{}", part)?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use logscope_types::{FileId, LogEvent, StructureValue};

    fn item(level: LogLevel) -> LogItem {
        let event = LogEvent::new(Utc.timestamp_opt(100, 0).unwrap(), level, "Hello {Name}")
            .with_property("Name", PropertyValue::string("world"))
            .with_property("Count", PropertyValue::Scalar(ScalarValue::Int(42)))
            .with_property("Ratio", PropertyValue::Scalar(ScalarValue::Float(0.5)))
            .with_property(
                "Obj",
                PropertyValue::Structure(StructureValue {
                    type_tag: None,
                    properties: vec![("A".into(), PropertyValue::string("b"))],
                }),
            );
        LogItem::new(7, FileId(1), event)
    }

    #[test]
    fn test_split_key() {
        assert_eq!(Projection::split_key("s:App"), (Projection::String, "App"));
        assert_eq!(Projection::split_key("App"), (Projection::Untyped, "App"));
        assert_eq!(Projection::split_key("x:App"), (Projection::Untyped, "x:App"));
        assert_eq!(Projection::split_key("s:"), (Projection::Untyped, "s:"));
    }

    #[test]
    fn test_typed_projection_mismatch_is_null() {
        let item = item(LogLevel::Information);
        assert_eq!(Field::property("Count", Projection::Float).project(&item), Value::Null);
        assert_eq!(Field::property("Count", Projection::Integer).project(&item), Value::Int(42));
        assert_eq!(
            Field::property("Count", Projection::String).project(&item),
            Value::Str(Cow::Borrowed("42"))
        );
        assert_eq!(Field::property("Obj", Projection::String).project(&item), Value::Null);
        assert_eq!(
            Field::property("Obj", Projection::Untyped).project(&item),
            Value::Str(Cow::Owned(r#"{ A: "b" }"#.to_string()))
        );
        assert!(matches!(
            Field::property("Obj", Projection::Object).project(&item),
            Value::Complex(_)
        ));
    }

    #[test]
    fn test_matches() {
        let item = item(LogLevel::Error);
        assert!(Expr::property_equals("Name", Some("world")).matches(&item));
        assert!(!Expr::property_equals("Name", Some("moon")).matches(&item));
        assert!(Expr::property_equals("Missing", None).matches(&item));
        assert!(!Expr::property_equals("Name", None).matches(&item));
        assert!(Expr::level_in([LogLevel::Error, LogLevel::Fatal]).matches(&item));
        assert!(!Expr::level_in([LogLevel::Verbose]).matches(&item));
        assert!(
            Expr::compare(
                Field::property("Ratio", Projection::Float),
                CompareOp::Lt,
                Literal::Int(1)
            )
            .matches(&item)
        );
        assert!(Expr::compare(Field::Message, CompareOp::Eq, Literal::string("Hello \"world\"")).matches(&item));
    }

    #[test]
    fn test_and_or_flatten() {
        let a = Expr::property_equals("A", Some("1"));
        let b = Expr::property_equals("B", Some("2"));
        assert_eq!(Expr::and([a.clone()]), a);
        assert_eq!(
            Expr::and([Expr::and([a.clone(), b.clone()]), Expr::Const(true)]),
            Expr::And(vec![a.clone(), b.clone()])
        );
        assert_eq!(Expr::or(Vec::new()), Expr::Or(Vec::new()));
        assert!(!Expr::Or(Vec::new()).matches(&item(LogLevel::Debug)));
    }

    #[test]
    fn test_display() {
        let expr = Expr::or([
            Expr::and([
                Expr::property_equals("App", Some("say \"hi\"")),
                Expr::level_in([LogLevel::Warning, LogLevel::Error]),
            ]),
            Expr::property_equals("App", None),
        ]);
        assert_eq!(
            expr.to_string(),
            r#"(it["s:App"] == "say ""hi""" and Level in (3, 4)) or it["s:App"] == null"#
        );
        assert_eq!(Expr::Or(Vec::new()).to_string(), "false");
    }
}
