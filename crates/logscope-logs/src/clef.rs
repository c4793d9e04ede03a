//! Compact log event format (CLEF) importer
//!
//! CLEF files hold one JSON object per line. Reserved fields start with `@`:
//! `@t` timestamp (required), `@l` level (default Information), `@mt` message
//! template, `@m` pre-rendered message, `@x` exception. Property names that
//! start with `@` are escaped as `@@`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;

use logscope_types::{LogEvent, LogLevel, PropertyValue};

use crate::error::ImportError;
use crate::import::{ImportStream, ImportedEvent, Importer};

/// Id under which the CLEF importer is registered
pub const CLEF_IMPORTER_ID: &str = "CLEF";

/// Importer for newline-delimited CLEF files
///
/// Resumes from any byte offset that was reported after an event.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClefImporter;

impl Importer for ClefImporter {
    fn supports_resume(&self) -> bool {
        true
    }

    fn import_logs(&self, path: &Path, start_offset: u64, cancel: CancellationToken) -> ImportStream {
        let state = ReadState {
            path: path.to_path_buf(),
            reader: None,
            offset: start_offset,
            cancel,
        };
        futures::stream::try_unfold(state, read_next).boxed()
    }
}

struct ReadState {
    path: PathBuf,
    /// Opened lazily on the first poll
    reader: Option<BufReader<File>>,
    /// Absolute offset of the next unread byte
    offset: u64,
    cancel: CancellationToken,
}

async fn read_next(mut state: ReadState) -> Result<Option<(ImportedEvent, ReadState)>, ImportError> {
    let mut reader = match state.reader.take() {
        Some(reader) => reader,
        None => {
            let mut file = File::open(&state.path).await?;
            file.seek(SeekFrom::Start(state.offset)).await?;
            BufReader::new(file)
        }
    };

    let mut buf = Vec::new();
    loop {
        if state.cancel.is_cancelled() {
            return Ok(None);
        }

        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Ok(None);
        }

        // Invalid UTF-8 is replaced rather than failing the rest of the file
        let decoded = String::from_utf8_lossy(&buf);
        let text = decoded.trim();
        if text.is_empty() {
            state.offset += read as u64;
            continue;
        }

        match parse_clef_line(text) {
            Ok(event) => {
                state.offset += read as u64;
                let offset = state.offset;
                state.reader = Some(reader);
                return Ok(Some((ImportedEvent::new(event, offset), state)));
            }
            // A writer may still be appending the last line
            Err(_) if buf.last() != Some(&b'\n') => return Ok(None),
            Err(message) => {
                let line = line_number(&state.path, state.offset).await?;
                return Err(ImportError::Parse { line, message });
            }
        }
    }
}

/// 1-based number of the line that starts at `offset`
async fn line_number(path: &Path, offset: u64) -> Result<u64, ImportError> {
    let mut prefix = File::open(path).await?.take(offset);
    let mut chunk = vec![0; 64 * 1024];
    let mut newlines = 0;
    loop {
        let read = prefix.read(&mut chunk).await?;
        if read == 0 {
            return Ok(newlines + 1);
        }
        newlines += chunk[..read].iter().filter(|&&b| b == b'\n').count() as u64;
    }
}

/// Parse one CLEF line into an event
pub fn parse_clef_line(line: &str) -> Result<LogEvent, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let Value::Object(fields) = value else {
        return Err("expected a JSON object".to_string());
    };

    let mut timestamp = None;
    let mut level = LogLevel::Information;
    let mut template = None;
    let mut message = None;
    let mut exception = None;
    let mut properties = HashMap::new();

    for (name, value) in fields {
        match name.as_str() {
            "@t" => timestamp = Some(parse_timestamp(&value)?),
            "@l" => level = parse_level(&value)?,
            "@mt" => template = value.as_str().map(str::to_string),
            "@m" => message = value.as_str().map(str::to_string),
            "@x" => exception = value.as_str().map(str::to_string),
            escaped if escaped.starts_with("@@") => {
                properties.insert(escaped[1..].to_string(), PropertyValue::from(value));
            }
            // Other reserved fields (@i, @r, @tr, @sp) carry no event data we keep
            reserved if reserved.starts_with('@') => {}
            _ => {
                properties.insert(name, PropertyValue::from(value));
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| "missing @t".to_string())?;
    let template = template
        .or_else(|| message.map(|m| m.replace('{', "{{").replace('}', "}}")))
        .unwrap_or_default();

    Ok(LogEvent {
        timestamp,
        level,
        message_template: template,
        exception,
        properties,
    })
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    let text = value.as_str().ok_or("@t must be a string")?;
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid @t {:?}: {}", text, e))
}

fn parse_level(value: &Value) -> Result<LogLevel, String> {
    match value {
        Value::String(s) => LogLevel::parse(s).ok_or_else(|| format!("unknown level {:?}", s)),
        Value::Number(n) => {
            // Numeric levels follow the common 10-step severity scale
            let num = n.as_u64().ok_or_else(|| format!("invalid level {}", n))?;
            Ok(match num {
                0..=10 => LogLevel::Verbose,
                11..=20 => LogLevel::Debug,
                21..=30 => LogLevel::Information,
                31..=40 => LogLevel::Warning,
                41..=50 => LogLevel::Error,
                _ => LogLevel::Fatal,
            })
        }
        _ => Err("@l must be a string or number".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use logscope_types::ScalarValue;
    use std::io::Write;

    const LINES: &str = concat!(
        r#"{"@t":"2024-03-01T10:00:00Z","@mt":"Started {App}","App":"web"}"#,
        "\n",
        r#"{"@t":"2024-03-01T10:00:01.5Z","@l":"Error","@m":"raw {text}","@x":"boom"}"#,
        "\n",
        "\n",
        r#"{"@t":"2024-03-01T10:00:02Z","@l":"wrn","@@t":"escaped","@i":"a1b2c3","Count":7}"#,
        "\n",
    );

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        write_bytes(content.as_bytes())
    }

    fn write_bytes(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    async fn read_all(path: &Path, offset: u64) -> Result<Vec<ImportedEvent>, ImportError> {
        ClefImporter
            .import_logs(path, offset, CancellationToken::new())
            .try_collect()
            .await
    }

    #[test]
    fn test_parse_reserved_fields() {
        let event = parse_clef_line(
            r#"{"@t":"2024-03-01T10:00:00+02:00","@l":"Fatal","@mt":"x {A}","A":1,"@x":"trace"}"#,
        )
        .unwrap();
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        assert_eq!(event.level, LogLevel::Fatal);
        assert_eq!(event.message_template, "x {A}");
        assert_eq!(event.exception.as_deref(), Some("trace"));
        assert_eq!(event.properties["A"], PropertyValue::Scalar(ScalarValue::Int(1)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_clef_line(r#"{"@mt":"no time"}"#).unwrap_err().contains("@t"));
        assert!(parse_clef_line(r#"{"@t":"2024-03-01T10:00:00Z","@l":"loud"}"#).is_err());
        assert!(parse_clef_line("[1,2]").is_err());
        assert!(parse_clef_line("{not json").is_err());
    }

    #[test]
    fn test_numeric_levels() {
        let event = parse_clef_line(r#"{"@t":"2024-03-01T10:00:00Z","@l":45}"#).unwrap();
        assert_eq!(event.level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_reads_events_with_offsets() {
        let file = write_file(LINES);
        let events = read_all(file.path(), 0).await.unwrap();

        assert_eq!(events.len(), 3);
        let first_len = LINES.find('\n').unwrap() as u64 + 1;
        assert_eq!(events[0].offset, first_len);
        assert_eq!(events[2].offset, LINES.len() as u64);

        assert_eq!(events[0].event.render_message(), "Started \"web\"");
        assert_eq!(events[1].event.level, LogLevel::Error);
        assert_eq!(events[1].event.message_template, "raw {{text}}");
        assert_eq!(events[1].event.render_message(), "raw {text}");
        assert_eq!(events[2].event.level, LogLevel::Warning);
        assert_eq!(events[2].event.properties["@t"], PropertyValue::string("escaped"));
        assert!(!events[2].event.properties.contains_key("@i"));
    }

    #[tokio::test]
    async fn test_resume_from_offset() {
        let file = write_file(LINES);
        let all = read_all(file.path(), 0).await.unwrap();
        let resumed = read_all(file.path(), all[0].offset).await.unwrap();

        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].event, all[1].event);
        assert_eq!(resumed[1].offset, all[2].offset);
    }

    #[tokio::test]
    async fn test_partial_trailing_line_ends_stream() {
        let content = format!("{}{}", LINES, r#"{"@t":"2024-03-01T10:00"#);
        let file = write_file(&content);
        let events = read_all(file.path(), 0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].offset, LINES.len() as u64);
    }

    #[tokio::test]
    async fn test_bad_line_is_parse_error() {
        let file = write_file("{\"@t\":\"2024-03-01T10:00:00Z\"}\nnot json\n");
        let err = read_all(file.path(), 0).await.unwrap_err();
        assert!(matches!(err, ImportError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_parse_error_line_counts_from_file_start() {
        let file = write_file(concat!(
            r#"{"@t":"2024-03-01T10:00:00Z"}"#,
            "\n\n",
            r#"{"@t":"2024-03-01T10:00:01Z"}"#,
            "\n",
            "not json\n",
        ));
        let first = read_all(file.path(), 0).await.unwrap_err();
        assert!(matches!(first, ImportError::Parse { line: 4, .. }));

        let resume_at = r#"{"@t":"2024-03-01T10:00:00Z"}"#.len() as u64 + 1;
        let resumed = read_all(file.path(), resume_at).await.unwrap_err();
        assert!(matches!(resumed, ImportError::Parse { line: 4, .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_import() {
        let mut content = Vec::new();
        content.extend_from_slice(br#"{"@t":"2024-03-01T10:00:00Z","@m":"first"}"#);
        content.push(b'\n');
        content.extend_from_slice(br#"{"@t":"2024-03-01T10:00:01Z","@m":"bad "#);
        content.push(0xff);
        content.extend_from_slice(b"\"}\n");
        content.extend_from_slice(br#"{"@t":"2024-03-01T10:00:02Z","@m":"third"}"#);
        content.push(b'\n');
        let file = write_bytes(&content);

        let events = read_all(file.path(), 0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].event.render_message(), "bad \u{FFFD}");
        assert_eq!(events[2].event.render_message(), "third");
        assert_eq!(events[2].offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_cancel_stops_stream() {
        let file = write_file(LINES);
        let cancel = CancellationToken::new();
        let mut stream = ClefImporter.import_logs(file.path(), 0, cancel.clone());

        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = read_all(Path::new("/no/such/file.clef"), 0).await.unwrap_err();
        assert!(matches!(err, ImportError::Io(_)));
    }
}
