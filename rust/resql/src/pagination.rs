//! Keyset cursors and the connection shape returned by paged listings.

use crate::{
    error::{Result, ServiceError},
    models::SortDirection,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    timestamp: String,
    id: String,
}

/// Decoded resume point: the (Timestamp, UUID) pair of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

pub fn decode_cursor(cursor: &str) -> Result<Cursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ServiceError::invalid("invalid cursor"))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|_| ServiceError::invalid("invalid cursor payload"))?;
    let timestamp = DateTime::parse_from_rfc3339(&payload.timestamp)
        .map_err(|_| ServiceError::invalid("invalid cursor timestamp"))?
        .with_timezone(&Utc);
    if uuid::Uuid::parse_str(&payload.id).is_err() {
        return Err(ServiceError::invalid("invalid cursor id"));
    }
    Ok(Cursor {
        timestamp,
        id: payload.id,
    })
}

pub fn encode_cursor(timestamp: DateTime<Utc>, id: &str) -> String {
    let payload = CursorPayload {
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        id: id.to_string(),
    };
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap_or_default())
}

/// Rows that can be addressed by a keyset cursor.
pub trait Keyset {
    fn keyset(&self) -> (DateTime<Utc>, &str);

    fn cursor(&self) -> String {
        let (timestamp, id) = self.keyset();
        encode_cursor(timestamp, id)
    }
}

impl Keyset for crate::models::LogRow {
    fn keyset(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, &self.uuid)
    }
}

impl Keyset for crate::models::TraceRow {
    fn keyset(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, &self.uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageCursor {
    #[default]
    First,
    After(String),
    Before(String),
    At(String),
}

impl PageCursor {
    /// Builds the cursor from the three optional request fields. Strings of length 0 or 1
    /// count as absent; the first present field wins in after, before, at order.
    pub fn from_parts(after: Option<&str>, before: Option<&str>, at: Option<&str>) -> Self {
        let present = |value: Option<&str>| value.filter(|v| v.len() > 1).map(str::to_string);
        if let Some(after) = present(after) {
            PageCursor::After(after)
        } else if let Some(before) = present(before) {
            PageCursor::Before(before)
        } else if let Some(at) = present(at) {
            PageCursor::At(at)
        } else {
            PageCursor::First
        }
    }

    pub fn raw(&self) -> Option<&str> {
        match self {
            PageCursor::First => None,
            PageCursor::After(raw) | PageCursor::Before(raw) | PageCursor::At(raw) => Some(raw),
        }
    }

    pub fn decode(&self) -> Result<Option<Cursor>> {
        self.raw().map(decode_cursor).transpose()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub count_only: bool,
}

impl Pagination {
    pub fn cursor(&self) -> PageCursor {
        PageCursor::from_parts(
            self.after.as_deref(),
            self.before.as_deref(),
            self.at.as_deref(),
        )
    }

    pub fn count_only() -> Self {
        Self {
            count_only: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: String,
    pub end_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

impl<T: Keyset> Connection<T> {
    /// Trims rows fetched with one extra row per open side down to `limit` and derives
    /// page info. Rows arrive in display (forward) order.
    pub fn from_rows(mut rows: Vec<T>, cursor: &PageCursor, limit: usize) -> Self {
        let mut page_info = PageInfo::default();

        match cursor {
            PageCursor::First | PageCursor::After(_) => {
                if rows.len() > limit {
                    rows.truncate(limit);
                    page_info.has_next_page = true;
                }
                page_info.has_previous_page = matches!(cursor, PageCursor::After(_));
            }
            PageCursor::Before(_) => {
                if rows.len() > limit {
                    rows.drain(..rows.len() - limit);
                    page_info.has_previous_page = true;
                }
                page_info.has_next_page = true;
            }
            PageCursor::At(raw) => {
                let half = limit.div_ceil(2);
                let target = decode_cursor(raw).ok();
                let position = target.as_ref().and_then(|cursor| {
                    rows.iter()
                        .position(|row| row.keyset() == (cursor.timestamp, cursor.id.as_str()))
                });
                if let Some(index) = position {
                    let after = rows.len() - index - 1;
                    if after > half {
                        rows.truncate(index + half + 1);
                        page_info.has_next_page = true;
                    }
                    if index > half {
                        rows.drain(..index - half);
                        page_info.has_previous_page = true;
                    }
                } else if rows.len() > limit {
                    rows.truncate(limit);
                    page_info.has_next_page = true;
                }
            }
        }

        let edges: Vec<Edge<T>> = rows
            .into_iter()
            .map(|node| Edge {
                cursor: node.cursor(),
                node,
            })
            .collect();
        if let (Some(first), Some(last)) = (edges.first(), edges.last()) {
            page_info.start_cursor = first.cursor.clone();
            page_info.end_cursor = last.cursor.clone();
        }

        Self { edges, page_info }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[derive(Debug, Clone, PartialEq)]
    struct Row(DateTime<Utc>, String);

    impl Keyset for Row {
        fn keyset(&self) -> (DateTime<Utc>, &str) {
            (self.0, &self.1)
        }
    }

    fn id(i: usize) -> String {
        format!("00000000-0000-4000-8000-{i:012}")
    }

    fn rows(count: usize) -> Vec<Row> {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| Row(base + Duration::seconds(i as i64), id(i)))
            .collect()
    }

    fn ids(connection: &Connection<Row>) -> Vec<String> {
        connection.edges.iter().map(|e| e.node.1.clone()).collect()
    }

    #[test]
    fn cursor_round_trips() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::nanoseconds(42);
        let encoded = encode_cursor(ts, "0b5f7a7e-8a43-4b73-9f0c-6b2f0d0e7f11");
        let decoded = decode_cursor(&encoded).unwrap();
        assert_eq!(decoded.timestamp, ts);
        assert_eq!(decoded.id, "0b5f7a7e-8a43-4b73-9f0c-6b2f0d0e7f11");
    }

    #[test]
    fn malformed_cursor_is_invalid_request_in_any_position() {
        for cursor in [
            PageCursor::After("not-base64!!".into()),
            PageCursor::Before("not-base64!!".into()),
            PageCursor::At(URL_SAFE_NO_PAD.encode(b"{\"timestamp\":\"yesterday\",\"id\":\"x\"}")),
        ] {
            let err = cursor.decode().unwrap_err();
            assert!(matches!(err, ServiceError::InvalidRequest(_)), "{err}");
        }
    }

    #[test]
    fn short_cursor_strings_are_absent() {
        assert_eq!(PageCursor::from_parts(Some("x"), None, None), PageCursor::First);
        assert_eq!(
            PageCursor::from_parts(Some(""), Some("abc"), None),
            PageCursor::Before("abc".into())
        );
    }

    #[test]
    fn first_page_detects_next_page() {
        let connection = Connection::from_rows(rows(4), &PageCursor::First, 3);
        assert_eq!(connection.edges.len(), 3);
        assert!(connection.page_info.has_next_page);
        assert!(!connection.page_info.has_previous_page);
        assert_eq!(connection.page_info.start_cursor, connection.edges[0].cursor);
    }

    #[test]
    fn before_page_keeps_rows_closest_to_cursor() {
        let connection = Connection::from_rows(rows(4), &PageCursor::Before("c".into()), 3);
        assert_eq!(ids(&connection), vec![id(1), id(2), id(3)]);
        assert!(connection.page_info.has_previous_page);
        assert!(connection.page_info.has_next_page);
    }

    #[test]
    fn at_page_centers_on_cursor_row() {
        let all = rows(9);
        let at = all[4].cursor();
        let connection = Connection::from_rows(all, &PageCursor::At(at), 4);
        assert_eq!(ids(&connection), vec![id(2), id(3), id(4), id(5), id(6)]);
        assert!(connection.page_info.has_next_page);
        assert!(connection.page_info.has_previous_page);
    }

    #[test]
    fn at_page_matches_equivalent_cursor_encodings() {
        let all = rows(9);
        // whole-second timestamp without the nanosecond digits `encode_cursor` writes
        let payload = format!("{{\"timestamp\":\"2025-01-01T00:00:04Z\",\"id\":\"{}\"}}", id(4));
        let at = URL_SAFE_NO_PAD.encode(payload);
        assert_ne!(at, all[4].cursor());

        let connection = Connection::from_rows(all, &PageCursor::At(at), 4);
        assert_eq!(ids(&connection), vec![id(2), id(3), id(4), id(5), id(6)]);
        assert!(connection.page_info.has_previous_page);
    }
}
