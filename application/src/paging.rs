//! Keyset paging over find results.
//!
//! A page is fetched as a [`KeyWindow`] one row larger than the page size; the
//! extra row only tells whether more records lie beyond. Links to adjacent pages
//! are [`Cursor`]s anchored on the edge keys of the current page and travel as
//! opaque tokens.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use domain::{Filters, FlatReq, RecordKind, validate_find_command};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ApplicationError;
use crate::query::{KeyWindow, Keyed, SortOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
    Prev,
}

/// Canonical sort key of a record: id for sensor-types and sensors, timestamp for readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortKey {
    Id(String),
    Timestamp(i64),
}

/// Everything needed to fetch an adjacent page again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub kind: RecordKind,
    pub filters: BTreeMap<String, String>,
    /// Key of the edge record of the page the cursor was issued from.
    pub anchor: SortKey,
    pub direction: Direction,
    pub page_size: usize,
}

impl Cursor {
    /// Opaque, URL-safe token for this cursor.
    pub fn encode(&self) -> Result<String, ApplicationError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ApplicationError::InvalidCursor(format!("unencodable cursor: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, ApplicationError> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| ApplicationError::InvalidCursor(format!("malformed token: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| ApplicationError::InvalidCursor(format!("malformed payload: {}", e)))
    }

    /// Checks the cursor against the record kind it is used for and recovers its parts.
    pub(crate) fn resume<T: Keyed>(
        self,
        kind: RecordKind,
    ) -> Result<(Filters, Anchor<T::Key>, usize), ApplicationError> {
        if self.kind != kind {
            return Err(ApplicationError::InvalidCursor(format!(
                "cursor for {} used with {}",
                self.kind.find_command(),
                kind.find_command()
            )));
        }
        let request: FlatReq = self.filters.into_iter().collect();
        let filters = validate_find_command(kind, &request)
            .map_err(|e| ApplicationError::InvalidCursor(e.to_string()))?;
        let key = T::from_sort_key(self.anchor).ok_or_else(|| {
            ApplicationError::InvalidCursor(format!("anchor does not fit {}", kind))
        })?;
        let anchor = Anchor {
            key,
            direction: self.direction,
        };
        Ok((filters, anchor, self.page_size))
    }
}

/// Where a page starts: the edge key of the neighbouring page and which way to go from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Anchor<K> {
    pub key: K,
    pub direction: Direction,
}

/// One page of find results with cursors to its neighbours.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub values: Vec<T>,
    pub prev: Option<Cursor>,
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn prev_token(&self) -> Result<Option<String>, ApplicationError> {
        self.prev.as_ref().map(Cursor::encode).transpose()
    }

    pub fn next_token(&self) -> Result<Option<String>, ApplicationError> {
        self.next.as_ref().map(Cursor::encode).transpose()
    }
}

/// The window to fetch for a page of `page_size` records starting at `anchor`.
pub(crate) fn window_for<K: Clone>(anchor: Option<&Anchor<K>>, page_size: usize) -> KeyWindow<K> {
    let limit = Some(page_size + 1);
    match anchor {
        None => KeyWindow {
            limit,
            ..KeyWindow::default()
        },
        Some(Anchor {
            key,
            direction: Direction::Next,
        }) => KeyWindow {
            after: Some(key.clone()),
            limit,
            ..KeyWindow::default()
        },
        Some(Anchor {
            key,
            direction: Direction::Prev,
        }) => KeyWindow {
            before: Some(key.clone()),
            order: SortOrder::Desc,
            limit,
            ..KeyWindow::default()
        },
    }
}

/// Builds the page from rows fetched with [`window_for`].
pub(crate) fn assemble<T: Keyed>(
    mut rows: Vec<T>,
    filters: &Filters,
    direction: Option<Direction>,
    page_size: usize,
) -> Page<T> {
    let more = rows.len() > page_size;
    rows.truncate(page_size);
    if direction == Some(Direction::Prev) {
        rows.reverse();
    }
    let (has_prev, has_next) = match direction {
        None => (false, more),
        Some(Direction::Next) => (true, more),
        Some(Direction::Prev) => (more, true),
    };
    let cursor = |record: &T, direction: Direction| Cursor {
        kind: filters.kind(),
        filters: filters.fields().clone(),
        anchor: T::to_sort_key(record.key()),
        direction,
        page_size,
    };
    let prev = rows
        .first()
        .filter(|_| has_prev)
        .map(|first| cursor(first, Direction::Prev));
    let next = rows
        .last()
        .filter(|_| has_next)
        .map(|last| cursor(last, Direction::Next));
    Page {
        values: rows,
        prev,
        next,
    }
}
