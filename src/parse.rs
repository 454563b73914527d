use serde_json::{Map, Value};

use crate::FetchError;

/// Field names different API versions use for the account id, in priority order.
pub const ID_FIELDS: [&str; 7] = [
    "id",
    "profile_id",
    "user_id",
    "player_id",
    "profileId",
    "playerId",
    "id_str",
];

/// Attributes that are never kept in the stored snapshot.
const DROPPED_FIELDS: [&str; 1] = ["history"];

/// One leaderboard row, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub rank: u32,
    pub latest: Map<String, Value>,
}

/// A parsed page. `entries` is empty once the page is past the end of the leaderboard.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub page: u32,
    pub entries: Vec<Entry>,
    pub total: Option<u64>,
}

impl PageResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves the canonical id of a raw row using `ID_FIELDS`.
/// Only non-empty strings and numbers count as an id; a null, boolean or empty
/// value falls through to the next field. A row without any usable id field is
/// keyed by its own sorted-key JSON text.
pub fn normalize_id(row: &Map<String, Value>) -> String {
    ID_FIELDS
        .iter()
        .filter_map(|field| row.get(*field))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| Value::Object(row.clone()).to_string())
}

/// Parses a response body. Accepts `{"data": [...], "total": N}` or a bare array.
pub(crate) fn parse_page(body: &[u8], page: u32, page_size: u32) -> Result<PageResult, FetchError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let (rows, total) = match value {
        Value::Array(rows) => (rows, None),
        Value::Object(mut obj) => {
            let total = obj.get("total").and_then(as_u64);
            match obj.remove("data") {
                Some(Value::Array(rows)) => (rows, total),
                Some(Value::Null) => (Vec::new(), total),
                Some(_) => return Err(FetchError::Malformed("`data` is not a list".into())),
                None => return Err(FetchError::Malformed("missing `data` field".into())),
            }
        }
        _ => return Err(FetchError::Malformed("unexpected payload shape".into())),
    };

    let first_rank = page.saturating_sub(1).saturating_mul(page_size);
    let mut entries = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        let Value::Object(mut row) = row else {
            return Err(FetchError::Malformed(format!("row {i} is not an object")));
        };
        for field in DROPPED_FIELDS {
            row.remove(field);
        }
        let rank = row
            .get("rank")
            .and_then(as_u64)
            .filter(|&r| r > 0)
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or_else(|| first_rank.saturating_add(i as u32 + 1));
        entries.push(Entry {
            id: normalize_id(&row),
            rank,
            latest: row,
        });
    }

    Ok(PageResult {
        page,
        entries,
        total,
    })
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
