// Typed schema for the "Following" timeline response.
//
// envelope -> instructions -> entries -> item content -> user result
//
// Page-level shape problems become `FetchError::Api`; a single malformed
// entry becomes a `RecordParseError` for that entry only. Entries are kept
// as raw JSON so the snapshot stores exactly what the API returned.

use serde::Deserialize;
use serde_json::Value;

use super::error::{FetchError, RecordParseError};
use crate::db::models::AccountProfile;

/// One decoded page: the record entries and the cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    /// `None` when the API returned no cursor (or an empty one)
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeData {
    pub user: UserNode,
}

#[derive(Debug, Deserialize)]
pub struct UserNode {
    pub result: TimelineOwner,
}

#[derive(Debug, Deserialize)]
pub struct TimelineOwner {
    pub timeline: TimelineWrapper,
}

#[derive(Debug, Deserialize)]
pub struct TimelineWrapper {
    pub timeline: Timeline,
}

#[derive(Debug, Deserialize)]
pub struct Timeline {
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Instruction {
    TimelineAddEntries { entries: Vec<Value> },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CursorEntry {
    content: CursorContent,
}

#[derive(Debug, Deserialize)]
struct CursorContent {
    value: String,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    content: UserEntryContent,
}

#[derive(Debug, Deserialize)]
struct UserEntryContent {
    #[serde(rename = "itemContent")]
    item_content: ItemContent,
}

#[derive(Debug, Deserialize)]
struct ItemContent {
    user_results: UserResults,
}

#[derive(Debug, Deserialize)]
struct UserResults {
    result: UserResult,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum UserResult {
    User {
        rest_id: String,
        legacy: UserLegacy,
    },
    UserUnavailable {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct UserLegacy {
    screen_name: String,
    name: String,
    #[serde(default)]
    profile_image_url_https: Option<String>,
}

/// Number of trailing sentinel entries (top and bottom cursors).
const SENTINEL_ENTRIES: usize = 2;

impl Envelope {
    /// Records are the last instruction's entries minus the two trailing
    /// cursor entries; the next cursor is the second-to-last entry's value.
    pub fn into_page(self) -> Result<Page, FetchError> {
        let last = self
            .data
            .user
            .result
            .timeline
            .timeline
            .instructions
            .into_iter()
            .last()
            .ok_or_else(|| FetchError::api("timeline has no instructions"))?;

        let mut entries = match last {
            Instruction::TimelineAddEntries { entries } => entries,
            Instruction::Other => {
                return Err(FetchError::api("last instruction carries no entries"));
            }
        };

        if entries.len() < SENTINEL_ENTRIES {
            return Err(FetchError::api(format!(
                "expected at least {SENTINEL_ENTRIES} entries, got {}",
                entries.len()
            )));
        }

        let sentinels = entries.split_off(entries.len() - SENTINEL_ENTRIES);
        let cursor: CursorEntry = serde_json::from_value(sentinels[0].clone())
            .map_err(|e| FetchError::api(format!("malformed cursor entry: {e}")))?;

        let next_cursor = Some(cursor.content.value).filter(|c| !c.is_empty());

        Ok(Page {
            records: entries,
            next_cursor,
        })
    }
}

/// Decode a response body into a page.
pub fn parse_page(body: &str) -> Result<Page, FetchError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    envelope.into_page()
}

/// Turn one raw entry into the account it describes.
pub fn parse_account(entry: &Value) -> Result<AccountProfile, RecordParseError> {
    let entry = UserEntry::deserialize(entry)?;

    match entry.content.item_content.user_results.result {
        UserResult::User { rest_id, legacy } => Ok(AccountProfile {
            external_id: rest_id,
            handle: legacy.screen_name,
            display_name: legacy.name,
            avatar_url: legacy.profile_image_url_https,
        }),
        UserResult::UserUnavailable { reason } => Err(RecordParseError::Unavailable {
            reason: reason.unwrap_or_else(|| "unknown".to_string()),
        }),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn user_entry(id: &str, handle: &str) -> Value {
        json!({
            "entryId": format!("user-{id}"),
            "content": {
                "entryType": "TimelineTimelineItem",
                "itemContent": {
                    "itemType": "TimelineUser",
                    "user_results": {
                        "result": {
                            "__typename": "User",
                            "rest_id": id,
                            "legacy": {
                                "screen_name": handle,
                                "name": format!("{handle} name"),
                                "profile_image_url_https": format!("https://img.example/{id}.jpg")
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn cursor_entry(kind: &str, value: &str) -> Value {
        json!({
            "entryId": format!("cursor-{kind}-0"),
            "content": {
                "entryType": "TimelineTimelineCursor",
                "cursorType": kind,
                "value": value
            }
        })
    }

    /// A full response body with the given users and bottom cursor.
    pub fn page_body(users: &[(&str, &str)], next_cursor: &str) -> Value {
        let mut entries: Vec<Value> = users.iter().map(|(id, h)| user_entry(id, h)).collect();
        entries.push(cursor_entry("Bottom", next_cursor));
        entries.push(cursor_entry("Top", "-1|top"));
        json!({
            "data": {"user": {"result": {"timeline": {"timeline": {"instructions": [
                {"type": "TimelineClearCache"},
                {"type": "TimelineAddEntries", "entries": entries}
            ]}}}}}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_strips_sentinels_and_reads_cursor() {
        let body = page_body(&[("1", "one"), ("2", "two")], "123|456");
        let page = parse_page(&body.to_string()).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("123|456"));
        assert_eq!(parse_account(&page.records[1]).unwrap().handle, "two");
    }

    #[test]
    fn test_empty_cursor_is_none() {
        let body = page_body(&[], "");
        let page = parse_page(&body.to_string()).unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_too_few_entries_is_api_error() {
        let body = json!({"data": {"user": {"result": {"timeline": {"timeline": {"instructions": [
            {"type": "TimelineAddEntries", "entries": [cursor_entry("Bottom", "x")]}
        ]}}}}}});
        let err = parse_page(&body.to_string()).unwrap_err();
        assert!(matches!(err, FetchError::Api { .. }));
    }

    #[test]
    fn test_missing_data_is_api_error() {
        let err = parse_page(r#"{"errors":[{"message":"Rate limit exceeded"}]}"#).unwrap_err();
        assert!(matches!(err, FetchError::Api { status: None, .. }));
    }

    #[test]
    fn test_last_instruction_without_entries_is_api_error() {
        let body = json!({"data": {"user": {"result": {"timeline": {"timeline": {"instructions": [
            {"type": "TimelineAddEntries", "entries": []},
            {"type": "TimelineTerminateTimeline", "direction": "Top"}
        ]}}}}}});
        assert!(parse_page(&body.to_string()).is_err());
    }

    #[test]
    fn test_parse_account_fields() {
        let account = parse_account(&user_entry("99", "ninety_nine")).unwrap();
        assert_eq!(account.external_id, "99");
        assert_eq!(account.handle, "ninety_nine");
        assert_eq!(account.display_name, "ninety_nine name");
        assert_eq!(
            account.avatar_url.as_deref(),
            Some("https://img.example/99.jpg")
        );
    }

    #[test]
    fn test_unavailable_user() {
        let entry = json!({"content": {"itemContent": {"user_results": {"result": {
            "__typename": "UserUnavailable", "reason": "Suspended"
        }}}}});
        assert_eq!(
            parse_account(&entry).unwrap_err(),
            RecordParseError::Unavailable {
                reason: "Suspended".to_string()
            }
        );
    }

    #[test]
    fn test_cursor_entry_in_records_is_shape_error() {
        let err = parse_account(&cursor_entry("Bottom", "1|2")).unwrap_err();
        assert!(matches!(err, RecordParseError::Shape(_)));
    }
}
