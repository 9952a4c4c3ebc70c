use std::{ops::Deref, sync::Arc};

use gallerysync_core::{ItemId, RESULT_MEDIA_TYPE, TransportEncoding};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedItem {
    pub id: ItemId,
    /// Displayable data URL.
    pub image: TransportEncoding,
    pub text: String,
    pub human_count: u64,
}

/// What to do when a result arrives for an id that is already in the gallery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Every valid result becomes a new entry.
    #[default]
    AppendAlways,
    /// A known id is refused with [`ValidationError::DuplicateId`].
    RejectDuplicate,
    /// A known id swaps the existing entry, keeping its position.
    ReplaceInPlace,
}

/// Point-in-time, read-only view of the gallery in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GallerySnapshot {
    items: Arc<[Arc<ProcessedItem>]>,
}

impl GallerySnapshot {
    pub fn get(&self, id: &str) -> Option<&ProcessedItem> {
        self.items.iter().find(|item| item.id == id).map(Arc::as_ref)
    }
}

impl Deref for GallerySnapshot {
    type Target = [Arc<ProcessedItem>];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

/// Ordered collection of processed results.
///
/// Owned by a single reconciliation task; readers only ever see
/// [`GallerySnapshot`]s published through a watch channel.
#[derive(Debug)]
pub struct GalleryStore {
    items: Vec<Arc<ProcessedItem>>,
    policy: DuplicatePolicy,
    snapshot_tx: watch::Sender<GallerySnapshot>,
}

impl GalleryStore {
    pub fn new(policy: DuplicatePolicy) -> Self {
        let (snapshot_tx, _) = watch::channel(GallerySnapshot::default());
        Self {
            items: Vec::new(),
            policy,
            snapshot_tx,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GallerySnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Validates a raw `data_processed` payload and applies it.
    ///
    /// On error the collection and the published snapshot are untouched.
    pub fn on_result_event(&mut self, raw: &Value) -> Result<Arc<ProcessedItem>, ValidationError> {
        let item = Arc::new(parse_result_event(raw)?);

        let existing = self.items.iter().position(|known| known.id == item.id);
        match (self.policy, existing) {
            (DuplicatePolicy::RejectDuplicate, Some(_)) => {
                return Err(ValidationError::DuplicateId(item.id.clone()));
            }
            (DuplicatePolicy::ReplaceInPlace, Some(index)) => {
                self.items[index] = Arc::clone(&item);
            }
            _ => self.items.push(Arc::clone(&item)),
        }

        self.publish();
        Ok(item)
    }

    fn publish(&self) {
        let items: Arc<[Arc<ProcessedItem>]> = self.items.iter().cloned().collect();
        self.snapshot_tx.send_replace(GallerySnapshot { items });
    }
}

fn parse_result_event(raw: &Value) -> Result<ProcessedItem, ValidationError> {
    let object = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let id = required_str(object, "sid")?;
    if id.trim().is_empty() {
        return Err(ValidationError::EmptyField("sid"));
    }
    let image = required_str(object, "image")?;
    let text = required_str(object, "text")?;
    let human_count = match object.get("human_count") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("human_count")),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| ValidationError::InvalidCount(value.to_string()))?,
    };

    Ok(ProcessedItem {
        id: id.to_owned(),
        image: reconstitute_image(image)?,
        text: text.to_owned(),
        human_count,
    })
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

// Results normally carry bare base64; an echoing service may send the data URL back as-is.
fn reconstitute_image(image: &str) -> Result<TransportEncoding, ValidationError> {
    let encoding = if image.starts_with("data:") {
        TransportEncoding::parse(image)
    } else {
        TransportEncoding::from_raw_base64(RESULT_MEDIA_TYPE, image)
    };
    encoding.map_err(ValidationError::InvalidImage)
}

#[cfg(test)]
mod tests {
    use gallerysync_core::CoreError;
    use serde_json::json;

    use super::*;

    fn result(sid: &str, text: &str, count: u64) -> Value {
        json!({ "sid": sid, "image": "/9j/4AAQ", "text": text, "human_count": count })
    }

    #[test]
    fn results_are_kept_in_arrival_order() {
        let mut store = GalleryStore::new(DuplicatePolicy::default());
        for (sid, count) in [("c", 1), ("a", 2), ("b", 0)] {
            store.on_result_event(&result(sid, "t", count)).unwrap();
        }
        let ids: Vec<_> = store.snapshot().iter().map(|item| item.id.clone()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn image_gets_a_jpeg_header() {
        let mut store = GalleryStore::new(DuplicatePolicy::default());
        let item = store.on_result_event(&result("abc", "dawn", 3)).unwrap();
        assert_eq!(item.image.to_string(), "data:image/jpeg;base64,/9j/4AAQ");
        assert_eq!(item.human_count, 3);
    }

    #[test]
    fn echoed_data_url_is_accepted_unchanged() {
        let mut store = GalleryStore::new(DuplicatePolicy::default());
        let raw = json!({
            "sid": "x",
            "image": "data:image/png;base64,iVBORw0KGgo=",
            "text": "echo",
            "human_count": 0
        });
        let item = store.on_result_event(&raw).unwrap();
        assert_eq!(item.image.media_type(), "image/png");
    }

    #[test]
    fn malformed_events_leave_the_gallery_untouched() {
        let mut store = GalleryStore::new(DuplicatePolicy::default());
        store.on_result_event(&result("keep", "t", 1)).unwrap();
        let before = store.snapshot();

        let cases = [
            (json!("just a string"), ValidationError::NotAnObject),
            (
                json!({ "image": "AAAA", "text": "t", "human_count": 1 }),
                ValidationError::MissingField("sid"),
            ),
            (
                json!({ "sid": "s", "image": "AAAA", "text": "t" }),
                ValidationError::MissingField("human_count"),
            ),
            (
                json!({ "sid": "  ", "image": "AAAA", "text": "t", "human_count": 1 }),
                ValidationError::EmptyField("sid"),
            ),
            (
                json!({ "sid": 7, "image": "AAAA", "text": "t", "human_count": 1 }),
                ValidationError::WrongType {
                    field: "sid",
                    expected: "a string",
                },
            ),
            (
                json!({ "sid": "s", "image": "AAAA", "text": "t", "human_count": -2 }),
                ValidationError::InvalidCount("-2".to_owned()),
            ),
            (
                json!({ "sid": "s", "image": "AAAA", "text": "t", "human_count": 1.5 }),
                ValidationError::InvalidCount("1.5".to_owned()),
            ),
            (
                json!({ "sid": "s", "image": "", "text": "t", "human_count": 1 }),
                ValidationError::InvalidImage(CoreError::MissingImage),
            ),
        ];

        for (raw, expected) in cases {
            assert_eq!(store.on_result_event(&raw).unwrap_err(), expected, "{raw}");
        }

        let corrupt = json!({ "sid": "s", "image": "%%%", "text": "t", "human_count": 1 });
        assert!(matches!(
            store.on_result_event(&corrupt),
            Err(ValidationError::InvalidImage(CoreError::InvalidBase64(_)))
        ));

        assert_eq!(store.snapshot(), before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_always_keeps_duplicate_ids() {
        let mut store = GalleryStore::new(DuplicatePolicy::AppendAlways);
        store.on_result_event(&result("dup", "first", 1)).unwrap();
        store.on_result_event(&result("dup", "second", 2)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn reject_duplicate_refuses_known_ids() {
        let mut store = GalleryStore::new(DuplicatePolicy::RejectDuplicate);
        store.on_result_event(&result("dup", "first", 1)).unwrap();
        let err = store.on_result_event(&result("dup", "second", 2)).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateId("dup".to_owned()));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "first");
    }

    #[test]
    fn replace_in_place_keeps_position() {
        let mut store = GalleryStore::new(DuplicatePolicy::ReplaceInPlace);
        store.on_result_event(&result("a", "old", 1)).unwrap();
        store.on_result_event(&result("b", "other", 1)).unwrap();
        store.on_result_event(&result("a", "new", 5)).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(snapshot[0].text, "new");
        assert_eq!(snapshot.get("a").map(|item| item.human_count), Some(5));
    }

    #[test]
    fn earlier_snapshots_do_not_change() {
        let mut store = GalleryStore::new(DuplicatePolicy::default());
        let receiver = store.subscribe();
        store.on_result_event(&result("a", "t", 1)).unwrap();
        let first = store.snapshot();

        store.on_result_event(&result("b", "t", 1)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(receiver.borrow().len(), 2);
    }

    #[test]
    fn policy_parses_from_config_names() {
        let policy: DuplicatePolicy = serde_json::from_str("\"reject_duplicate\"").unwrap();
        assert_eq!(policy, DuplicatePolicy::RejectDuplicate);
    }
}
