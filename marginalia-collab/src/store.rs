//! Replicated annotation store backed by a Yrs document.
//!
//! ## Layout of the shared document
//!
//! ```text
//! Doc
//! ├── "highlights"        Map   id → Map { start, end, tag, author, text,
//! │                                        paragraph_ref, created_at,
//! │                                        comments: Array<json> }
//! ├── "tags"              Map   tag name → true          (tag registry)
//! ├── "tag_order:{tag}"   Array<id>                      (one root per tag)
//! ├── "fields"            Map   field name → true        (field registry)
//! └── "field:{name}"      Text                           (one root per field)
//! ```
//!
//! Per-highlight fields are separate map entries, so concurrent edits of
//! different fields of one highlight both survive and edits of the same
//! field converge last-writer-wins. Tag orders and free-text fields are
//! root-level types: two replicas creating the same tag concurrently end up
//! writing into one shared sequence instead of racing to install competing
//! nested arrays.
//!
//! Comments are serialized as JSON records in the highlight's own array; the
//! array is created together with the highlight, so concurrent appends from
//! any replica land in the same sequence.
//!
//! Every blob leaving the store (local updates, diffs, full state, state
//! vectors) is sealed with [`envelope::seal`]; incoming blobs must open
//! cleanly before they are decoded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Text, Transact, TransactionMut, Update, WriteTxn,
};

use marginalia_core::{
    now_millis, AnnotationError, Comment, DocumentInfo, Highlight, HighlightId, HighlightMetadata,
    HighlightSpan, UNTAGGED,
};

use crate::envelope;
use crate::presence::{AwarenessMessage, PresenceRoom, PresenceState};

const HIGHLIGHTS: &str = "highlights";
const TAGS: &str = "tags";
const FIELDS: &str = "fields";

const F_START: &str = "start";
const F_END: &str = "end";
const F_TAG: &str = "tag";
const F_AUTHOR: &str = "author";
const F_TEXT: &str = "text";
const F_PARAGRAPH: &str = "paragraph_ref";
const F_CREATED: &str = "created_at";
const F_COMMENTS: &str = "comments";

fn tag_order_key(tag: &str) -> String {
    format!("tag_order:{tag}")
}

fn field_key(name: &str) -> String {
    format!("field:{name}")
}

/// Map a caller-supplied tag onto the stored representation. Empty strings
/// and the reserved bucket name both mean "untagged".
fn normalize_tag(tag: Option<&str>) -> Option<String> {
    tag.filter(|t| !t.is_empty() && *t != UNTAGGED).map(str::to_string)
}

fn bucket_of(tag: &Option<String>) -> &str {
    tag.as_deref().unwrap_or(UNTAGGED)
}

fn optional_string(value: Option<String>) -> Any {
    match value {
        Some(s) => Any::from(s),
        None => Any::Null,
    }
}

// ─── Reading Yrs values ─────────────────────────────────────────────

fn out_str(value: &Out) -> Option<&str> {
    match value {
        Out::Any(Any::String(s)) => Some(s.as_ref()),
        _ => None,
    }
}

fn out_usize(value: &Out) -> Option<usize> {
    match value {
        Out::Any(Any::Number(n)) if *n >= 0.0 => Some(*n as usize),
        Out::Any(Any::BigInt(n)) if *n >= 0 => Some(*n as usize),
        _ => None,
    }
}

fn out_opt_string(value: Option<Out>) -> Option<String> {
    value.as_ref().and_then(out_str).map(str::to_string)
}

fn read_highlight<T: ReadTxn>(txn: &T, id: &str, record: &MapRef) -> Option<Highlight> {
    let start = record.get(txn, F_START).as_ref().and_then(out_usize);
    let end = record.get(txn, F_END).as_ref().and_then(out_usize);
    let (Some(start), Some(end)) = (start, end) else {
        log::warn!("Highlight {} has no valid range; skipping", id);
        return None;
    };

    Some(Highlight {
        id: id.to_string(),
        start,
        end,
        tag: out_opt_string(record.get(txn, F_TAG)),
        author: out_opt_string(record.get(txn, F_AUTHOR)).unwrap_or_default(),
        text: out_opt_string(record.get(txn, F_TEXT)).unwrap_or_default(),
        paragraph_ref: out_opt_string(record.get(txn, F_PARAGRAPH)),
        created_at: record
            .get(txn, F_CREATED)
            .as_ref()
            .and_then(out_usize)
            .unwrap_or_default() as u64,
    })
}

fn array_ids<T: ReadTxn>(txn: &T, array: &ArrayRef) -> Vec<String> {
    array
        .iter(txn)
        .filter_map(|v| out_str(&v).map(str::to_string))
        .collect()
}

/// Remove every occurrence of `id` from `array`. Returns the first index it
/// was found at.
fn remove_id(txn: &mut TransactionMut, array: &ArrayRef, id: &str) -> Option<u32> {
    let positions: Vec<u32> = array
        .iter(&*txn)
        .enumerate()
        .filter(|(_, v)| out_str(v) == Some(id))
        .map(|(i, _)| i as u32)
        .collect();
    for &idx in positions.iter().rev() {
        array.remove(txn, idx);
    }
    positions.first().copied()
}

/// Byte offset of the `char_idx`-th character, or `None` past the end.
fn byte_offset(s: &str, char_idx: usize) -> Option<usize> {
    s.char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(s.len()))
        .nth(char_idx)
}

// ───────────────────────────────────────────────────────────────────
// AnnotationStore
// ───────────────────────────────────────────────────────────────────

/// One replica of a document's annotation state.
///
/// Every local mutation runs in its own Yrs transaction; the update it
/// produces is queued for [`drain_local_updates`](Self::drain_local_updates)
/// so the transport can ship it to other replicas.
pub struct AnnotationStore {
    doc: Doc,
    info: DocumentInfo,
    highlights: MapRef,
    tags: MapRef,
    fields: MapRef,
    presence: PresenceRoom,
    outbox: Vec<Vec<u8>>,
    version: u64,
    persisted_version: u64,
}

impl AnnotationStore {
    pub fn new(info: DocumentInfo) -> Self {
        Self::from_doc(Doc::new(), info)
    }

    /// Replica with a fixed client id, for reproducible merges in tests and
    /// tooling.
    pub fn with_client_id(info: DocumentInfo, client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id), info)
    }

    fn from_doc(doc: Doc, info: DocumentInfo) -> Self {
        let highlights = doc.get_or_insert_map(HIGHLIGHTS);
        let tags = doc.get_or_insert_map(TAGS);
        let fields = doc.get_or_insert_map(FIELDS);
        Self {
            doc,
            info,
            highlights,
            tags,
            fields,
            presence: PresenceRoom::new(Uuid::new_v4(), "anonymous"),
            outbox: Vec::new(),
            version: 0,
            persisted_version: 0,
        }
    }

    /// Rebuild a replica from a persisted full-state snapshot.
    ///
    /// The result starts clean: version 0, nothing queued for broadcast.
    /// Returns `None` if the snapshot cannot be decoded or integrated.
    pub fn from_snapshot(info: DocumentInfo, snapshot: &[u8]) -> Option<Self> {
        let mut store = Self::new(info);
        if !store.apply_update(snapshot) {
            return None;
        }
        store.version = 0;
        store.outbox.clear();
        Some(store)
    }

    /// Replace the presence room, typically to set the local identity.
    pub fn with_presence(mut self, presence: PresenceRoom) -> Self {
        self.presence = presence;
        self
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    /// Number of local mutations and merged remote updates applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether changes exist that no successful flush has covered yet.
    pub fn is_dirty(&self) -> bool {
        self.version != self.persisted_version
    }

    /// Record that a snapshot taken at `version` reached durable storage.
    pub fn mark_persisted(&mut self, version: u64) {
        self.persisted_version = self.persisted_version.max(version);
    }

    fn record_local(&mut self, update: Vec<u8>) {
        self.outbox.push(envelope::seal(&update));
        self.version += 1;
    }

    fn record<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        match self.highlights.get(txn, id) {
            Some(Out::YMap(record)) => Some(record),
            Some(_) => {
                log::warn!("Highlight {} is not a map record; ignoring", id);
                None
            }
            None => None,
        }
    }

    // ─── Highlights ─────────────────────────────────────────────────

    /// Create a highlight over `range` (character offsets).
    ///
    /// The range must be non-empty and inside the document; otherwise nothing
    /// is written.
    pub fn add_highlight(
        &mut self,
        range: Range<usize>,
        tag: Option<&str>,
        author: &str,
        metadata: HighlightMetadata,
    ) -> Result<HighlightId, AnnotationError> {
        if !self.info.contains_range(range.start, range.end) {
            return Err(AnnotationError::InvalidRange {
                start: range.start,
                end: range.end,
                len: self.info.char_len,
            });
        }

        let id = Uuid::new_v4().to_string();
        let tag = normalize_tag(tag);
        let paragraph_ref = metadata
            .paragraph_ref
            .or_else(|| self.info.paragraph_at(range.start).map(|n| n.to_string()));

        let update = {
            let mut txn = self.doc.transact_mut();
            let record = self.highlights.insert(&mut txn, id.as_str(), MapPrelim::default());
            record.insert(&mut txn, F_START, range.start as f64);
            record.insert(&mut txn, F_END, range.end as f64);
            record.insert(&mut txn, F_TAG, optional_string(tag.clone()));
            record.insert(&mut txn, F_AUTHOR, author.to_string());
            record.insert(&mut txn, F_TEXT, metadata.text);
            record.insert(&mut txn, F_PARAGRAPH, optional_string(paragraph_ref));
            record.insert(&mut txn, F_CREATED, now_millis() as f64);
            record.insert(&mut txn, F_COMMENTS, ArrayPrelim::default());

            let bucket = bucket_of(&tag);
            self.tags.insert(&mut txn, bucket, true);
            let order = txn.get_or_insert_array(tag_order_key(bucket));
            order.push_back(&mut txn, id.clone());

            txn.encode_update_v1()
        };
        self.record_local(update);

        log::debug!("Added highlight {} [{}, {})", id, range.start, range.end);
        Ok(id)
    }

    /// Drop a highlight together with its comments and tag-order entries.
    pub fn remove_highlight(&mut self, id: &str) -> bool {
        let update = {
            let mut txn = self.doc.transact_mut();
            if self.highlights.remove(&mut txn, id).is_none() {
                log::debug!("remove_highlight: unknown highlight {}", id);
                return false;
            }
            let buckets: Vec<String> = self.tags.keys(&txn).map(str::to_string).collect();
            for bucket in buckets {
                let order = txn.get_or_insert_array(tag_order_key(&bucket));
                remove_id(&mut txn, &order, id);
            }
            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    /// Reassign a highlight's tag. `None` moves it to the untagged bucket.
    pub fn update_tag(&mut self, id: &str, new_tag: Option<&str>) -> bool {
        let new_tag = normalize_tag(new_tag);
        let update = {
            let mut txn = self.doc.transact_mut();
            let Some(record) = self.record(&txn, id) else {
                log::debug!("update_tag: unknown highlight {}", id);
                return false;
            };
            let old_tag = out_opt_string(record.get(&txn, F_TAG));
            if old_tag == new_tag {
                return true;
            }

            record.insert(&mut txn, F_TAG, optional_string(new_tag.clone()));
            let old_order = txn.get_or_insert_array(tag_order_key(bucket_of(&old_tag)));
            remove_id(&mut txn, &old_order, id);
            let bucket = bucket_of(&new_tag);
            self.tags.insert(&mut txn, bucket, true);
            let order = txn.get_or_insert_array(tag_order_key(bucket));
            order.push_back(&mut txn, id.to_string());

            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    /// Set or clear the paragraph reference shown for a highlight.
    pub fn update_para_ref(&mut self, id: &str, value: Option<&str>) -> bool {
        let update = {
            let mut txn = self.doc.transact_mut();
            let Some(record) = self.record(&txn, id) else {
                log::debug!("update_para_ref: unknown highlight {}", id);
                return false;
            };
            record.insert(&mut txn, F_PARAGRAPH, optional_string(value.map(str::to_string)));
            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    pub fn get_highlight(&self, id: &str) -> Option<Highlight> {
        let txn = self.doc.transact();
        let record = self.record(&txn, id)?;
        read_highlight(&txn, id, &record)
    }

    /// Snapshot of every highlight, ordered by `(start, end, id)`.
    pub fn get_all_highlights(&self) -> Vec<Highlight> {
        let txn = self.doc.transact();
        let mut all: Vec<Highlight> = self
            .highlights
            .iter(&txn)
            .filter_map(|(id, value)| match value {
                Out::YMap(record) => read_highlight(&txn, id, &record),
                _ => None,
            })
            .collect();
        all.sort_by(|a, b| (a.start, a.end, &a.id).cmp(&(b.start, b.end, &b.id)));
        all
    }

    /// Resolver input for the current highlights.
    pub fn spans(&self) -> Vec<HighlightSpan> {
        self.get_all_highlights().iter().map(HighlightSpan::from).collect()
    }

    pub fn highlight_count(&self) -> usize {
        let txn = self.doc.transact();
        self.highlights.len(&txn) as usize
    }

    // ─── Comments ───────────────────────────────────────────────────

    /// Append a comment to a highlight's thread. Returns the comment id, or
    /// `None` if the highlight is gone.
    pub fn add_comment(&mut self, highlight_id: &str, author: &str, text: &str) -> Option<String> {
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            highlight_id: highlight_id.to_string(),
            author: author.to_string(),
            text: text.to_string(),
            created_at: now_millis(),
        };
        let json = match serde_json::to_string(&comment) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize comment on {}: {}", highlight_id, e);
                return None;
            }
        };

        let update = {
            let mut txn = self.doc.transact_mut();
            let Some(record) = self.record(&txn, highlight_id) else {
                log::debug!("add_comment: unknown highlight {}", highlight_id);
                return None;
            };
            let thread = match record.get(&txn, F_COMMENTS) {
                Some(Out::YArray(thread)) => thread,
                _ => record.insert(&mut txn, F_COMMENTS, ArrayPrelim::default()),
            };
            thread.push_back(&mut txn, json);
            txn.encode_update_v1()
        };
        self.record_local(update);
        Some(comment.id)
    }

    /// A highlight's comment thread in append order.
    pub fn comments(&self, highlight_id: &str) -> Vec<Comment> {
        let txn = self.doc.transact();
        let Some(record) = self.record(&txn, highlight_id) else {
            return Vec::new();
        };
        let Some(Out::YArray(thread)) = record.get(&txn, F_COMMENTS) else {
            return Vec::new();
        };
        thread
            .iter(&txn)
            .filter_map(|v| {
                let json = out_str(&v)?;
                match serde_json::from_str::<Comment>(json) {
                    Ok(comment) => Some(comment),
                    Err(e) => {
                        log::warn!("Skipping malformed comment on {}: {}", highlight_id, e);
                        None
                    }
                }
            })
            .collect()
    }

    // ─── Tag orders ─────────────────────────────────────────────────

    /// Every tag bucket that has been used, sorted.
    pub fn tags(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut all: BTreeSet<String> = self.tags.keys(&txn).map(str::to_string).collect();
        for (id, value) in self.highlights.iter(&txn) {
            if let Out::YMap(record) = value {
                if let Some(h) = read_highlight(&txn, id, &record) {
                    all.insert(h.bucket().to_string());
                }
            }
        }
        all.into_iter().collect()
    }

    /// Ordered highlight ids for `tag`.
    ///
    /// The stored sequence is normalized on read: duplicates and ids that no
    /// longer belong to the bucket are dropped, and bucket members missing
    /// from the sequence are appended in `(start, id)` order.
    pub fn tag_order(&self, tag: &str) -> Vec<HighlightId> {
        let members: Vec<Highlight> = self
            .get_all_highlights()
            .into_iter()
            .filter(|h| h.bucket() == tag)
            .collect();
        let member_ids: HashSet<&str> = members.iter().map(|h| h.id.as_str()).collect();

        let order = self.doc.get_or_insert_array(tag_order_key(tag));
        let stored = array_ids(&self.doc.transact(), &order);

        let mut seen = BTreeSet::new();
        let mut ordered: Vec<HighlightId> = stored
            .into_iter()
            .filter(|id| member_ids.contains(id.as_str()) && seen.insert(id.clone()))
            .collect();

        // `members` is already sorted by start, then end, then id.
        let mut missing: Vec<&Highlight> = members.iter().filter(|h| !seen.contains(&h.id)).collect();
        missing.sort_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)));
        ordered.extend(missing.into_iter().map(|h| h.id.clone()));
        ordered
    }

    /// Replace the order of `tag`. Every id must be a highlight in that
    /// bucket; bucket members not listed are appended.
    pub fn set_tag_order(&mut self, tag: &str, ordered_ids: &[&str]) -> bool {
        let members: Vec<Highlight> = self
            .get_all_highlights()
            .into_iter()
            .filter(|h| h.bucket() == tag)
            .collect();
        if let Some(unknown) = ordered_ids
            .iter()
            .find(|id| !members.iter().any(|h| h.id == **id))
        {
            log::debug!("set_tag_order: {} is not in tag {}", unknown, tag);
            return false;
        }

        let mut seen = BTreeSet::new();
        let mut final_order: Vec<String> = ordered_ids
            .iter()
            .filter(|id| seen.insert(id.to_string()))
            .map(|id| id.to_string())
            .collect();
        final_order.extend(
            members
                .iter()
                .filter(|h| !seen.contains(&h.id))
                .map(|h| h.id.clone()),
        );

        let update = {
            let mut txn = self.doc.transact_mut();
            self.tags.insert(&mut txn, tag, true);
            let order = txn.get_or_insert_array(tag_order_key(tag));
            let len = order.len(&txn);
            if len > 0 {
                order.remove_range(&mut txn, 0, len);
            }
            for id in final_order {
                order.push_back(&mut txn, id);
            }
            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    /// Move a highlight from bucket `from_tag` to position `position` of
    /// `to_tag`, retagging it. Moving within one tag reorders it.
    ///
    /// Fails if the highlight is unknown or no longer in `from_tag`.
    pub fn move_highlight_to_tag(&mut self, id: &str, from_tag: &str, to_tag: &str, position: usize) -> bool {
        let to = normalize_tag(Some(to_tag));
        let update = {
            let mut txn = self.doc.transact_mut();
            let Some(record) = self.record(&txn, id) else {
                log::debug!("move_highlight_to_tag: unknown highlight {}", id);
                return false;
            };
            let current = out_opt_string(record.get(&txn, F_TAG));
            if bucket_of(&current) != from_tag {
                log::debug!(
                    "move_highlight_to_tag: {} is in {} not {}",
                    id,
                    bucket_of(&current),
                    from_tag
                );
                return false;
            }

            let source = txn.get_or_insert_array(tag_order_key(from_tag));
            remove_id(&mut txn, &source, id);
            let target = bucket_of(&to);
            self.tags.insert(&mut txn, target, true);
            let order = txn.get_or_insert_array(tag_order_key(target));
            remove_id(&mut txn, &order, id);
            let index = u32::try_from(position).unwrap_or(u32::MAX).min(order.len(&txn));
            order.insert(&mut txn, index, id.to_string());

            if current != to {
                record.insert(&mut txn, F_TAG, optional_string(to.clone()));
            }
            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    // ─── Free text fields ───────────────────────────────────────────

    /// Names of every free-text field, sorted.
    pub fn fields(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut names: Vec<String> = self.fields.keys(&txn).map(str::to_string).collect();
        names.sort();
        names
    }

    pub fn field_text(&self, name: &str) -> Option<String> {
        if !self.has_field(name) {
            return None;
        }
        let text = self.doc.get_or_insert_text(field_key(name));
        let txn = self.doc.transact();
        Some(text.get_string(&txn))
    }

    fn has_field(&self, name: &str) -> bool {
        let txn = self.doc.transact();
        self.fields.contains_key(&txn, name)
    }

    /// Insert `chunk` at character `index`. Fails if `index` is past the end.
    pub fn insert_field_text(&mut self, name: &str, index: usize, chunk: &str) -> bool {
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(field_key(name));
            let current = text.get_string(&txn);
            let Some(at) = byte_offset(&current, index) else {
                log::debug!("insert_field_text: index {} past end of {}", index, name);
                return false;
            };
            self.fields.insert(&mut txn, name, true);
            text.insert(&mut txn, at as u32, chunk);
            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    /// Delete `len` characters starting at character `index`.
    pub fn delete_field_text(&mut self, name: &str, index: usize, len: usize) -> bool {
        if !self.has_field(name) {
            log::debug!("delete_field_text: unknown field {}", name);
            return false;
        }
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(field_key(name));
            let current = text.get_string(&txn);
            let end = index.checked_add(len).and_then(|end| byte_offset(&current, end));
            let (Some(from), Some(to)) = (byte_offset(&current, index), end) else {
                log::debug!("delete_field_text: [{}, +{}) out of range for {}", index, len, name);
                return false;
            };
            if to > from {
                text.remove_range(&mut txn, from as u32, (to - from) as u32);
            }
            txn.encode_update_v1()
        };
        self.record_local(update);
        true
    }

    /// Replace the whole field. Concurrent edits by others still merge at
    /// character level.
    pub fn set_field_text(&mut self, name: &str, value: &str) {
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(field_key(name));
            self.fields.insert(&mut txn, name, true);
            let len = text.len(&txn);
            if len > 0 {
                text.remove_range(&mut txn, 0, len);
            }
            text.insert(&mut txn, 0, value);
            txn.encode_update_v1()
        };
        self.record_local(update);
    }

    // ─── Replication ────────────────────────────────────────────────

    /// The entire replicated state as one update blob.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        envelope::seal(&txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Encoded state vector, for incremental sync with a peer.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        envelope::seal(&txn.state_vector().encode_v1())
    }

    /// Everything this replica has that the peer behind `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Option<Vec<u8>> {
        let payload = match envelope::open(state_vector) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Dropping malformed state vector ({} bytes): {}", state_vector.len(), e);
                return None;
            }
        };
        let sv = match StateVector::decode_v1(payload) {
            Ok(sv) => sv,
            Err(e) => {
                log::warn!("Dropping malformed state vector ({} bytes): {}", state_vector.len(), e);
                return None;
            }
        };
        let txn = self.doc.transact();
        Some(envelope::seal(&txn.encode_diff_v1(&sv)))
    }

    /// Merge a remote update. Malformed blobs are logged and dropped.
    ///
    /// Applying the same update twice, or updates in any order, converges to
    /// the same state. The version only advances when the update added or
    /// deleted something, so redelivery leaves a clean store clean.
    pub fn apply_update(&mut self, bytes: &[u8]) -> bool {
        let payload = match envelope::open(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Dropping malformed update ({} bytes): {}", bytes.len(), e);
                return false;
            }
        };
        let update = match Update::decode_v1(payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping undecodable update ({} bytes): {}", bytes.len(), e);
                return false;
            }
        };
        let changed = {
            let mut txn = self.doc.transact_mut();
            let before = txn.state_vector();
            if let Err(e) = txn.apply_update(update) {
                log::warn!("Dropping update that failed to integrate: {}", e);
                return false;
            }
            txn.state_vector() != before || !txn.delete_set().is_empty()
        };
        if changed {
            self.version += 1;
        } else {
            log::trace!("Update of {} bytes was already integrated", bytes.len());
        }
        true
    }

    /// Updates produced by local mutations since the last drain.
    pub fn drain_local_updates(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Publish the local cursor/selection. Returns the encoded message for
    /// the ephemeral channel.
    pub fn set_local_presence(
        &mut self,
        cursor_offset: Option<usize>,
        selection: Option<(usize, usize)>,
    ) -> Result<Vec<u8>, String> {
        self.presence.set_local_presence(cursor_offset, selection).encode()
    }

    pub fn apply_presence(&mut self, bytes: &[u8]) -> bool {
        self.presence.apply_presence(bytes)
    }

    pub fn get_all_presence(&self) -> HashMap<Uuid, PresenceState> {
        self.presence.get_all_presence()
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceRoom {
        &mut self.presence
    }

    /// Encoded `Leave` for the local collaborator.
    pub fn leave_presence(&self) -> Result<Vec<u8>, String> {
        AwarenessMessage::Leave {
            collaborator_id: self.presence.local_id(),
        }
        .encode()
    }
}

impl std::fmt::Debug for AnnotationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationStore")
            .field("char_len", &self.info.char_len)
            .field("highlights", &self.highlight_count())
            .field("version", &self.version)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AnnotationStore {
        AnnotationStore::new(DocumentInfo::new(100))
    }

    fn add(store: &mut AnnotationStore, range: Range<usize>, tag: Option<&str>) -> HighlightId {
        store
            .add_highlight(range, tag, "ada", HighlightMetadata::default())
            .unwrap()
    }

    // ── Highlight tests ──────────────────────────────────────────

    #[test]
    fn test_add_and_get_highlight() {
        let mut store = store();
        let id = store
            .add_highlight(5..12, Some("claim"), "ada", HighlightMetadata::with_text("snippet"))
            .unwrap();

        let h = store.get_highlight(&id).unwrap();
        assert_eq!((h.start, h.end), (5, 12));
        assert_eq!(h.tag.as_deref(), Some("claim"));
        assert_eq!(h.author, "ada");
        assert_eq!(h.text, "snippet");
        assert!(h.created_at > 0);
        assert_eq!(store.highlight_count(), 1);
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let mut store = store();
        for range in [5..5, 7..3, 90..101] {
            let err = store
                .add_highlight(range.clone(), None, "ada", HighlightMetadata::default())
                .unwrap_err();
            assert!(matches!(err, AnnotationError::InvalidRange { .. }), "{range:?}");
        }
        assert_eq!(store.highlight_count(), 0);
        assert!(store.drain_local_updates().is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_whole_document_range_accepted() {
        let mut store = store();
        assert!(store
            .add_highlight(0..100, None, "ada", HighlightMetadata::default())
            .is_ok());
    }

    #[test]
    fn test_paragraph_ref_derived_from_document() {
        let info = DocumentInfo::from_text("One.\n\nTwo two two.");
        let mut store = AnnotationStore::new(info);
        let id = store
            .add_highlight(7..10, None, "ada", HighlightMetadata::default())
            .unwrap();
        assert_eq!(store.get_highlight(&id).unwrap().paragraph_ref.as_deref(), Some("2"));

        let explicit = HighlightMetadata {
            text: String::new(),
            paragraph_ref: Some("p. 4".into()),
        };
        let id = store.add_highlight(0..3, None, "ada", explicit).unwrap();
        assert_eq!(store.get_highlight(&id).unwrap().paragraph_ref.as_deref(), Some("p. 4"));
    }

    #[test]
    fn test_unknown_id_operations_return_false() {
        let mut store = store();
        assert!(!store.update_tag("missing", Some("x")));
        assert!(!store.update_para_ref("missing", Some("1")));
        assert!(!store.move_highlight_to_tag("missing", UNTAGGED, "x", 0));
        assert!(!store.remove_highlight("missing"));
        assert!(store.add_comment("missing", "ada", "hi").is_none());
        assert!(!store.set_tag_order("x", &["missing"]));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_update_para_ref() {
        let mut store = store();
        let id = add(&mut store, 0..4, None);
        assert!(store.update_para_ref(&id, Some("12")));
        assert_eq!(store.get_highlight(&id).unwrap().paragraph_ref.as_deref(), Some("12"));
        assert!(store.update_para_ref(&id, None));
        assert_eq!(store.get_highlight(&id).unwrap().paragraph_ref, None);
    }

    #[test]
    fn test_remove_highlight_drops_everything() {
        let mut store = store();
        let id = add(&mut store, 0..4, Some("claim"));
        store.add_comment(&id, "bob", "why?").unwrap();

        assert!(store.remove_highlight(&id));
        assert!(store.get_highlight(&id).is_none());
        assert!(store.comments(&id).is_empty());
        assert!(store.tag_order("claim").is_empty());
    }

    #[test]
    fn test_all_highlights_sorted_by_start() {
        let mut store = store();
        add(&mut store, 50..60, None);
        add(&mut store, 10..20, None);
        add(&mut store, 30..40, None);
        let starts: Vec<usize> = store.get_all_highlights().iter().map(|h| h.start).collect();
        assert_eq!(starts, vec![10, 30, 50]);
        assert_eq!(store.spans().len(), 3);
    }

    // ── Comment tests ────────────────────────────────────────────

    #[test]
    fn test_comments_keep_append_order() {
        let mut store = store();
        let id = add(&mut store, 0..4, None);
        store.add_comment(&id, "ada", "first").unwrap();
        store.add_comment(&id, "bob", "second").unwrap();

        let thread = store.comments(&id);
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].text, "first");
        assert_eq!(thread[1].author, "bob");
        assert!(thread.iter().all(|c| c.highlight_id == id));
    }

    // ── Tag order tests ──────────────────────────────────────────

    #[test]
    fn test_tag_order_follows_creation() {
        let mut store = store();
        let a = add(&mut store, 0..4, Some("claim"));
        let b = add(&mut store, 10..14, Some("claim"));
        let u = add(&mut store, 20..24, None);

        assert_eq!(store.tag_order("claim"), vec![a, b]);
        assert_eq!(store.tag_order(UNTAGGED), vec![u]);
        assert_eq!(store.tags(), vec![UNTAGGED.to_string(), "claim".to_string()]);
    }

    #[test]
    fn test_update_tag_moves_between_orders() {
        let mut store = store();
        let a = add(&mut store, 0..4, Some("claim"));
        assert!(store.update_tag(&a, Some("evidence")));

        assert!(store.tag_order("claim").is_empty());
        assert_eq!(store.tag_order("evidence"), vec![a.clone()]);
        assert_eq!(store.get_highlight(&a).unwrap().tag.as_deref(), Some("evidence"));

        assert!(store.update_tag(&a, None));
        assert_eq!(store.tag_order(UNTAGGED), vec![a]);
    }

    #[test]
    fn test_set_tag_order() {
        let mut store = store();
        let a = add(&mut store, 0..4, Some("claim"));
        let b = add(&mut store, 10..14, Some("claim"));
        let c = add(&mut store, 20..24, Some("claim"));

        assert!(store.set_tag_order("claim", &[c.as_str(), a.as_str()]));
        assert_eq!(store.tag_order("claim"), vec![c.clone(), a.clone(), b.clone()]);

        let other = add(&mut store, 30..34, Some("other"));
        assert!(!store.set_tag_order("claim", &[other.as_str()]));
        assert_eq!(store.tag_order("claim"), vec![c, a, b]);
    }

    #[test]
    fn test_move_highlight_to_tag_at_position() {
        let mut store = store();
        let a = add(&mut store, 0..4, Some("claim"));
        let b = add(&mut store, 10..14, Some("evidence"));
        let c = add(&mut store, 20..24, Some("evidence"));

        assert!(store.move_highlight_to_tag(&a, "claim", "evidence", 1));
        assert_eq!(store.tag_order("evidence"), vec![b.clone(), a.clone(), c.clone()]);
        assert_eq!(store.get_highlight(&a).unwrap().bucket(), "evidence");

        // Stale `from` is rejected.
        assert!(!store.move_highlight_to_tag(&a, "claim", UNTAGGED, 0));

        // Reorder within the same tag; positions past the end clamp.
        assert!(store.move_highlight_to_tag(&b, "evidence", "evidence", 99));
        assert_eq!(store.tag_order("evidence"), vec![a, c, b]);
    }

    #[test]
    fn test_reserved_bucket_name_means_untagged() {
        let mut store = store();
        let id = add(&mut store, 0..4, Some(UNTAGGED));
        assert_eq!(store.get_highlight(&id).unwrap().tag, None);
        let id2 = add(&mut store, 5..9, Some(""));
        assert_eq!(store.get_highlight(&id2).unwrap().tag, None);
    }

    // ── Free text tests ──────────────────────────────────────────

    #[test]
    fn test_field_text_editing() {
        let mut store = store();
        assert_eq!(store.field_text("notes"), None);

        assert!(store.insert_field_text("notes", 0, "héllo"));
        assert!(store.insert_field_text("notes", 5, " world"));
        assert!(store.insert_field_text("notes", 1, "_"));
        assert_eq!(store.field_text("notes").as_deref(), Some("h_éllo world"));

        assert!(store.delete_field_text("notes", 1, 2));
        assert_eq!(store.field_text("notes").as_deref(), Some("hllo world"));

        assert!(!store.insert_field_text("notes", 50, "x"));
        assert!(!store.delete_field_text("notes", 8, 10));
        assert!(!store.delete_field_text("draft", 0, 1));
        assert!(!store.delete_field_text("notes", 1, usize::MAX));
        assert!(!store.delete_field_text("notes", usize::MAX, 1));
        assert_eq!(store.field_text("notes").as_deref(), Some("hllo world"));

        store.set_field_text("draft", "v2");
        assert_eq!(store.field_text("draft").as_deref(), Some("v2"));
        assert_eq!(store.fields(), vec!["draft".to_string(), "notes".to_string()]);
    }

    // ── Replication tests ────────────────────────────────────────

    #[test]
    fn test_local_updates_drained() {
        let mut store = store();
        add(&mut store, 0..4, None);
        store.insert_field_text("notes", 0, "x");

        let updates = store.drain_local_updates();
        assert_eq!(updates.len(), 2);
        assert!(store.drain_local_updates().is_empty());
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_full_state_rehydrates() {
        let mut source = store();
        let id = add(&mut source, 3..9, Some("claim"));
        source.add_comment(&id, "ada", "note").unwrap();
        source.set_field_text("notes", "draft");

        let mut copy = store();
        assert!(copy.apply_update(&source.full_state()));
        assert_eq!(copy.get_all_highlights(), source.get_all_highlights());
        assert_eq!(copy.comments(&id), source.comments(&id));
        assert_eq!(copy.tag_order("claim"), vec![id]);
        assert_eq!(copy.field_text("notes").as_deref(), Some("draft"));
    }

    #[test]
    fn test_from_snapshot_starts_clean() {
        let mut source = store();
        add(&mut source, 3..9, Some("claim"));
        assert!(source.is_dirty());

        let copy = AnnotationStore::from_snapshot(DocumentInfo::new(100), &source.full_state()).unwrap();
        assert_eq!(copy.highlight_count(), 1);
        assert_eq!(copy.version(), 0);
        assert!(!copy.is_dirty());

        assert!(AnnotationStore::from_snapshot(DocumentInfo::new(100), &[0xFF, 0x01]).is_none());
    }

    #[test]
    fn test_mark_persisted_tracks_dirty() {
        let mut store = store();
        add(&mut store, 0..4, None);
        let snapshot_version = store.version();
        add(&mut store, 5..9, None);

        store.mark_persisted(snapshot_version);
        assert!(store.is_dirty());
        store.mark_persisted(store.version());
        assert!(!store.is_dirty());
        store.mark_persisted(snapshot_version);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_malformed_update_dropped() {
        let mut store = store();
        assert!(!store.apply_update(&[0xFF, 0xFF, 0xFF]));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_corrupted_update_dropped_before_decoding() {
        let mut source = store();
        add(&mut source, 0..4, Some("claim"));
        let update = source.drain_local_updates().remove(0);

        let mut target = store();
        for i in 0..update.len() {
            let mut corrupted = update.clone();
            corrupted[i] ^= 0x5A;
            assert!(!target.apply_update(&corrupted), "byte {i}");
        }
        assert!(!target.apply_update(&update[..update.len() - 1]));
        assert_eq!(target.highlight_count(), 0);
        assert_eq!(target.version(), 0);

        assert!(target.apply_update(&update));
        assert_eq!(target.highlight_count(), 1);
    }

    #[test]
    fn test_redelivered_update_keeps_store_clean() {
        let mut source = store();
        let id = add(&mut source, 0..4, None);
        let added = source.drain_local_updates().remove(0);

        let mut target = store();
        assert!(target.apply_update(&added));
        assert_eq!(target.version(), 1);
        target.mark_persisted(target.version());

        assert!(target.apply_update(&added));
        assert!(target.apply_update(&source.full_state()));
        assert_eq!(target.version(), 1);
        assert!(!target.is_dirty());

        // A delete-only update still counts as a change.
        assert!(source.remove_highlight(&id));
        let removed = source.drain_local_updates().remove(0);
        assert!(target.apply_update(&removed));
        assert_eq!(target.version(), 2);
        assert!(target.is_dirty());
    }

    #[test]
    fn test_encode_diff_from_state_vector() {
        let mut a = AnnotationStore::with_client_id(DocumentInfo::new(100), 1);
        let mut b = AnnotationStore::with_client_id(DocumentInfo::new(100), 2);
        add(&mut a, 0..5, None);
        assert!(b.apply_update(&a.full_state()));

        add(&mut a, 10..15, None);
        let diff = a.encode_diff(&b.state_vector()).unwrap();
        assert!(b.apply_update(&diff));
        assert_eq!(b.highlight_count(), 2);
        assert!(a.encode_diff(&[0xFF, 0xFF]).is_none());
    }

    // ── Presence tests ───────────────────────────────────────────

    #[test]
    fn test_presence_exchanged_between_stores() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut a = store().with_presence(PresenceRoom::new(alice, "Alice"));
        let mut b = store().with_presence(PresenceRoom::new(bob, "Bob"));

        let msg = a.set_local_presence(Some(7), Some((7, 12))).unwrap();
        assert!(b.apply_presence(&msg));

        let seen = b.get_all_presence();
        assert_eq!(seen[&alice].selection, Some((7, 12)));
        assert!(!seen.contains_key(&bob));

        assert!(b.apply_presence(&a.leave_presence().unwrap()));
        assert!(b.get_all_presence().is_empty());
    }
}
