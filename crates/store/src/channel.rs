//! Append-only per-writer entry logs.
//!
//! A channel is a backward-linked hash chain of entries, advanced by CAS on
//! the channel head. Deletion is forbidden at this layer — hiding content
//! is the access layer's job. A logical topic is the union of every channel
//! sharing its `topicId`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::debug;

use lore_object::{id_hash, ChannelInfo, ContentHash, Entry, Storable};

use crate::error::StoreError;
use crate::objects::ObjectStore;
use crate::versioned::VersionedStore;

/// Head-CAS attempts before a lost append race surfaces.
const APPEND_RETRIES: usize = 3;

#[derive(Clone)]
pub struct ChannelLog {
    store: VersionedStore,
}

impl ChannelLog {
    pub fn new(store: VersionedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// Append a new entry referencing `data_hash`. The entry is persisted
    /// first, then the channel head moves old→new; a head lost to a
    /// concurrent writer is recomputed and retried.
    pub fn append(
        &self,
        topic_id: &str,
        owner: Option<&str>,
        data_hash: ContentHash,
        creation_time: i64,
    ) -> Result<ContentHash, StoreError> {
        let mut attempt = 0;
        loop {
            let existing = self
                .channel(topic_id, owner)?
                .unwrap_or_else(|| ChannelInfo::new(topic_id, owner.map(str::to_owned)));

            let entry = Entry {
                topic_id: topic_id.to_string(),
                owner: owner.map(str::to_owned),
                previous_entry: existing.head,
                data_hash,
                creation_time,
            };
            let entry_hash = self.store.objects().put(&entry.to_data())?;

            let advanced = ChannelInfo {
                head: Some(entry_hash),
                entry_count: existing.entry_count + 1,
                ..existing
            };
            match self.store.put_versioned_once(&advanced.to_data()) {
                Ok(_) => {
                    debug!(topic_id, ?owner, entry = %entry_hash, "channel head advanced");
                    return Ok(entry_hash);
                }
                Err(StoreError::StaleWrite { .. }) if attempt + 1 < APPEND_RETRIES => {
                    // Another writer advanced the head; the superseded
                    // entry object becomes an orphan the sweep collects.
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Current state of one channel, if it was ever written.
    pub fn channel(
        &self,
        topic_id: &str,
        owner: Option<&str>,
    ) -> Result<Option<ChannelInfo>, StoreError> {
        let probe = ChannelInfo::new(topic_id, owner.map(str::to_owned));
        let id = id_hash(self.store.objects().registry(), &probe.to_data())?;
        self.store.try_get_current_typed(&id)
    }

    /// All channels belonging to one logical topic.
    pub fn channels_of_topic(&self, topic_id: &str) -> Result<Vec<ChannelInfo>, StoreError> {
        let mut channels: Vec<ChannelInfo> = self
            .store
            .iter_current_typed::<ChannelInfo>()?
            .into_iter()
            .map(|(_, channel)| channel)
            .filter(|channel| channel.topic_id == topic_id)
            .collect();
        // Deterministic presentation order: shared channel first, then by
        // owner.
        channels.sort_by(|a, b| a.owner.cmp(&b.owner));
        Ok(channels)
    }

    /// Walk one channel backward from its head, lazily.
    pub fn iter(&self, topic_id: &str, owner: Option<&str>) -> Result<EntryIter, StoreError> {
        let head = self.channel(topic_id, owner)?.and_then(|channel| channel.head);
        Ok(EntryIter {
            objects: self.store.objects().clone(),
            next: head,
        })
    }

    /// Aggregate view of a topic: all channels merged by `creationTime`
    /// descending, ties broken on the entry content hash, lazily.
    pub fn iter_topic(&self, topic_id: &str) -> Result<TopicIter, StoreError> {
        let mut sources = Vec::new();
        for channel in self.channels_of_topic(topic_id)? {
            sources.push(EntryIter {
                objects: self.store.objects().clone(),
                next: channel.head,
            });
        }
        TopicIter::new(sources)
    }
}

/// Lazy backward walk of a single channel.
pub struct EntryIter {
    objects: ObjectStore,
    next: Option<ContentHash>,
}

impl Iterator for EntryIter {
    type Item = Result<(ContentHash, Entry), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.objects.get_typed::<Entry>(&hash) {
            Ok(entry) => {
                self.next = entry.previous_entry;
                Some(Ok((hash, entry)))
            }
            Err(error) => Some(Err(error)),
        }
    }
}

struct HeapSlot {
    creation_time: i64,
    hash: ContentHash,
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.creation_time == other.creation_time && self.hash == other.hash
    }
}

impl Eq for HeapSlot {}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: newest first; on equal times the smaller hash wins so
        // the merged order is deterministic across runs.
        self.creation_time
            .cmp(&other.creation_time)
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge over the channels of a topic.
pub struct TopicIter {
    sources: Vec<EntryIter>,
    heap: BinaryHeap<HeapSlot>,
    failed: bool,
}

impl TopicIter {
    fn new(mut sources: Vec<EntryIter>) -> Result<Self, StoreError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some(result) = source.next() {
                let (hash, entry) = result?;
                heap.push(HeapSlot {
                    creation_time: entry.creation_time,
                    hash,
                    entry,
                    source: index,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
        })
    }
}

impl Iterator for TopicIter {
    type Item = Result<(ContentHash, Entry), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let slot = self.heap.pop()?;
        if let Some(result) = self.sources[slot.source].next() {
            match result {
                Ok((hash, entry)) => self.heap.push(HeapSlot {
                    creation_time: entry.creation_time,
                    hash,
                    entry,
                    source: slot.source,
                }),
                Err(error) => {
                    self.failed = true;
                    return Some(Err(error));
                }
            }
        }
        Some(Ok((slot.hash, slot.entry)))
    }
}
