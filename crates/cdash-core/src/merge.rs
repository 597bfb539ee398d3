//! Reconciliation of keyed records against partial incoming payloads.
//!
//! Collections are ordered newest-first. Unknown ids are inserted at the
//! front; known ids are merged in place and keep their position.

use std::collections::{HashMap, VecDeque};

pub trait Keyed {
    fn key(&self) -> &str;
}

/// A stored record type with an explicit list of mergeable fields.
pub trait Reconcile: Keyed + Clone {
    type Update: Keyed;

    fn from_update(update: &Self::Update) -> Self;

    /// Copies every declared field that is present in `update` and differs
    /// from the stored value. Must not touch the last-modified marker.
    fn merge_fields(&mut self, update: &Self::Update) -> bool;

    fn merge_marker(&mut self, update: &Self::Update);
}

/// Overwrites `stored` with `incoming` when present and different.
pub fn merge_field<T: PartialEq + Clone>(stored: &mut T, incoming: Option<&T>) -> bool {
    match incoming {
        Some(value) if value != stored => {
            *stored = value.clone();
            true
        }
        _ => false,
    }
}

#[derive(Debug)]
pub struct Reconciled<'a, R> {
    pub changed: bool,
    pub inserted: bool,
    /// Index in display order after the merge.
    pub position: usize,
    pub item: &'a R,
}

/// Newest-first collection with O(1) id lookup.
///
/// Each record carries an insertion sequence; the front holds the highest
/// sequence, so a record's position is `next_seq - 1 - seq` for as long as
/// nothing is removed.
#[derive(Debug, Clone)]
pub struct RecordCollection<R> {
    items: VecDeque<R>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

impl<R: Reconcile> Default for RecordCollection<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Reconcile> RecordCollection<R> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Seeds from a bootstrap list given in display order. Later duplicates
    /// of an id are ignored.
    pub fn from_snapshot<I>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
    {
        let mut unique = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for record in records {
            if seen.insert(record.key().to_string()) {
                unique.push(record);
            }
        }

        let mut collection = Self::new();
        // Oldest last in display order, so push back-to-front onto the front.
        for record in unique.into_iter().rev() {
            collection.push_front(record);
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.position_of(id).and_then(|pos| self.items.get(pos))
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        let seq = *self.index.get(id)?;
        Some((self.next_seq - 1 - seq) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.items.iter()
    }

    pub fn reconcile(&mut self, update: &R::Update) -> Reconciled<'_, R> {
        if let Some(position) = self.position_of(update.key()) {
            let changed = match self.items.get_mut(position) {
                Some(stored) => {
                    let changed = stored.merge_fields(update);
                    if changed {
                        stored.merge_marker(update);
                    }
                    changed
                }
                None => false,
            };
            return Reconciled {
                changed,
                inserted: false,
                position,
                item: &self.items[position],
            };
        }

        self.push_front(R::from_update(update));
        Reconciled {
            changed: true,
            inserted: true,
            position: 0,
            item: &self.items[0],
        }
    }

    fn push_front(&mut self, record: R) {
        self.index.insert(record.key().to_string(), self.next_seq);
        self.next_seq += 1;
        self.items.push_front(record);
    }
}

/// Reconciles `update` into `collection`.
pub fn reconcile<'a, R: Reconcile>(
    collection: &'a mut RecordCollection<R>,
    update: &R::Update,
) -> Reconciled<'a, R> {
    collection.reconcile(update)
}

/// A derived collection that only admits updates matching a predicate.
///
/// A stored record whose later update stops matching is left in place.
#[derive(Debug, Clone)]
pub struct FilteredCollection<R: Reconcile> {
    inner: RecordCollection<R>,
    predicate: fn(&R::Update) -> bool,
}

impl<R: Reconcile> FilteredCollection<R> {
    pub fn new(predicate: fn(&R::Update) -> bool) -> Self {
        Self {
            inner: RecordCollection::new(),
            predicate,
        }
    }

    pub fn from_snapshot<I>(predicate: fn(&R::Update) -> bool, records: I) -> Self
    where
        I: IntoIterator<Item = R>,
    {
        Self {
            inner: RecordCollection::from_snapshot(records),
            predicate,
        }
    }

    pub fn reconcile(&mut self, update: &R::Update) -> Option<Reconciled<'_, R>> {
        if !(self.predicate)(update) {
            return None;
        }
        Some(self.inner.reconcile(update))
    }

    pub fn records(&self) -> &RecordCollection<R> {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
