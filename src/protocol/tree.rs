//! Bounded, ordered, blocking segment buffer.
//!
//! The tree is the reliability-layer buffer between the packet pump and the
//! session loops: the output side parks segments to send, the input side
//! parks received segments until the reader drains them in sequence order.
//!
//! Ordering is by sequence number, ties by insertion order. Capacity is
//! fixed at construction; the blocking forms suspend on full/empty and wake
//! on the opposite state change.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::protocol::segment::Segment;

/// A bounded ordered multiset of segments keyed by sequence number.
pub struct SegmentTree {
    inner: Mutex<TreeInner>,
    not_full: Notify,
    not_empty: Notify,
    capacity: usize,
}

struct TreeInner {
    /// Keyed by (seq, insertion counter) so equal sequence numbers keep
    /// their arrival order.
    segments: BTreeMap<(u32, u64), Segment>,
    counter: u64,
}

impl SegmentTree {
    /// Create a tree holding at most `capacity` segments.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TreeInner {
                segments: BTreeMap::new(),
                counter: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn key_of(inner: &mut TreeInner, seg: &Segment) -> (u32, u64) {
        inner.counter += 1;
        // Segments without a sequence number sort first; session trees only
        // ever hold session and data-ack segments, which all carry one.
        (seg.metadata.seq().unwrap_or(0), inner.counter)
    }

    fn try_insert(&self, seg: Segment) -> std::result::Result<(), Segment> {
        let mut inner = self.inner.lock();
        if inner.segments.len() >= self.capacity {
            return Err(seg);
        }
        let key = Self::key_of(&mut inner, &seg);
        inner.segments.insert(key, seg);
        Ok(())
    }

    /// Insert without blocking. Returns false (and leaves the tree
    /// untouched) if the tree is full.
    pub fn insert(&self, seg: Segment) -> bool {
        match self.try_insert(seg) {
            Ok(()) => {
                self.not_empty.notify_waiters();
                true
            }
            Err(_) => false,
        }
    }

    /// Insert, waiting for space if the tree is full.
    pub async fn insert_blocking(&self, seg: Segment) {
        let mut seg = seg;
        loop {
            let notified = self.not_full.notified();
            match self.try_insert(seg) {
                Ok(()) => {
                    self.not_empty.notify_waiters();
                    return;
                }
                Err(back) => seg = back,
            }
            notified.await;
        }
    }

    /// Remove and return the segment with the lowest sequence number, or
    /// `None` if the tree is empty.
    pub fn delete_min(&self) -> Option<Segment> {
        let seg = {
            let mut inner = self.inner.lock();
            inner.segments.pop_first().map(|(_, seg)| seg)
        };
        if seg.is_some() {
            self.not_full.notify_waiters();
        }
        seg
    }

    /// Remove and return the lowest segment, waiting if the tree is empty.
    pub async fn delete_min_blocking(&self) -> Segment {
        loop {
            let notified = self.not_empty.notified();
            if let Some(seg) = self.delete_min() {
                return seg;
            }
            notified.await;
        }
    }

    /// Remove and return the lowest segment only if `pred` accepts it.
    pub fn delete_min_if<F>(&self, pred: F) -> Option<Segment>
    where
        F: FnOnce(&Segment) -> bool,
    {
        let seg = {
            let mut inner = self.inner.lock();
            let (key, min) = inner.segments.first_key_value()?;
            if !pred(min) {
                return None;
            }
            let key = *key;
            inner.segments.remove(&key)
        };
        if seg.is_some() {
            self.not_full.notify_waiters();
        }
        seg
    }

    /// Remove and return the lowest segment once `pred` accepts it,
    /// waiting across inserts until it does.
    pub async fn delete_min_if_blocking<F>(&self, pred: F) -> Segment
    where
        F: Fn(&Segment) -> bool,
    {
        loop {
            let notified = self.not_empty.notified();
            if let Some(seg) = self.delete_min_if(&pred) {
                return seg;
            }
            notified.await;
        }
    }

    /// Lowest resident sequence number.
    ///
    /// # Errors
    ///
    /// Fails if the tree is empty.
    pub fn min_seq(&self) -> Result<u32> {
        let inner = self.inner.lock();
        inner
            .segments
            .first_key_value()
            .map(|((seq, _), _)| *seq)
            .ok_or_else(|| Error::invalid_op("segment tree is empty"))
    }

    /// Highest resident sequence number.
    ///
    /// # Errors
    ///
    /// Fails if the tree is empty.
    pub fn max_seq(&self) -> Result<u32> {
        let inner = self.inner.lock();
        inner
            .segments
            .last_key_value()
            .map(|((seq, _), _)| *seq)
            .ok_or_else(|| Error::invalid_op("segment tree is empty"))
    }

    /// Number of resident segments.
    pub fn len(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Whether the tree holds no segments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots.
    pub fn remaining(&self) -> usize {
        self.capacity - self.len()
    }

    /// Visit segments in ascending sequence order while `f` returns true.
    pub fn ascend<F>(&self, mut f: F)
    where
        F: FnMut(&Segment) -> bool,
    {
        let inner = self.inner.lock();
        for seg in inner.segments.values() {
            if !f(seg) {
                break;
            }
        }
    }
}

impl std::fmt::Debug for SegmentTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTree")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
