use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::segment::dictionary::DictionaryStreamer;

pub struct HeapItem<'a> {
    pub streamer: DictionaryStreamer<'a>,
    pub segment_ord: usize,
}

impl<'a> HeapItem<'a> {
    /// Dictionary value the source streamer is positioned on.
    pub fn value(&self) -> u64 {
        self.streamer.value()
    }
}

impl<'a> PartialEq for HeapItem<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.segment_ord == other.segment_ord
    }
}

impl<'a> Eq for HeapItem<'a> {}

impl<'a> PartialOrd for HeapItem<'a> {
    fn partial_cmp(&self, other: &HeapItem<'a>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> Ord for HeapItem<'a> {
    fn cmp(&self, other: &HeapItem<'a>) -> Ordering {
        (other.streamer.key(), other.segment_ord).cmp(&(self.streamer.key(), self.segment_ord))
    }
}

/// Given a list of sorted term streams, iterates over sorted unique terms.
///
/// At each position the merger exposes the current term and the sources
/// holding it, in ascending source order. The deterministic tie-break is
/// load-bearing: the postings byte-copy path depends on sources being
/// replayed in segment order.
pub struct TermMerger<'a> {
    heap: BinaryHeap<HeapItem<'a>>,
    current_streamers: Vec<HeapItem<'a>>,
}

impl<'a> TermMerger<'a> {
    pub fn new(streams: Vec<DictionaryStreamer<'a>>) -> TermMerger<'a> {
        TermMerger {
            heap: BinaryHeap::new(),
            current_streamers: streams
                .into_iter()
                .enumerate()
                .map(|(ord, streamer)| HeapItem {
                    streamer,
                    segment_ord: ord,
                })
                .collect(),
        }
    }

    fn advance_segments(&mut self) {
        let streamers = &mut self.current_streamers;
        let heap = &mut self.heap;
        for mut heap_item in streamers.drain(..) {
            if heap_item.streamer.advance() {
                heap.push(heap_item);
            }
        }
    }

    /// Advances to the next unique term.
    /// Returns true if there is indeed another term, false if there is none.
    pub fn advance(&mut self) -> bool {
        self.advance_segments();
        if let Some(head) = self.heap.pop() {
            self.current_streamers.push(head);
            while let Some(next_streamer) = self.heap.peek() {
                if self.current_streamers[0].streamer.key() != next_streamer.streamer.key() {
                    break;
                }
                let next_heap_it = self.heap.pop().expect("peek beforehand");
                self.current_streamers.push(next_heap_it);
            }
            true
        } else {
            false
        }
    }

    /// Returns the current term.
    ///
    /// This method may be called iff advance() has been called before
    /// and returned true.
    pub fn key(&self) -> &[u8] {
        self.current_streamers[0].streamer.key()
    }

    /// Returns the sources positioned on the current term, in ascending
    /// segment order.
    ///
    /// This method may be called iff advance() has been called before
    /// and returned true.
    pub fn current_kvs(&self) -> &[HeapItem<'a>] {
        &self.current_streamers[..]
    }
}
