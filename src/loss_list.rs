use crate::sequence_number::SequenceNumber;

/// An ordered set of sequence numbers, stored as inclusive ranges.
///
/// Used on the send side for sequence numbers pending retransmission, and on the
///  receive side for the gaps between received packets. All entries are expected to
///  lie within half the sequence number space of each other - the transport's flow
///  window keeps them far denser than that.
#[derive(Default, Debug)]
pub struct LossList {
    ranges: Vec<(SequenceNumber, SequenceNumber)>,
}

impl LossList {
    pub fn new() -> LossList {
        LossList { ranges: Vec::new() }
    }

    pub fn insert_one(&mut self, seq: SequenceNumber) {
        self.insert(seq, seq);
    }

    /// Insert the inclusive range `[start, end]`, merging with overlapping or adjacent
    ///  entries.
    pub fn insert(&mut self, start: SequenceNumber, end: SequenceNumber) {
        debug_assert!(!end.is_before(start));

        let mut idx = 0;
        while idx < self.ranges.len() && self.ranges[idx].1.next().is_before(start) {
            idx += 1;
        }

        let mut merged_start = start;
        let mut merged_end = end;
        while idx < self.ranges.len() && !end.next().is_before(self.ranges[idx].0) {
            if self.ranges[idx].0.is_before(merged_start) {
                merged_start = self.ranges[idx].0;
            }
            if merged_end.is_before(self.ranges[idx].1) {
                merged_end = self.ranges[idx].1;
            }
            self.ranges.remove(idx);
        }
        self.ranges.insert(idx, (merged_start, merged_end));
    }

    /// Remove a single sequence number. Returns whether it was present.
    pub fn remove(&mut self, seq: SequenceNumber) -> bool {
        for idx in 0..self.ranges.len() {
            let (start, end) = self.ranges[idx];
            if seq.is_before(start) {
                return false;
            }
            if end.is_before(seq) {
                continue;
            }

            // seq lies within [start, end] - split as needed
            if start == end {
                self.ranges.remove(idx);
            } else if seq == start {
                self.ranges[idx].0 = start.next();
            } else if seq == end {
                self.ranges[idx].1 = end - 1;
            } else {
                self.ranges[idx].1 = seq - 1;
                self.ranges.insert(idx + 1, (seq.next(), end));
            }
            return true;
        }
        false
    }

    /// Drop every entry strictly before `threshold` (cumulative-ACK semantics).
    pub fn remove_before(&mut self, threshold: SequenceNumber) {
        while let Some(&(start, end)) = self.ranges.first() {
            if end.is_before(threshold) {
                self.ranges.remove(0);
            } else if start.is_before(threshold) {
                self.ranges[0].0 = threshold;
                break;
            } else {
                break;
            }
        }
    }

    pub fn first(&self) -> Option<SequenceNumber> {
        self.ranges.first().map(|&(start, _)| start)
    }

    /// Remove and return the smallest sequence number in the list.
    pub fn pop_first(&mut self) -> Option<SequenceNumber> {
        let &(start, end) = self.ranges.first()?;
        if start == end {
            self.ranges.remove(0);
        } else {
            self.ranges[0].0 = start.next();
        }
        Some(start)
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| !seq.is_before(start) && !end.is_before(seq))
    }

    /// Total number of sequence numbers in the list (not the number of ranges).
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(start, end)| start.forward_distance(end) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
