//! Timestamp matcher for fusion nodes
//!
//! Buffers frames per input topic and assembles time-aligned sets: the
//! oldest frame on the base topic (index 0) fixes the target timestamp, and
//! every other topic must contribute its closest frame within `slop`
//! seconds. Matched frames are removed from their buffers, which is what
//! keeps the buffers bounded in steady state. Base frames that can never
//! match (the other streams have moved past them) or have gone stale are
//! dropped.

use crate::domain::frame::Frame;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::debug;

/// Per-topic ring capacity
pub const DEFAULT_RING_CAPACITY: usize = 50;

pub struct FusionMatcher {
    topics: Vec<String>,
    slop: f64,
    capacity: usize,
    buffers: FxHashMap<String, VecDeque<Frame>>,
}

impl FusionMatcher {
    pub fn new(topics: &[String], slop: f64) -> Self {
        Self::with_capacity(topics, slop, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(topics: &[String], slop: f64, capacity: usize) -> Self {
        let buffers = topics
            .iter()
            .map(|t| (t.clone(), VecDeque::with_capacity(capacity)))
            .collect();
        Self { topics: topics.to_vec(), slop, capacity, buffers }
    }

    pub fn push(&mut self, topic: &str, frame: Frame) {
        let Some(buffer) = self.buffers.get_mut(topic) else {
            return;
        };
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    pub fn buffered(&self, topic: &str) -> usize {
        self.buffers.get(topic).map_or(0, VecDeque::len)
    }

    /// Attempt one match against the oldest base frame. Returns the aligned
    /// set (base first) when every topic contributes, removing the matched
    /// frames. Otherwise drops the base frame if it is unmatchable or
    /// stale, and returns `None`.
    pub fn try_match(&mut self, now: f64) -> Option<Vec<Frame>> {
        let base_topic = self.topics.first()?.clone();
        let target_ts = self.buffers.get(&base_topic)?.front()?.timestamp;

        // Best-match index per secondary topic, all-or-nothing
        let mut picks: Vec<(String, usize)> = Vec::with_capacity(self.topics.len() - 1);
        let mut all_matched = true;

        for topic in &self.topics[1..] {
            match self.find_match(topic, target_ts) {
                Some(index) => picks.push((topic.clone(), index)),
                None => {
                    all_matched = false;
                    break;
                }
            }
        }

        if all_matched {
            let mut frames = Vec::with_capacity(self.topics.len());
            if let Some(base) = self.buffers.get_mut(&base_topic).and_then(VecDeque::pop_front) {
                frames.push(base);
            }
            for (topic, index) in picks {
                if let Some(frame) = self.buffers.get_mut(&topic).and_then(|b| b.remove(index)) {
                    frames.push(frame);
                }
            }
            return Some(frames);
        }

        // No full set. Give up on the base frame when another stream has
        // already moved past it, or when it has aged out entirely.
        let unmatchable = self.topics[1..].iter().any(|topic| {
            self.buffers
                .get(topic)
                .and_then(VecDeque::front)
                .is_some_and(|oldest| oldest.timestamp > target_ts + self.slop)
        });
        let stale = now - target_ts > self.slop * 2.0;

        if unmatchable || stale {
            debug!(
                base = %base_topic,
                target_ts = %target_ts,
                unmatchable = %unmatchable,
                "fusion_base_dropped"
            );
            self.buffers.get_mut(&base_topic).and_then(VecDeque::pop_front);
        }
        None
    }

    /// Index of the frame on `topic` closest to `target_ts` within slop.
    fn find_match(&self, topic: &str, target_ts: f64) -> Option<usize> {
        let buffer = self.buffers.get(topic)?;
        let mut best: Option<(usize, f64)> = None;

        for (index, frame) in buffer.iter().enumerate() {
            let diff = (frame.timestamp - target_ts).abs();
            if diff <= self.slop && best.map_or(true, |(_, best_diff)| diff < best_diff) {
                best = Some((index, diff));
            }
        }
        best.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::Map;

    fn frame(id: u32, ts: f64) -> Frame {
        Frame::with_parts(id, ts, Map::new(), Bytes::new())
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matches_closest_within_slop() {
        // Camera at 100 Hz, lidar at 10 Hz with a 30 ms clock offset
        let mut matcher = FusionMatcher::new(&topics(&["cam", "lidar"]), 0.05);
        for i in 0..10 {
            matcher.push("cam", frame(i, 10.0 + i as f64 * 0.01));
        }
        matcher.push("lidar", frame(100, 10.03));

        // Base frames without a lidar partner fall through until 10.00,
        // which lies within 50 ms of the lidar stamp
        let matched = matcher.try_match(10.1).expect("match expected");
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].frame_id, 0);
        assert_eq!(matched[1].frame_id, 100);
        // The matched lidar frame is gone
        assert_eq!(matcher.buffered("lidar"), 0);
    }

    #[test]
    fn test_picks_minimum_distance() {
        let mut matcher = FusionMatcher::new(&topics(&["cam", "lidar"]), 0.05);
        matcher.push("cam", frame(0, 10.00));
        matcher.push("lidar", frame(1, 9.96));
        matcher.push("lidar", frame(2, 10.01));
        matcher.push("lidar", frame(3, 10.04));

        let matched = matcher.try_match(10.0).unwrap();
        assert_eq!(matched[1].frame_id, 2);
        assert_eq!(matcher.buffered("lidar"), 2);
    }

    #[test]
    fn test_unmatchable_base_dropped() {
        let mut matcher = FusionMatcher::new(&topics(&["cam", "lidar"]), 0.05);
        matcher.push("cam", frame(0, 10.0));
        // Lidar's oldest frame is already past the window: the base frame
        // can never find a partner
        matcher.push("lidar", frame(1, 10.2));

        assert!(matcher.try_match(10.0).is_none());
        assert_eq!(matcher.buffered("cam"), 0);
        assert_eq!(matcher.buffered("lidar"), 1);
    }

    #[test]
    fn test_stale_base_dropped() {
        let mut matcher = FusionMatcher::new(&topics(&["cam", "lidar"]), 0.05);
        matcher.push("cam", frame(0, 10.0));

        // No lidar data at all; base survives while fresh
        assert!(matcher.try_match(10.05).is_none());
        assert_eq!(matcher.buffered("cam"), 1);

        // Older than 2 * slop: given up
        assert!(matcher.try_match(10.2).is_none());
        assert_eq!(matcher.buffered("cam"), 0);
    }

    #[test]
    fn test_ring_capacity_bound() {
        let mut matcher = FusionMatcher::with_capacity(&topics(&["cam", "lidar"]), 0.05, 3);
        for i in 0..10 {
            matcher.push("cam", frame(i, i as f64));
        }
        assert_eq!(matcher.buffered("cam"), 3);
    }

    #[test]
    fn test_three_way_match() {
        let mut matcher = FusionMatcher::new(&topics(&["cam", "lidar", "radar"]), 0.05);
        matcher.push("cam", frame(0, 10.0));
        matcher.push("lidar", frame(1, 10.02));
        matcher.push("radar", frame(2, 9.98));

        let matched = matcher.try_match(10.0).unwrap();
        assert_eq!(matched.iter().map(|f| f.frame_id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unknown_topic_push_ignored() {
        let mut matcher = FusionMatcher::new(&topics(&["cam"]), 0.05);
        matcher.push("ghost", frame(0, 1.0));
        assert_eq!(matcher.buffered("ghost"), 0);
    }
}
