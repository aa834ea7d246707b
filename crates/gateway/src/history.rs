use std::collections::VecDeque;

use opsgate_protocol::Frame;

/// Bounded ring of recently published messages across all channels.
///
/// The cap is gateway-wide; eviction is oldest-first. Per-channel retention
/// settings are advisory and enforced only through this cap.
pub struct HistoryRing {
    entries: VecDeque<Frame>,
    max_entries: usize,
}

impl HistoryRing {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    pub fn append(&mut self, frame: Frame) {
        while self.entries.len() >= self.max_entries && self.entries.pop_front().is_some() {}
        self.entries.push_back(frame);
    }

    /// The most recent `limit` messages for `channel`, oldest first.
    pub fn recent(&self, channel: &str, limit: usize) -> Vec<Frame> {
        let mut tail: Vec<Frame> = self
            .entries
            .iter()
            .rev()
            .filter(|f| f.channel.as_deref() == Some(channel))
            .take(limit)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn channel_len(&self, channel: &str) -> usize {
        self.entries
            .iter()
            .filter(|f| f.channel.as_deref() == Some(channel))
            .count()
    }
}
