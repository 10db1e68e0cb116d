//! Cursor id remapping
//!
//! Cursor ids are handed out by the server that was recorded, so a replay
//! target will answer with different ids for the same logical cursor. A
//! forward pass over the file assigns each distinct recorded id a dense
//! placeholder; during replay every connection learns which live id each
//! placeholder stands for from the replies it actually receives.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{Result, WireReplayError};
use crate::playback::{PlaybackFileReader, SeekCapability};
use crate::wire::{DecodeError, Op};

/// Recorded cursor id → placeholder table, read-only once built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorRemap {
    placeholders: HashMap<i64, i64>,
    recorded: Vec<i64>,
}

impl CursorRemap {
    /// Scan the whole file once, then rewind it for the replay pass
    pub fn build(reader: &mut PlaybackFileReader) -> Result<Self> {
        if reader.capability() == SeekCapability::None {
            return Err(WireReplayError::SeekUnsupported(
                "cursor preprocessing needs an input that can seek to start".to_string(),
            ));
        }
        reader.seek_to_start()?;

        let mut remap = Self::default();
        let mut ops = 0usize;
        for op in reader.generations(1) {
            let op = op?;
            ops += 1;
            if op.eof {
                continue;
            }
            for id in op.raw_op.parse()?.cursor_ids()? {
                remap.observe(id);
            }
        }
        reader.seek_to_start()?;

        info!(ops, cursors = remap.len(), "Cursor preprocessing complete");
        Ok(remap)
    }

    /// Record an id, assigning the next placeholder the first time it is seen
    pub fn observe(&mut self, recorded_id: i64) -> i64 {
        if let Some(placeholder) = self.placeholders.get(&recorded_id) {
            return *placeholder;
        }
        let placeholder = self.recorded.len() as i64 + 1;
        self.placeholders.insert(recorded_id, placeholder);
        self.recorded.push(recorded_id);
        debug!(recorded_id, placeholder, "New cursor");
        placeholder
    }

    /// Placeholder for a recorded id
    pub fn placeholder(&self, recorded_id: i64) -> Option<i64> {
        self.placeholders.get(&recorded_id).copied()
    }

    /// Recorded ids in first-seen order
    pub fn recorded_ids(&self) -> &[i64] {
        &self.recorded
    }

    /// Number of distinct cursors
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    /// True when the file referenced no cursors
    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }
}

/// One connection's placeholder → live cursor bindings
#[derive(Debug, Default)]
pub struct CursorBindings {
    live: HashMap<i64, i64>,
}

impl CursorBindings {
    /// Empty bindings
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a placeholder to the id the live server handed out
    pub fn bind(&mut self, placeholder: i64, live_id: i64) {
        self.live.insert(placeholder, live_id);
    }

    /// Live id for a placeholder, or the placeholder while unbound
    pub fn resolve(&self, placeholder: i64) -> i64 {
        self.live.get(&placeholder).copied().unwrap_or(placeholder)
    }

    /// Number of bound placeholders
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True before any reply carried a cursor
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Rewrite an outbound op: recorded → placeholder → live
    pub fn rewrite(&self, remap: &CursorRemap, op: &mut Op) -> std::result::Result<(), DecodeError> {
        let ids = op.cursor_ids()?;
        if ids.is_empty() {
            return Ok(());
        }
        let replacements: Vec<i64> = ids
            .iter()
            .map(|id| match remap.placeholder(*id) {
                Some(placeholder) => self.resolve(placeholder),
                None => *id,
            })
            .collect();
        op.rewrite_cursor_ids(&replacements)
    }

    /// Learn from a recorded reply and the live reply to the same request
    ///
    /// Returns how many placeholders were bound.
    pub fn learn(
        &mut self,
        remap: &CursorRemap,
        recorded_reply: &Op,
        live_cursor_id: i64,
    ) -> std::result::Result<usize, DecodeError> {
        if live_cursor_id == 0 {
            return Ok(0);
        }
        let mut bound = 0;
        for id in recorded_reply.cursor_ids()? {
            if let Some(placeholder) = remap.placeholder(id) {
                self.bind(placeholder, live_cursor_id);
                bound += 1;
            }
        }
        Ok(bound)
    }
}
