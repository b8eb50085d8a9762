//! Joins attempts whose body was split over several frames.

use std::collections::HashMap;

use bytes::BytesMut;
use thiserror::Error;

use super::message::{AttemptChunk, AttemptFrame};
use crate::attempt::InboundAttempt;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("chunk for unknown attempt {0}")]
    UnknownAttempt(String),
    #[error("attempt {attempt_id}: expected chunk {expected}, got {got}")]
    OutOfOrder {
        attempt_id: String,
        expected: u32,
        got: u32,
    },
}

struct Partial {
    head: AttemptFrame,
    body: BytesMut,
    next_seq: u32,
}

/// Holds partially received attempts until their last chunk arrives.
#[derive(Default)]
pub struct Reassembler {
    partial: HashMap<String, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the head frame of an attempt. Returns the attempt right away
    /// unless more chunks are announced.
    pub fn push_attempt(&mut self, frame: AttemptFrame) -> Option<InboundAttempt> {
        if !frame.more_chunks {
            return Some(frame.into());
        }
        let mut body = BytesMut::with_capacity(frame.body.len());
        body.extend_from_slice(&frame.body);
        self.partial.insert(
            frame.attempt_id.clone(),
            Partial {
                head: frame,
                body,
                next_seq: 0,
            },
        );
        None
    }

    /// Appends a body chunk. A gap or repeat in `seq` discards the partial
    /// attempt; the dispatcher redelivers it.
    pub fn push_chunk(
        &mut self,
        chunk: AttemptChunk,
    ) -> Result<Option<InboundAttempt>, ReassemblyError> {
        let Some(partial) = self.partial.get_mut(&chunk.attempt_id) else {
            return Err(ReassemblyError::UnknownAttempt(chunk.attempt_id));
        };

        if chunk.seq != partial.next_seq {
            let expected = partial.next_seq;
            self.partial.remove(&chunk.attempt_id);
            return Err(ReassemblyError::OutOfOrder {
                attempt_id: chunk.attempt_id,
                expected,
                got: chunk.seq,
            });
        }

        partial.body.extend_from_slice(&chunk.data);
        partial.next_seq += 1;

        if !chunk.last {
            return Ok(None);
        }

        let Some(Partial { mut head, body, .. }) = self.partial.remove(&chunk.attempt_id) else {
            return Ok(None);
        };
        head.body = body.freeze();
        head.more_chunks = false;
        Ok(Some(head.into()))
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drops everything; called when the socket goes away.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
