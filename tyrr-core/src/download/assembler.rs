use std::{collections::HashSet, net::SocketAddr};

use thiserror::Error;

use tyrr_common::manifest::BLOCK_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block offset not aligned to the block size")]
    Misaligned,
    #[error("block outside the piece")]
    OutOfBounds,
    #[error("unexpected block length")]
    WrongLength,
}

/// Accumulates the blocks of one in-progress piece.
///
/// Tracks which blocks have been received, which are currently requested
/// from some peer (the scheduler's view), and which peers contributed data,
/// so a hash mismatch can be charged to them.
pub struct PieceBuffer {
    data: Vec<u8>,
    received: Vec<bool>,
    requested: Vec<bool>,
    contributors: HashSet<SocketAddr>,
    received_count: usize,
}

impl PieceBuffer {
    pub fn new(piece_len: u32) -> Self {
        let blocks = piece_len.div_ceil(BLOCK_LEN) as usize;
        Self {
            data: vec![0u8; piece_len as usize],
            received: vec![false; blocks],
            requested: vec![false; blocks],
            contributors: HashSet::new(),
            received_count: 0,
        }
    }

    pub fn block_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.received.len()
    }

    /// Store one block. Returns `Ok(true)` when the piece just became
    /// complete; a duplicate block is ignored without overwriting.
    pub fn accept(
        &mut self,
        begin: u32,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<bool, BlockError> {
        if begin % BLOCK_LEN != 0 {
            return Err(BlockError::Misaligned);
        }
        let block = (begin / BLOCK_LEN) as usize;
        if block >= self.received.len() {
            return Err(BlockError::OutOfBounds);
        }
        let expected = (self.data.len() - begin as usize).min(BLOCK_LEN as usize);
        if data.len() != expected {
            return Err(BlockError::WrongLength);
        }

        if self.received[block] {
            return Ok(false);
        }

        self.data[begin as usize..begin as usize + data.len()].copy_from_slice(data);
        self.received[block] = true;
        self.requested[block] = true;
        self.contributors.insert(from);
        self.received_count += 1;
        Ok(self.is_complete())
    }

    /// Lowest block index neither received nor handed to a peer.
    pub fn next_unrequested(&self) -> Option<u32> {
        self.requested
            .iter()
            .position(|requested| !requested)
            .map(|i| i as u32)
    }

    pub fn has_unrequested(&self) -> bool {
        self.next_unrequested().is_some()
    }

    pub fn mark_requested(&mut self, block: u32) {
        if let Some(slot) = self.requested.get_mut(block as usize) {
            *slot = true;
        }
    }

    /// Make a timed-out or abandoned block eligible for re-dispatch.
    pub fn unmark_requested(&mut self, begin: u32) {
        let block = (begin / BLOCK_LEN) as usize;
        if let (Some(requested), Some(received)) =
            (self.requested.get_mut(block), self.received.get(block))
        {
            if !received {
                *requested = false;
            }
        }
    }

    pub fn contributors(&self) -> &HashSet<SocketAddr> {
        &self.contributors
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
