use std::collections::HashMap;

use crate::{bitfield::Bitfield, download::assembler::PieceBuffer};

/// How many known peers advertise each piece.
pub fn piece_rarity<'a>(
    num_pieces: u32,
    peer_bitmaps: impl Iterator<Item = &'a Bitfield>,
) -> Vec<u32> {
    let mut rarity = vec![0u32; num_pieces as usize];
    for bitmap in peer_bitmaps {
        for index in bitmap.iter_set() {
            rarity[index as usize] += 1;
        }
    }
    rarity
}

/// Choose the next piece to start on for one peer: the rarest piece the peer
/// has that we lack and have not begun, ties broken by ascending index.
/// Pieces with a live buffer are already in progress and are handled by the
/// finish-first pass.
pub fn pick_rarest(
    peer_bitmap: &Bitfield,
    local: &Bitfield,
    buffers: &HashMap<u32, PieceBuffer>,
    rarity: &[u32],
) -> Option<u32> {
    peer_bitmap
        .iter_set()
        .filter(|index| !local.get(*index) && !buffers.contains_key(index))
        .min_by_key(|index| (rarity.get(*index as usize).copied().unwrap_or(0), *index))
}
