//! # Byte-range distribution engine
//!
//! Maps a logical `(offset, length)` range on an object onto a sequence of
//! `(server_index, sub_offset, sub_length, block_id)` tuples, according to
//! one of a small set of pluggable strategies. Grounded on the original
//! implementation's `j_distribution_*` iterator contract: `reset` arms the
//! iterator, repeated `next` calls drain it, and two iterations over the
//! same range always produce the same sequence.

/// One sub-range assigned to a single server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionTuple {
    pub server_index: usize,
    pub sub_offset: u64,
    pub sub_length: u64,
    pub block_id: u64,
}

/// The strategy used to spread a byte range across servers.
#[derive(Debug, Clone)]
pub enum DistributionStrategy {
    /// Fixed-size blocks assigned round-robin across `server_count` servers.
    RoundRobin { block_size: u64 },
    /// Every byte goes to one chosen server.
    Single { server_index: usize },
    /// Server `i` receives `weights[i] / sum(weights)` of each round.
    Weighted { weights: Vec<u64> },
}

impl DistributionStrategy {
    pub fn round_robin(block_size: u64) -> Self {
        DistributionStrategy::RoundRobin { block_size }
    }

    pub fn single(server_index: usize) -> Self {
        DistributionStrategy::Single { server_index }
    }

    pub fn weighted(weights: Vec<u64>) -> Self {
        DistributionStrategy::Weighted { weights }
    }

    /// Arms a fresh iterator over `[offset, offset + length)` for a fleet of
    /// `server_count` servers.
    pub fn iter(&self, server_count: usize, offset: u64, length: u64) -> DistributionIter<'_> {
        DistributionIter::new(self, server_count, offset, length)
    }
}

/// Per-iteration mutable state for a distribution walk. Two iterators
/// constructed with identical arguments always yield identical sequences,
/// since all state is a deterministic function of `(offset, length)`.
pub struct DistributionIter<'a> {
    strategy: &'a DistributionStrategy,
    server_count: usize,
    remaining: u64,
    cursor: u64,
}

impl<'a> DistributionIter<'a> {
    fn new(strategy: &'a DistributionStrategy, server_count: usize, offset: u64, length: u64) -> Self {
        Self {
            strategy,
            server_count,
            remaining: length,
            cursor: offset,
        }
    }
}

impl<'a> Iterator for DistributionIter<'a> {
    type Item = DistributionTuple;

    fn next(&mut self) -> Option<DistributionTuple> {
        if self.remaining == 0 || self.server_count == 0 {
            return None;
        }

        match self.strategy {
            DistributionStrategy::RoundRobin { block_size } => {
                let block_size = *block_size;
                let block_id = self.cursor / block_size;
                let server_index = (block_id % self.server_count as u64) as usize;
                let within_block = self.cursor % block_size;
                // This server's local file offset: the round number
                // (how many times round-robin has already cycled back to
                // it) times the block size, plus the position within the
                // current block.
                let round = block_id / self.server_count as u64;
                let sub_offset = round * block_size + within_block;
                let space_left_in_block = block_size - within_block;
                let sub_length = space_left_in_block.min(self.remaining);

                self.cursor += sub_length;
                self.remaining -= sub_length;

                Some(DistributionTuple {
                    server_index,
                    sub_offset,
                    sub_length,
                    block_id,
                })
            }
            DistributionStrategy::Single { server_index } => {
                let sub_offset = self.cursor;
                let sub_length = self.remaining;
                self.cursor += sub_length;
                self.remaining = 0;
                Some(DistributionTuple {
                    server_index: *server_index,
                    sub_offset,
                    sub_length,
                    block_id: 0,
                })
            }
            DistributionStrategy::Weighted { weights } => {
                let total: u64 = weights.iter().sum();
                if total == 0 {
                    return None;
                }
                // Deterministic round assignment: walk weights in order,
                // handing each server its share of the current round before
                // advancing the cursor past it.
                let round = self.cursor / total;
                let round_start = round * total;
                let mut acc = round_start;
                let mut chosen = None;
                for (server_index, w) in weights.iter().enumerate() {
                    let next_acc = acc + w;
                    if self.cursor < next_acc {
                        let within_round = self.cursor - acc;
                        let sub_length = (next_acc - self.cursor).min(self.remaining);
                        // This server's local file offset: every prior
                        // round already placed `weights[server_index]`
                        // bytes on it.
                        let sub_offset = round * w + within_round;
                        chosen = Some((server_index, sub_offset, sub_length));
                        break;
                    }
                    acc = next_acc;
                }
                let (server_index, sub_offset, sub_length) = chosen?;
                self.cursor += sub_length;
                self.remaining -= sub_length;
                Some(DistributionTuple {
                    server_index,
                    sub_offset,
                    sub_length,
                    block_id: round,
                })
            }
        }
    }
}
