use super::BLOCK_SIZE;

/// A block-sized slice of a piece to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Download state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// What happened to a block handed to [`PieceAssembly::add_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; more blocks are needed
    Accepted,
    /// Stored; every block of the piece is now present
    Completed,
    /// Already had it
    Duplicate,
    /// Offset or size does not line up with our block grid
    Unexpected,
}

/// Collects the blocks of one in-flight piece in memory until the whole
/// piece can be hash-verified.
#[derive(Debug)]
pub struct PieceAssembly {
    index: u32,
    data: Vec<u8>,
    blocks: Vec<BlockState>,
    received: usize,
}

impl PieceAssembly {
    pub fn new(index: u32, length: u64) -> Self {
        let length = length as usize;
        let block_count = length.div_ceil(BLOCK_SIZE as usize);
        Self {
            index,
            data: vec![0u8; length],
            blocks: vec![BlockState::Missing; block_count],
            received: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn block_len(&self, block: usize) -> u32 {
        let begin = block * BLOCK_SIZE as usize;
        (self.data.len() - begin).min(BLOCK_SIZE as usize) as u32
    }

    fn request_for(&self, block: usize) -> BlockRequest {
        BlockRequest {
            index: self.index,
            begin: block as u32 * BLOCK_SIZE,
            length: self.block_len(block),
        }
    }

    /// Mark up to `budget` missing blocks as requested and return them.
    pub fn next_requests(&mut self, budget: usize) -> Vec<BlockRequest> {
        let picked: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == BlockState::Missing)
            .map(|(block, _)| block)
            .take(budget)
            .collect();

        picked
            .into_iter()
            .map(|block| {
                self.blocks[block] = BlockState::Requested;
                self.request_for(block)
            })
            .collect()
    }

    /// Requests sent but not yet answered.
    pub fn outstanding(&self) -> Vec<BlockRequest> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == BlockState::Requested)
            .map(|(block, _)| self.request_for(block))
            .collect()
    }

    pub fn outstanding_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|state| **state == BlockState::Requested)
            .count()
    }

    pub fn has_missing(&self) -> bool {
        self.blocks.contains(&BlockState::Missing)
    }

    /// Forget outstanding requests; a choking peer discards them.
    pub fn reset_requested(&mut self) {
        for state in &mut self.blocks {
            if *state == BlockState::Requested {
                *state = BlockState::Missing;
            }
        }
    }

    pub fn add_block(&mut self, begin: u32, data: &[u8]) -> BlockOutcome {
        if begin % BLOCK_SIZE != 0 {
            return BlockOutcome::Unexpected;
        }
        let block = (begin / BLOCK_SIZE) as usize;
        if block >= self.blocks.len() || data.len() != self.block_len(block) as usize {
            return BlockOutcome::Unexpected;
        }
        if self.blocks[block] == BlockState::Received {
            return BlockOutcome::Duplicate;
        }

        let start = begin as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.blocks[block] = BlockState::Received;
        self.received += 1;

        if self.is_complete() {
            BlockOutcome::Completed
        } else {
            BlockOutcome::Accepted
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.blocks.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_grid_with_short_tail() {
        let mut assembly = PieceAssembly::new(3, BLOCK_SIZE as u64 * 2 + 100);
        let requests = assembly.next_requests(10);

        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests[2],
            BlockRequest {
                index: 3,
                begin: BLOCK_SIZE * 2,
                length: 100
            }
        );
        assert!(!assembly.has_missing());
        assert_eq!(assembly.outstanding_count(), 3);
    }

    #[test]
    fn test_budget_limits_requests() {
        let mut assembly = PieceAssembly::new(0, BLOCK_SIZE as u64 * 4);
        assert_eq!(assembly.next_requests(2).len(), 2);
        assert_eq!(assembly.next_requests(1)[0].begin, BLOCK_SIZE * 2);
        assert_eq!(assembly.outstanding_count(), 3);
    }

    #[test]
    fn test_completes_out_of_order() {
        let mut assembly = PieceAssembly::new(0, BLOCK_SIZE as u64 + 4);
        assembly.next_requests(2);

        assert_eq!(assembly.add_block(BLOCK_SIZE, b"tail"), BlockOutcome::Accepted);
        assert_eq!(assembly.add_block(BLOCK_SIZE, b"tail"), BlockOutcome::Duplicate);

        let head = vec![9u8; BLOCK_SIZE as usize];
        assert_eq!(assembly.add_block(0, &head), BlockOutcome::Completed);
        assert_eq!(&assembly.data()[BLOCK_SIZE as usize..], b"tail");
        assert_eq!(assembly.outstanding_count(), 0);
    }

    #[test]
    fn test_rejects_misaligned_blocks() {
        let mut assembly = PieceAssembly::new(0, BLOCK_SIZE as u64);
        assert_eq!(assembly.add_block(1, b"x"), BlockOutcome::Unexpected);
        assert_eq!(assembly.add_block(0, b"short"), BlockOutcome::Unexpected);
        assert_eq!(
            assembly.add_block(BLOCK_SIZE, &[0u8; 4]),
            BlockOutcome::Unexpected
        );
    }

    #[test]
    fn test_reset_requested_after_choke() {
        let mut assembly = PieceAssembly::new(0, BLOCK_SIZE as u64 * 2);
        assembly.next_requests(2);
        assembly.add_block(0, &vec![0u8; BLOCK_SIZE as usize]);
        assembly.reset_requested();

        assert_eq!(assembly.outstanding_count(), 0);
        let again = assembly.next_requests(5);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].begin, BLOCK_SIZE);
    }
}
