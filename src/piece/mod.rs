mod assembler;
mod bitfield;
mod picker;

pub use assembler::{BlockOutcome, BlockRequest, PieceAssembly};
pub use bitfield::Bitfield;
pub use picker::{PiecePicker, RandomPicker, SequentialPicker};

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;
