//! Wire format and buffer pooling.

pub mod frame;
pub mod pool;

pub use frame::{FrameType, FRAME_HEADER_LEN, MAX_DATA_LEN, MAX_FRAME_LEN, MAX_STREAM_ID};
pub use pool::{BufferPool, PooledBuf};
