//! Protocol-level constants

/// Depth beyond which the chain is considered immutable (Shelley and later)
pub const SECURITY_PARAMETER_K: u64 = 2160;

/// Byron expresses its stability window as a multiple of the genesis `k`
pub const BYRON_SECURITY_PARAMETER_FACTOR: u64 = 10;

/// How many intersect candidates a chainsync client offers an upstream peer
pub const CHAINSYNC_INTERSECT_POINT_COUNT: usize = 100;

/// Maximum number of pipelined RequestNext messages on a chainsync client
pub const CHAINSYNC_PIPELINE_LIMIT: usize = 50;

/// Receive queue size for a chainsync client, 2x the pipeline limit
pub const CHAINSYNC_RECV_QUEUE_SIZE: usize = CHAINSYNC_PIPELINE_LIMIT * 2;
