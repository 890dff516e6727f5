pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

pub const MIN_BLOCK_SIZE: u64 = 4 * MIB;
pub const MAX_BLOCK_COUNT: u64 = 999;

pub const SLICE_HASH_SIZE: u64 = 256 * KIB;
pub const MAX_RAPID_UPLOAD_SIZE: u64 = 20 * GIB;
pub const LARGE_FILE_NOTICE: u64 = 128 * MIB;

pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_PARALLELISM: usize = 4;
pub const RETRY_BACKOFF_FACTOR: u32 = 3;

pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;
pub const DEFAULT_LEDGER_FLUSH_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_RETRY_BACKOFF_UNIT_MS: u64 = 1000;
pub const DEFAULT_REPLAY_CAPACITY: usize = 256;

// Remote service codes the engine reacts to.
pub const CODE_INSERT_FORBIDDEN: i64 = 31200;
pub const CODE_QUOTA_EXCEEDED: i64 = 31112;
pub const CODE_BLOCK_MISSING: i64 = 31363;
pub const CODE_FILE_NOT_EXIST: i64 = 31066;
pub const CODE_RAPID_NOT_FOUND: i64 = 31079;

pub const ENTITY_TOO_LARGE: &str = "entity too large";
