// Chunker profiles.
//
// Defines the size bounds and seed for content-defined chunking.  Every
// participant in a sync (client, container store, commit store) must use
// the same profile, otherwise signatures never line up and every chunk
// degrades to a literal Data operation.

/// Default average chunk size (64 KiB).
pub const DEFAULT_AVERAGE_SIZE: usize = 64 * 1024;

/// Default gear-table seed.
pub const DEFAULT_SEED: u64 = 84_372;

/// Smallest accepted minimum chunk size.
pub const MIN_CHUNK_FLOOR: usize = 64;

/// Largest accepted maximum chunk size (256 MiB).
pub const MAX_CHUNK_CEILING: usize = 1 << 28;

/// Normalization level: how many mask bits are added before the average
/// size is reached and removed after it.
pub const NORMALIZATION: u32 = 2;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk sizes must be non-zero")]
    Zero,
    #[error("chunk sizes out of order: min {min} <= avg {avg} <= max {max} violated")]
    Unordered { min: usize, avg: usize, max: usize },
    #[error("average chunk size {0} is not a power of two")]
    AverageNotPowerOfTwo(usize),
    #[error("minimum chunk size {0} is below {MIN_CHUNK_FLOOR}")]
    MinTooSmall(usize),
    #[error("maximum chunk size {0} exceeds {MAX_CHUNK_CEILING}")]
    MaxTooLarge(usize),
}

// ---------------------------------------------------------------------------
// ChunkerConfig
// ---------------------------------------------------------------------------

/// Size bounds and seed for the chunker.
///
/// `average_size` tunes the boundary mask so that cuts land on average
/// every `average_size` bytes; `min_size` and `max_size` clamp pathological
/// inputs (long runs of identical bytes never produce a cut on their own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "RawChunkerConfig")]
pub struct ChunkerConfig {
    average_size: usize,
    min_size: usize,
    max_size: usize,
    seed: u64,
}

impl ChunkerConfig {
    /// Build a validated profile.
    pub fn new(
        min_size: usize,
        average_size: usize,
        max_size: usize,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if min_size == 0 || average_size == 0 || max_size == 0 {
            return Err(ConfigError::Zero);
        }
        if !(min_size <= average_size && average_size <= max_size) {
            return Err(ConfigError::Unordered {
                min: min_size,
                avg: average_size,
                max: max_size,
            });
        }
        if !average_size.is_power_of_two() {
            return Err(ConfigError::AverageNotPowerOfTwo(average_size));
        }
        if min_size < MIN_CHUNK_FLOOR {
            return Err(ConfigError::MinTooSmall(min_size));
        }
        if max_size > MAX_CHUNK_CEILING {
            return Err(ConfigError::MaxTooLarge(max_size));
        }
        Ok(Self {
            average_size,
            min_size,
            max_size,
            seed,
        })
    }

    /// Profile with `min = avg / 4` and `max = avg * 4`, default seed.
    pub fn with_average(average_size: usize) -> Result<Self, ConfigError> {
        Self::new(
            average_size / 4,
            average_size,
            average_size.saturating_mul(4),
            DEFAULT_SEED,
        )
    }

    /// Same bounds, different seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn average_size(&self) -> usize {
        self.average_size
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of mask bits for the average size (`log2(avg)`).
    pub(crate) fn bits(&self) -> u32 {
        self.average_size.trailing_zeros()
    }
}

/// Unvalidated wire form; every deserialised profile goes through `new`.
#[derive(serde::Deserialize)]
struct RawChunkerConfig {
    average_size: usize,
    min_size: usize,
    max_size: usize,
    seed: u64,
}

impl TryFrom<RawChunkerConfig> for ChunkerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawChunkerConfig) -> Result<Self, ConfigError> {
        Self::new(raw.min_size, raw.average_size, raw.max_size, raw.seed)
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            average_size: DEFAULT_AVERAGE_SIZE,
            min_size: DEFAULT_AVERAGE_SIZE / 4,
            max_size: DEFAULT_AVERAGE_SIZE * 4,
            seed: DEFAULT_SEED,
        }
    }
}
