// Gear rolling hash and FastCDC cut-point search.
//
//   hash = (hash << 1) + GEAR[byte]
//
// After 64 bytes every earlier byte has been shifted out, so the hash is a
// function of a 64-byte sliding window.  The high bits carry the most
// window history, which is why the boundary masks select high bits.
//
// Normalized chunking uses two masks: a harder one (more bits) before the
// average size and an easier one (fewer bits) after it, which tightens
// the chunk size distribution around the average.

use super::config::{ChunkerConfig, NORMALIZATION};

/// Number of entries in a gear table (one per byte value).
const GEAR_LEN: usize = 256;

/// splitmix64 finalizer, used to derive gear entries deterministically.
const fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

const fn base_gear() -> [u64; GEAR_LEN] {
    let mut table = [0u64; GEAR_LEN];
    let mut i = 0;
    while i < GEAR_LEN {
        table[i] = splitmix64(i as u64);
        i += 1;
    }
    table
}

/// Unseeded gear table, fixed at compile time.
static BASE_GEAR: [u64; GEAR_LEN] = base_gear();

/// Mask with the top `bits` bits set.
#[inline]
const fn high_mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        u64::MAX
    } else {
        !0u64 << (64 - bits)
    }
}

// ---------------------------------------------------------------------------
// GearHasher
// ---------------------------------------------------------------------------

/// Seeded gear table plus the normalized masks for one chunker profile.
///
/// Construction is cheap (256 xors) and the state is immutable, so one
/// instance can drive any number of streams.
#[derive(Clone)]
pub struct GearHasher {
    gear: [u64; GEAR_LEN],
    mask_small: u64,
    mask_large: u64,
    min_size: usize,
    avg_size: usize,
    max_size: usize,
}

impl GearHasher {
    pub fn new(config: &ChunkerConfig) -> Self {
        let salt = splitmix64(config.seed());
        let mut gear = [0u64; GEAR_LEN];
        for (i, slot) in gear.iter_mut().enumerate() {
            *slot = BASE_GEAR[i] ^ splitmix64(salt.wrapping_add(i as u64));
        }
        let bits = config.bits();
        Self {
            gear,
            mask_small: high_mask(bits + NORMALIZATION),
            mask_large: high_mask(bits.saturating_sub(NORMALIZATION)),
            min_size: config.min_size(),
            avg_size: config.average_size(),
            max_size: config.max_size(),
        }
    }

    #[inline(always)]
    fn roll(&self, hash: u64, byte: u8) -> u64 {
        (hash << 1).wrapping_add(self.gear[byte as usize])
    }

    /// Find the length of the next chunk at the start of `data`.
    ///
    /// The caller must pass at least `max_size` bytes unless the stream is
    /// at EOF; with that guarantee the result depends only on content,
    /// never on how the stream was buffered.
    pub fn cut_point(&self, data: &[u8]) -> usize {
        let len = data.len();
        if len <= self.min_size {
            return len;
        }
        let end = len.min(self.max_size);
        let normal = self.avg_size.min(end);

        let mut hash = 0u64;
        let mut i = self.min_size;
        while i < normal {
            hash = self.roll(hash, data[i]);
            if hash & self.mask_small == 0 {
                return i + 1;
            }
            i += 1;
        }
        while i < end {
            hash = self.roll(hash, data[i]);
            if hash & self.mask_large == 0 {
                return i + 1;
            }
            i += 1;
        }
        end
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl std::fmt::Debug for GearHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GearHasher")
            .field("mask_small", &format_args!("{:#018x}", self.mask_small))
            .field("mask_large", &format_args!("{:#018x}", self.mask_large))
            .field("min_size", &self.min_size)
            .field("avg_size", &self.avg_size)
            .field("max_size", &self.max_size)
            .finish()
    }
}
