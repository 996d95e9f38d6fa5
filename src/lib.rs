//! Memory-bounded probabilistic n-gram count store.
//!
//! `countgram` keeps counts for variable-length word-id sequences inside a
//! fixed, pre-allocated memory budget. Instead of storing keys it stores
//! small hashed fingerprints in bucketed, bit-packed filters, together with
//! logarithmically quantized counts. A never-inserted key can answer as
//! present with probability at most `2^-width` per occupied row of its
//! bucket; in exchange the table uses a fraction of the memory of an exact
//! hash map. Keys that cannot be represented safely (full bucket, or a
//! fingerprint collision inside the bucket) fall back to an exact overflow
//! dictionary, so an insert is never silently dropped.
//!
//! On top of the table, [`NgramModel`] adds vocabulary translation,
//! stupid-backoff probability estimation, mark-and-sweep eviction under
//! memory pressure, and a suffix-memoization cache so that repeated and
//! incrementally extended queries are answered in time proportional to the
//! new suffix length.
//!
//! ## Example
//!
//! ```rust
//! use countgram::{ModelConfig, NgramModel};
//! use rand::SeedableRng;
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(7);
//! let mut lm = NgramModel::new(&ModelConfig::default(), &mut rng).unwrap();
//! lm.insert(&["the"], 1000);
//! lm.insert(&["cat"], 5);
//! lm.insert(&["the", "cat"], 3);
//!
//! let ids = lm.lookup_ids(&["the", "cat"]);
//! let (logprob, _state) = lm.prob(&ids);
//! assert!(logprob < 0.0);
//! ```
//!
//! ## Ownership and threading
//!
//! Every structure here is single-owner and synchronous. Nothing locks
//! internally; mutating operations take `&mut self`, and a model instance
//! must not be shared across threads without external serialization. Use
//! one instance per worker when scoring in parallel.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Integer id of an interned word.
pub type WordId = u32;

/// Id reserved for out-of-vocabulary words.
pub const OOV_ID: WordId = 0;
/// Id reserved for the sentence-start token.
pub const BOS_ID: WordId = 1;

const OOV_WORD: &str = "<unk>";
const BOS_WORD: &str = "<s>";

/// Largest count the quantizer tabulates.
pub const MAX_COUNT: u64 = 1 << 30;

/// Fingerprint hash functions available for the non-zero retry chain.
const MAX_HASH_FUNCS: usize = 6;

/// Modulus for the linear hash coefficients. Mersenne prime; products of a
/// coefficient and a word id stay well inside `u128`.
const COEFF_PRIME: u64 = (1 << 61) - 1;

/// Backoff penalty per skipped order, `log10(0.4)` per step.
const BACKOFF: f64 = 0.4;

/// Separator for exact overflow-dictionary keys.
const KEY_SEP: char = ':';

/// Error type for construction and persistence.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Reading or writing a snapshot failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A construction parameter is out of its documented range.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    /// A snapshot is malformed or truncated.
    #[error("corrupt model file: {0}")]
    Corrupt(&'static str),
}

/// Result alias for fallible operations in this crate.
pub type Result<T> = std::result::Result<T, ModelError>;

// Little-endian scalar i/o for the snapshot format.

fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> Result<()> {
    write_u64(w, v.to_bits())
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    Ok(f64::from_bits(read_u64(r)?))
}

/// Reads bytes up to and excluding the next `\n`.
fn read_line_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            return Ok(line);
        }
        line.push(byte[0]);
    }
}

/// Fixed-width random-access array over an arbitrary bit width.
///
/// `addresses` slots of `width` bits each are packed back to back into
/// 64-bit cells; a slot may straddle two cells. Reads and writes mask and
/// shift accordingly. Out-of-range addresses and oversized values are
/// programming errors and trap in debug builds.
pub struct PackedArray {
    addresses: u64,
    width: u32,
    mask: u64,
    cells: Vec<u64>,
}

impl PackedArray {
    /// Allocates a zeroed array of `addresses` slots of `width` bits.
    pub fn new(addresses: u64, width: u32) -> Self {
        assert!(width >= 1 && width <= 64, "slot width must be 1..=64");
        let mask = if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        let bits = addresses * width as u64;
        let cells = vec![0u64; ((bits + 63) >> 6) as usize];
        PackedArray {
            addresses,
            width,
            mask,
            cells,
        }
    }

    /// Returns the value stored at `address`.
    #[inline]
    pub fn read(&self, address: u64) -> u64 {
        debug_assert!(address < self.addresses, "address out of range");
        let bit = address * self.width as u64;
        let cell = (bit >> 6) as usize;
        let offset = (bit & 63) as u32;
        let lo = self.cells[cell] >> offset;
        if offset + self.width <= 64 {
            lo & self.mask
        } else {
            // slot straddles into the next cell
            (lo | (self.cells[cell + 1] << (64 - offset))) & self.mask
        }
    }

    /// Stores `value` at `address`.
    #[inline]
    pub fn write(&mut self, address: u64, value: u64) {
        debug_assert!(address < self.addresses, "address out of range");
        debug_assert!(value <= self.mask, "value wider than the slot");
        let value = value & self.mask;
        let bit = address * self.width as u64;
        let cell = (bit >> 6) as usize;
        let offset = (bit & 63) as u32;
        self.cells[cell] = (self.cells[cell] & !(self.mask << offset)) | (value << offset);
        if offset + self.width > 64 {
            let spill_shift = 64 - offset;
            self.cells[cell + 1] =
                (self.cells[cell + 1] & !(self.mask >> spill_shift)) | (value >> spill_shift);
        }
    }

    /// Returns the stored value combined with `mask` in one pass.
    #[inline]
    pub fn read_xor(&self, address: u64, mask: u64) -> u64 {
        (self.read(address) ^ mask) & self.mask
    }

    /// Stores `value ^ mask` in one pass.
    #[inline]
    pub fn write_xor(&mut self, address: u64, mask: u64, value: u64) {
        self.write(address, (value ^ mask) & self.mask);
    }

    /// Zeroes every slot.
    pub fn reset(&mut self) {
        self.cells.fill(0);
    }

    /// Number of addressable slots.
    #[inline]
    pub fn addresses(&self) -> u64 {
        self.addresses
    }

    /// Bits per slot.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of backing 64-bit cells.
    #[inline]
    pub fn cells(&self) -> usize {
        self.cells.len()
    }

    /// Size of the backing storage in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.cells.len() * 8
    }

    /// Writes the array so that a later [`PackedArray::load`] reproduces the
    /// identical bit layout.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.addresses)?;
        write_u32(w, self.width)?;
        write_u64(w, self.cells.len() as u64)?;
        for &cell in &self.cells {
            write_u64(w, cell)?;
        }
        Ok(())
    }

    /// Reads an array written by [`PackedArray::save`].
    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let addresses = read_u64(r)?;
        let width = read_u32(r)?;
        if width < 1 || width > 64 {
            return Err(ModelError::Corrupt("packed array width out of range"));
        }
        let stored_cells = read_u64(r)?;
        let bits = addresses * width as u64;
        let expect_cells = (bits + 63) >> 6;
        if stored_cells != expect_cells {
            return Err(ModelError::Corrupt("packed array cell count mismatch"));
        }
        let mut cells = vec![0u64; stored_cells as usize];
        for cell in cells.iter_mut() {
            *cell = read_u64(r)?;
        }
        let mask = if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        Ok(PackedArray {
            addresses,
            width,
            mask,
            cells,
        })
    }
}

/// Plain bit vector used for the hit and prefix mark filters.
pub struct BitVector {
    bits: u64,
    words: Vec<u64>,
}

impl BitVector {
    /// Allocates a zeroed vector of `bits` bits.
    pub fn new(bits: u64) -> Self {
        BitVector {
            bits,
            words: vec![0u64; ((bits + 63) >> 6) as usize],
        }
    }

    #[inline]
    pub fn test_bit(&self, index: u64) -> bool {
        debug_assert!(index < self.bits, "bit index out of range");
        self.words[(index >> 6) as usize] >> (index & 63) & 1 == 1
    }

    #[inline]
    pub fn set_bit(&mut self, index: u64) {
        debug_assert!(index < self.bits, "bit index out of range");
        self.words[(index >> 6) as usize] |= 1 << (index & 63);
    }

    #[inline]
    pub fn clear_bit(&mut self, index: u64) {
        debug_assert!(index < self.bits, "bit index out of range");
        self.words[(index >> 6) as usize] &= !(1 << (index & 63));
    }

    /// Clears every bit.
    pub fn reset(&mut self) {
        self.words.fill(0);
    }

    /// Number of addressable bits.
    #[inline]
    pub fn len(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Fraction of bits set. Diagnostic only.
    pub fn fill_ratio(&self) -> f64 {
        if self.bits == 0 {
            return 0.0;
        }
        self.count_ones() as f64 / self.bits as f64
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.bits)?;
        write_u64(w, self.words.len() as u64)?;
        for &word in &self.words {
            write_u64(w, word)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let bits = read_u64(r)?;
        let stored_words = read_u64(r)?;
        if stored_words != (bits + 63) >> 6 {
            return Err(ModelError::Corrupt("bit vector word count mismatch"));
        }
        let mut words = vec![0u64; stored_words as usize];
        for word in words.iter_mut() {
            *word = read_u64(r)?;
        }
        Ok(BitVector { bits, words })
    }
}

/// Logarithmic count quantizer.
///
/// Maps counts in `[1, MAX_COUNT]` onto a small set of codes. Levels are
/// `max(ceil(prev * base), prev + 1)` starting from 1, so a base close to 1
/// keeps small counts exact and spends codes where corpus counts are dense.
/// Immutable after construction; `code` never overestimates a count.
pub struct LogQuantizer {
    base: f64,
    levels: Vec<u64>,
    logs: Vec<f64>,
}

impl LogQuantizer {
    /// Tabulates every quantization level for `base > 1`.
    pub fn new(base: f64) -> Result<Self> {
        if !(base > 1.0) || !base.is_finite() {
            return Err(ModelError::Config("quantizer base must be finite and > 1"));
        }
        let mut levels = Vec::new();
        let mut level = 1u64;
        while level <= MAX_COUNT {
            levels.push(level);
            let scaled = (level as f64 * base).ceil() as u64;
            level = scaled.max(level + 1);
        }
        let logs = levels.iter().map(|&v| (v as f64).log10()).collect();
        Ok(LogQuantizer { base, levels, logs })
    }

    /// Code of the largest tabulated level not exceeding `value`.
    ///
    /// `value` outside `[1, MAX_COUNT]` is a precondition violation.
    #[inline]
    pub fn code(&self, value: u64) -> u32 {
        assert!(
            value >= 1 && value <= MAX_COUNT,
            "quantizer value out of range"
        );
        (self.levels.partition_point(|&level| level <= value) - 1) as u32
    }

    /// Count represented by `code`.
    #[inline]
    pub fn value(&self, code: u32) -> u64 {
        self.levels[code as usize]
    }

    /// `log10` of the count represented by `code`.
    #[inline]
    pub fn log_value(&self, code: u32) -> f64 {
        self.logs[code as usize]
    }

    /// Largest valid code.
    #[inline]
    pub fn max_code(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Bits needed to store any code.
    pub fn code_bits(&self) -> u32 {
        let max = self.max_code() as u64;
        (64 - max.leading_zeros()).max(1)
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_f64(w, self.base)?;
        write_u64(w, self.levels.len() as u64)?;
        for &level in &self.levels {
            write_u64(w, level)?;
        }
        for &log in &self.logs {
            write_f64(w, log)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let base = read_f64(r)?;
        let len = read_u64(r)? as usize;
        if len == 0 {
            return Err(ModelError::Corrupt("quantizer has no levels"));
        }
        let mut levels = vec![0u64; len];
        for level in levels.iter_mut() {
            *level = read_u64(r)?;
        }
        let mut logs = vec![0f64; len];
        for log in logs.iter_mut() {
            *log = read_f64(r)?;
        }
        if levels[0] != 1 || levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ModelError::Corrupt("quantizer levels are not increasing"));
        }
        Ok(LogQuantizer { base, levels, logs })
    }
}

/// Family of seeded linear hash functions over word-id sequences.
///
/// `hash(ids, f)` is `sum((a[f][pos] * ids[pos] + b[f][pos]) mod P) mod range`
/// with per-position coefficient pairs, so a prefix of a longer sequence can
/// be hashed incrementally from the partial sum of its shorter prefix.
/// Coefficients are drawn once from the caller-supplied random source and
/// persist with the table; nothing here is process-global.
pub struct LinearHash {
    range: u64,
    functions: usize,
    positions: usize,
    coeffs: Vec<(u64, u64)>,
}

impl LinearHash {
    /// Draws fresh coefficients for `functions` independent hash functions
    /// over sequences of up to `positions` ids, each ranged to `range`.
    pub fn generate<R: Rng>(range: u64, functions: usize, positions: usize, rng: &mut R) -> Self {
        assert!(range >= 1 && functions >= 1 && positions >= 1);
        let coeffs = (0..functions * positions)
            .map(|_| (rng.gen_range(1..COEFF_PRIME), rng.gen_range(0..COEFF_PRIME)))
            .collect();
        LinearHash {
            range,
            functions,
            positions,
            coeffs,
        }
    }

    /// Hashes the whole sequence with function `func`.
    #[inline]
    pub fn hash(&self, ids: &[WordId], func: usize) -> u64 {
        let mut sum = 0u64;
        for (pos, &id) in ids.iter().enumerate() {
            sum = self.partial(sum, id, pos, func);
        }
        self.finish(sum)
    }

    /// Folds one more position into a running partial sum.
    #[inline]
    pub fn partial(&self, sum: u64, id: WordId, pos: usize, func: usize) -> u64 {
        debug_assert!(func < self.functions, "hash function index out of range");
        debug_assert!(pos < self.positions, "sequence longer than hashed order");
        let (a, b) = self.coeffs[func * self.positions + pos];
        ((sum as u128 + a as u128 * id as u128 + b as u128) % COEFF_PRIME as u128) as u64
    }

    /// Reduces a partial sum to the configured range.
    #[inline]
    pub fn finish(&self, sum: u64) -> u64 {
        sum % self.range
    }

    #[inline]
    pub fn range(&self) -> u64 {
        self.range
    }

    #[inline]
    pub fn functions(&self) -> usize {
        self.functions
    }

    #[inline]
    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.range)?;
        write_u64(w, self.functions as u64)?;
        write_u64(w, self.positions as u64)?;
        for &(a, b) in &self.coeffs {
            write_u64(w, a)?;
            write_u64(w, b)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let range = read_u64(r)?;
        let functions = read_u64(r)? as usize;
        let positions = read_u64(r)? as usize;
        if range == 0 || functions == 0 || positions == 0 {
            return Err(ModelError::Corrupt("hash family parameters are zero"));
        }
        let mut coeffs = Vec::with_capacity(functions * positions);
        for _ in 0..functions * positions {
            let a = read_u64(r)?;
            let b = read_u64(r)?;
            if a == 0 || a >= COEFF_PRIME || b >= COEFF_PRIME {
                return Err(ModelError::Corrupt("hash coefficient out of range"));
            }
            coeffs.push((a, b));
        }
        Ok(LinearHash {
            range,
            functions,
            positions,
            coeffs,
        })
    }
}

/// Capability handed into table operations that should record filter hits.
///
/// The store passes its mark bits through this trait instead of the table
/// calling back into the store, which keeps generic storage free of any
/// model-level bookkeeping.
pub trait MarkSink {
    /// Records that the row at `address` answered a lookup.
    fn mark_address(&mut self, address: u64);
}

/// Sink that records nothing.
pub struct NoMark;

impl MarkSink for NoMark {
    #[inline]
    fn mark_address(&mut self, _address: u64) {}
}

/// Hit and prefix mark filters protecting rows from eviction.
///
/// `hit` covers rows that answered recent lookups, `prefix` covers rows
/// holding the context of a longer stored n-gram. The eviction sweeps skip
/// any row with either bit set.
pub struct MarkBits {
    hit: BitVector,
    prefix: BitVector,
}

impl MarkBits {
    pub fn new(addresses: u64) -> Self {
        MarkBits {
            hit: BitVector::new(addresses),
            prefix: BitVector::new(addresses),
        }
    }

    #[inline]
    pub fn mark_hit(&mut self, address: u64) {
        self.hit.set_bit(address);
    }

    #[inline]
    pub fn mark_prefix(&mut self, address: u64) {
        self.prefix.set_bit(address);
    }

    #[inline]
    pub fn clear_prefix(&mut self, address: u64) {
        self.prefix.clear_bit(address);
    }

    /// True when either mark protects `address`.
    #[inline]
    pub fn is_protected(&self, address: u64) -> bool {
        self.hit.test_bit(address) || self.prefix.test_bit(address)
    }

    /// Clears hit marks, keeping prefix protection intact.
    pub fn clear_hits(&mut self) {
        self.hit.reset();
    }

    /// Number of addresses each mark filter covers.
    #[inline]
    pub fn addresses(&self) -> u64 {
        self.hit.len()
    }

    pub fn hit_count(&self) -> u64 {
        self.hit.count_ones()
    }

    pub fn prefix_count(&self) -> u64 {
        self.prefix.count_ones()
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        self.prefix.save(w)?;
        self.hit.save(w)
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let prefix = BitVector::load(r)?;
        let hit = BitVector::load(r)?;
        if prefix.len() != hit.len() {
            return Err(ModelError::Corrupt("mark filters differ in size"));
        }
        Ok(MarkBits { hit, prefix })
    }
}

impl MarkSink for MarkBits {
    #[inline]
    fn mark_address(&mut self, address: u64) {
        self.hit.set_bit(address);
    }
}

/// Open vocabulary mapping strings to word ids.
///
/// Ids 0 and 1 are reserved for the out-of-vocabulary sentinel and the
/// sentence-start token. Unknown words map to [`OOV_ID`] unless interned
/// through [`Vocab::id_or_insert`].
pub struct Vocab {
    map: HashMap<String, WordId>,
    words: Vec<String>,
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocab {
    pub fn new() -> Self {
        let mut vocab = Vocab {
            map: HashMap::new(),
            words: Vec::new(),
        };
        vocab.id_or_insert(OOV_WORD);
        vocab.id_or_insert(BOS_WORD);
        vocab
    }

    /// Id for `word`, interning it if unseen.
    pub fn id_or_insert(&mut self, word: &str) -> WordId {
        if let Some(&id) = self.map.get(word) {
            return id;
        }
        let id = self.words.len() as WordId;
        self.words.push(word.to_owned());
        self.map.insert(word.to_owned(), id);
        id
    }

    /// Id for `word`, or [`OOV_ID`] when unseen.
    #[inline]
    pub fn id(&self, word: &str) -> WordId {
        self.map.get(word).copied().unwrap_or(OOV_ID)
    }

    /// Word interned under `id`, or the OOV sentinel for unknown ids.
    pub fn word(&self, id: WordId) -> &str {
        self.words.get(id as usize).map_or(OOV_WORD, |w| w.as_str())
    }

    /// Number of interned words, reserved entries included.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.words.len() as u64)?;
        for word in &self.words {
            write_u32(w, word.len() as u32)?;
            w.write_all(word.as_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let count = read_u64(r)? as usize;
        if count < 2 {
            return Err(ModelError::Corrupt("vocabulary misses reserved entries"));
        }
        let mut words = Vec::with_capacity(count);
        let mut map = HashMap::with_capacity(count);
        for id in 0..count {
            let len = read_u32(r)? as usize;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            let word = String::from_utf8(bytes)
                .map_err(|_| ModelError::Corrupt("vocabulary entry is not utf-8"))?;
            map.insert(word.clone(), id as WordId);
            words.push(word);
        }
        Ok(Vocab { map, words })
    }
}

/// Construction parameters for a [`FingerprintTable`].
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    /// Total memory budget for both bit-packed filters, in megabytes.
    pub budget_mb: u32,
    /// Fingerprint width in bits (1..=32). The accepted false-answer
    /// probability is `2^-width` per occupied row of a bucket.
    pub width: u32,
    /// Rows per bucket.
    pub bucket_range: u8,
    /// Quantizer base; values close to 1 keep small counts exact.
    pub quant_base: f64,
    /// Longest key sequence the hash families cover.
    pub order: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            budget_mb: 16,
            width: 16,
            bucket_range: 8,
            // eight quantization steps per decade
            quant_base: 10f64.powf(0.125),
            order: 5,
        }
    }
}

/// Occupancy and fallback statistics for a table.
#[derive(Clone, Copy, Debug)]
pub struct TableStats {
    pub cells: u64,
    pub buckets: u64,
    pub bucket_range: u8,
    pub fingerprint_bits: u32,
    pub value_bits: u32,
    pub rows_occupied: u64,
    pub full_buckets: u64,
    pub largest_bucket: u8,
    pub overflow_entries: usize,
    pub collisions: u64,
    pub filter_bytes: usize,
    pub value_bytes: usize,
}

struct OverflowEntry {
    count: u64,
    hit: bool,
}

/// Where a key currently resides.
enum Lookup {
    Overflow(u64),
    Filter { row: u64, count: u64 },
    Miss,
}

/// Bucketed fingerprint store with quantized values and an exact overflow
/// dictionary.
///
/// Keys are word-id sequences. A key hashes to one bucket of
/// `bucket_range` rows; its non-zero fingerprint is stored in the row
/// alongside the quantized count. A fingerprint collision inside the bucket
/// or a full bucket routes the key to the overflow dictionary, which keeps
/// the exact unquantized count and is consulted first on every later
/// operation for that key. The dictionary is the only component whose
/// memory is not reserved up front.
pub struct FingerprintTable {
    cells: u64,
    width: u32,
    value_bits: u32,
    bucket_range: u8,
    buckets: u64,
    occupancy: Vec<u8>,
    fingerprints: PackedArray,
    values: PackedArray,
    bucket_hash: LinearHash,
    finger_hash: LinearHash,
    quantizer: LogQuantizer,
    overflow: BTreeMap<String, OverflowEntry>,
    collisions: u64,
}

impl FingerprintTable {
    /// Sizes both filters from the byte budget and draws hash coefficients
    /// from `rng`.
    pub fn new<R: Rng>(config: &TableConfig, rng: &mut R) -> Result<Self> {
        if config.width < 1 || config.width > 32 {
            return Err(ModelError::Config("fingerprint width must be 1..=32"));
        }
        if config.bucket_range == 0 {
            return Err(ModelError::Config("bucket range must be at least 1"));
        }
        if config.budget_mb == 0 {
            return Err(ModelError::Config("memory budget must be at least 1 MB"));
        }
        if config.order == 0 {
            return Err(ModelError::Config("order must be at least 1"));
        }
        let quantizer = LogQuantizer::new(config.quant_base)?;
        let value_bits = quantizer.code_bits();
        let row_bits = (config.width + value_bits) as u64;
        let total_bits = (config.budget_mb as u64) << 23;
        let mut cells = (total_bits + row_bits - 1) / row_bits;
        let rem = cells % config.bucket_range as u64;
        if rem != 0 {
            cells += config.bucket_range as u64 - rem;
        }
        // one spare bucket keeps the last addressable bucket fully in range
        let buckets = cells / config.bucket_range as u64 - 1;
        if buckets < 1 {
            return Err(ModelError::Config("budget too small for one bucket"));
        }
        Ok(FingerprintTable {
            cells,
            width: config.width,
            value_bits,
            bucket_range: config.bucket_range,
            buckets,
            occupancy: vec![0u8; buckets as usize],
            fingerprints: PackedArray::new(cells, config.width),
            values: PackedArray::new(cells, value_bits),
            bucket_hash: LinearHash::generate(buckets, 1, config.order, rng),
            finger_hash: LinearHash::generate(
                1u64 << config.width,
                MAX_HASH_FUNCS,
                config.order,
                rng,
            ),
            quantizer,
            overflow: BTreeMap::new(),
            collisions: 0,
        })
    }

    /// Number of filter rows.
    #[inline]
    pub fn cells(&self) -> u64 {
        self.cells
    }

    /// Longest key sequence the table hashes.
    #[inline]
    pub fn order(&self) -> usize {
        self.bucket_hash.positions()
    }

    /// Number of exact overflow entries.
    #[inline]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    #[inline]
    fn bucket(&self, ids: &[WordId]) -> u64 {
        self.bucket_hash.hash(ids, 0)
    }

    /// Non-zero fingerprint for `ids`, retrying successive hash functions
    /// starting at the bucket-dependent index and wrapping around.
    fn fingerprint(&self, ids: &[WordId], bucket: u64) -> u64 {
        let start = (bucket as usize) % MAX_HASH_FUNCS;
        let mut func = start;
        loop {
            let fp = self.finger_hash.hash(ids, func);
            if fp != 0 {
                return fp;
            }
            func = (func + 1) % MAX_HASH_FUNCS;
            if func == start {
                warn!("no non-zero fingerprint found for key, storing zero");
                return 0;
            }
        }
    }

    fn overflow_key(ids: &[WordId]) -> String {
        let mut key = String::with_capacity(ids.len() * 6);
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEP);
            }
            let _ = write!(key, "{id}");
        }
        key
    }

    /// Inserts `count` for `ids`, returning the filter row used or `None`
    /// when the key was routed to the overflow dictionary. An existing
    /// identical fingerprint in the bucket counts as an unresolvable
    /// collision and also routes to the dictionary.
    pub fn insert(&mut self, ids: &[WordId], count: u64) -> Option<u64> {
        let bucket = self.bucket(ids);
        if self.occupancy[bucket as usize] < self.bucket_range {
            let fp = self.fingerprint(ids, bucket);
            let first = bucket * self.bucket_range as u64;
            let mut empty = None;
            for row in first..first + self.bucket_range as u64 {
                let stored = self.fingerprints.read(row);
                if stored == 0 {
                    if empty.is_none() {
                        empty = Some(row);
                    }
                } else if stored == fp {
                    self.collisions += 1;
                    self.overflow
                        .insert(Self::overflow_key(ids), OverflowEntry { count, hit: false });
                    return None;
                }
            }
            debug_assert!(empty.is_some(), "occupancy counter disagrees with rows");
            match empty {
                Some(row) => {
                    let code = self.quantizer.code(count.clamp(1, MAX_COUNT));
                    self.fingerprints.write(row, fp);
                    self.values.write(row, code as u64);
                    self.occupancy[bucket as usize] += 1;
                    Some(row)
                }
                None => {
                    self.overflow
                        .insert(Self::overflow_key(ids), OverflowEntry { count, hit: false });
                    None
                }
            }
        } else {
            // bucket is full
            self.overflow
                .insert(Self::overflow_key(ids), OverflowEntry { count, hit: false });
            None
        }
    }

    fn locate(&self, ids: &[WordId]) -> Lookup {
        if let Some(entry) = self.overflow.get(&Self::overflow_key(ids)) {
            return Lookup::Overflow(entry.count);
        }
        let bucket = self.bucket(ids);
        let fp = self.fingerprint(ids, bucket);
        let first = bucket * self.bucket_range as u64;
        for row in first..first + self.bucket_range as u64 {
            if self.fingerprints.read(row) == fp {
                let code = self.values.read(row) as u32;
                return Lookup::Filter {
                    row,
                    count: self.quantizer.value(code),
                };
            }
        }
        Lookup::Miss
    }

    /// Count stored for `ids`, or `None` when the key is in neither the
    /// filter nor the overflow dictionary. `None` is distinct from a stored
    /// zero-adjacent count; misses are an expected outcome, not an error.
    pub fn get(&self, ids: &[WordId]) -> Option<u64> {
        match self.locate(ids) {
            Lookup::Overflow(count) => Some(count),
            Lookup::Filter { count, .. } => Some(count),
            Lookup::Miss => None,
        }
    }

    /// Like [`FingerprintTable::get`], additionally reporting a filter hit
    /// through `sink` and flagging overflow entries as hit in place.
    pub fn get_tracked<M: MarkSink>(&mut self, ids: &[WordId], sink: &mut M) -> Option<u64> {
        if let Some(entry) = self.overflow.get_mut(&Self::overflow_key(ids)) {
            entry.hit = true;
            return Some(entry.count);
        }
        let bucket = self.bucket(ids);
        let fp = self.fingerprint(ids, bucket);
        let first = bucket * self.bucket_range as u64;
        for row in first..first + self.bucket_range as u64 {
            if self.fingerprints.read(row) == fp {
                sink.mark_address(row);
                let code = self.values.read(row) as u32;
                return Some(self.quantizer.value(code));
            }
        }
        None
    }

    /// Adds `delta` to the stored count, inserting the key when it is
    /// absent everywhere. Returns `true` when the key was already resident.
    /// The touched location is reported the same way as a tracked lookup.
    pub fn accumulate<M: MarkSink>(&mut self, ids: &[WordId], delta: u64, sink: &mut M) -> bool {
        if let Some(entry) = self.overflow.get_mut(&Self::overflow_key(ids)) {
            entry.count += delta;
            entry.hit = true;
            return true;
        }
        let bucket = self.bucket(ids);
        let fp = self.fingerprint(ids, bucket);
        let first = bucket * self.bucket_range as u64;
        for row in first..first + self.bucket_range as u64 {
            if self.fingerprints.read(row) == fp {
                let old = self.quantizer.value(self.values.read(row) as u32);
                let code = self.quantizer.code((old + delta).clamp(1, MAX_COUNT));
                self.values.write(row, code as u64);
                sink.mark_address(row);
                return true;
            }
        }
        self.insert(ids, delta);
        false
    }

    /// Removes `ids` from whichever store holds it.
    pub fn remove(&mut self, ids: &[WordId]) {
        if self.overflow.remove(&Self::overflow_key(ids)).is_some() {
            return;
        }
        let bucket = self.bucket(ids);
        let fp = self.fingerprint(ids, bucket);
        let first = bucket * self.bucket_range as u64;
        for row in first..first + self.bucket_range as u64 {
            if self.fingerprints.read(row) == fp {
                self.fingerprints.write(row, 0);
                self.values.write(row, 0);
                self.occupancy[bucket as usize] -= 1;
                return;
            }
        }
    }

    /// Zeroes the occupied filter row at `row` and releases its bucket slot.
    pub fn remove_address(&mut self, row: u64) {
        debug_assert!(row < self.cells, "row out of range");
        debug_assert!(self.fingerprints.read(row) != 0, "removing an empty row");
        self.fingerprints.write(row, 0);
        self.values.write(row, 0);
        let bucket = (row / self.bucket_range as u64) as usize;
        self.occupancy[bucket] -= 1;
    }

    /// True when the filter row at `row` holds a fingerprint.
    #[inline]
    pub fn row_in_use(&self, row: u64) -> bool {
        self.fingerprints.read(row) != 0
    }

    /// Number of addressable buckets.
    #[inline]
    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    /// Rows per bucket.
    #[inline]
    pub fn bucket_range(&self) -> u8 {
        self.bucket_range
    }

    /// Occupancy counter of `bucket`.
    #[inline]
    pub fn bucket_occupancy(&self, bucket: u64) -> u8 {
        self.occupancy[bucket as usize]
    }

    /// Largest occupancy over all buckets.
    pub fn largest_occupancy(&self) -> u8 {
        self.occupancy.iter().copied().max().unwrap_or(0)
    }

    /// Drops overflow entries that were never hit and whose key has at
    /// least `min_order` ids. Returns the number of entries dropped.
    pub fn prune_overflow(&mut self, min_order: usize) -> usize {
        let before = self.overflow.len();
        self.overflow
            .retain(|key, entry| entry.hit || key.split(KEY_SEP).count() < min_order);
        before - self.overflow.len()
    }

    /// Resets the hit flag of every overflow entry.
    pub fn clear_overflow_hits(&mut self) {
        for entry in self.overflow.values_mut() {
            entry.hit = false;
        }
    }

    /// Number of overflow entries flagged as hit.
    pub fn overflow_hit_count(&self) -> usize {
        self.overflow.values().filter(|e| e.hit).count()
    }

    /// Current occupancy and fallback statistics.
    pub fn stats(&self) -> TableStats {
        let rows_occupied = self.occupancy.iter().map(|&o| o as u64).sum();
        let full_buckets = self
            .occupancy
            .iter()
            .filter(|&&o| o == self.bucket_range)
            .count() as u64;
        let largest_bucket = self.occupancy.iter().copied().max().unwrap_or(0);
        TableStats {
            cells: self.cells,
            buckets: self.buckets,
            bucket_range: self.bucket_range,
            fingerprint_bits: self.width,
            value_bits: self.value_bits,
            rows_occupied,
            full_buckets,
            largest_bucket,
            overflow_entries: self.overflow.len(),
            collisions: self.collisions,
            filter_bytes: self.fingerprints.byte_size(),
            value_bytes: self.values.byte_size(),
        }
    }

    /// Writes parameters, hash families, quantizer, both filters and the
    /// overflow dictionary. The output is byte-for-byte reproducible.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.cells)?;
        write_u32(w, self.width)?;
        write_u32(w, self.value_bits)?;
        write_u32(w, self.bucket_range as u32)?;
        write_u64(w, self.buckets)?;
        write_u64(w, self.collisions)?;
        self.bucket_hash.save(w)?;
        self.finger_hash.save(w)?;
        self.quantizer.save(w)?;
        self.fingerprints.save(w)?;
        self.values.save(w)?;
        write_u64(w, self.overflow.len() as u64)?;
        for (key, entry) in &self.overflow {
            writeln!(w, "{key}\t{}", entry.count)?;
        }
        Ok(())
    }

    /// Reads a table written by [`FingerprintTable::save`]. Bucket
    /// occupancy counters are recomputed from the fingerprint filter.
    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let cells = read_u64(r)?;
        let width = read_u32(r)?;
        let value_bits = read_u32(r)?;
        let bucket_range = read_u32(r)?;
        let buckets = read_u64(r)?;
        let collisions = read_u64(r)?;
        if width < 1 || width > 32 {
            return Err(ModelError::Corrupt("fingerprint width out of range"));
        }
        if bucket_range == 0 || bucket_range > u8::MAX as u32 {
            return Err(ModelError::Corrupt("bucket range out of range"));
        }
        if cells % bucket_range as u64 != 0 || buckets != cells / bucket_range as u64 - 1 {
            return Err(ModelError::Corrupt("bucket layout mismatch"));
        }
        let bucket_hash = LinearHash::load(r)?;
        let finger_hash = LinearHash::load(r)?;
        if bucket_hash.range() != buckets || finger_hash.range() != 1u64 << width {
            return Err(ModelError::Corrupt("hash ranges disagree with layout"));
        }
        if bucket_hash.functions() != 1
            || finger_hash.functions() != MAX_HASH_FUNCS
            || bucket_hash.positions() != finger_hash.positions()
        {
            return Err(ModelError::Corrupt("hash family shapes disagree"));
        }
        let quantizer = LogQuantizer::load(r)?;
        if quantizer.code_bits() != value_bits {
            return Err(ModelError::Corrupt("quantizer width disagrees with table"));
        }
        let fingerprints = PackedArray::load(r)?;
        let values = PackedArray::load(r)?;
        if fingerprints.addresses() != cells
            || values.addresses() != cells
            || fingerprints.width() != width
            || values.width() != value_bits
        {
            return Err(ModelError::Corrupt("filter layout disagrees with table"));
        }
        let mut occupancy = vec![0u8; buckets as usize];
        for bucket in 0..buckets {
            let first = bucket * bucket_range as u64;
            for row in first..first + bucket_range as u64 {
                if fingerprints.read(row) != 0 {
                    occupancy[bucket as usize] += 1;
                }
            }
        }
        let entries = read_u64(r)?;
        let mut overflow = BTreeMap::new();
        for _ in 0..entries {
            let line = read_line_bytes(r)?;
            let line = std::str::from_utf8(&line)
                .map_err(|_| ModelError::Corrupt("overflow record is not utf-8"))?;
            let (key, count) = line
                .split_once('\t')
                .ok_or(ModelError::Corrupt("overflow record misses a tab"))?;
            let count = count
                .parse::<u64>()
                .map_err(|_| ModelError::Corrupt("overflow count is not a number"))?;
            overflow.insert(key.to_owned(), OverflowEntry { count, hit: false });
        }
        Ok(FingerprintTable {
            cells,
            width,
            value_bits,
            bucket_range: bucket_range as u8,
            buckets,
            occupancy,
            fingerprints,
            values,
            bucket_hash,
            finger_hash,
            quantizer,
            overflow,
            collisions,
        })
    }
}

/// Index of a node inside a [`SuffixCache`] arena.
pub type NodeId = u32;

const ROOT_NODE: NodeId = 0;

/// Opaque continuation marker returned by [`NgramModel::prob`].
///
/// Callers may compare states for identity and pass them back on the next
/// incremental extension; nothing else about the value is stable. States
/// are invalidated by [`NgramModel::clear_cache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContinuationState(NodeId);

const ROOT_STATE: ContinuationState = ContinuationState(ROOT_NODE);

struct CacheNode<V> {
    value: V,
    state: Option<ContinuationState>,
    children: HashMap<WordId, NodeId>,
}

/// Reverse-order trie memoizing values for id-sequence suffixes.
///
/// The path for a sequence runs from its last id towards its first, so two
/// sequences sharing a suffix share a path prefix and extending a sequence
/// by one id costs one extra edge. Nodes start out holding the `unknown`
/// sentinel; the distinct `null` sentinel marks a suffix as definitively
/// absent and short-circuits deeper walks. The cache never evicts on its
/// own and is meant to be cleared between independent units of work.
pub struct SuffixCache<V> {
    unknown: V,
    null: V,
    nodes: Vec<CacheNode<V>>,
}

impl<V: Copy + PartialEq> SuffixCache<V> {
    /// Creates an empty cache with the two distinguished sentinel values.
    pub fn new(unknown: V, null: V) -> Self {
        SuffixCache {
            unknown,
            null,
            nodes: vec![CacheNode {
                value: unknown,
                state: None,
                children: HashMap::new(),
            }],
        }
    }

    fn child_or_insert(&mut self, node: NodeId, id: WordId) -> NodeId {
        if let Some(&child) = self.nodes[node as usize].children.get(&id) {
            return child;
        }
        let child = self.nodes.len() as NodeId;
        let unknown = self.unknown;
        self.nodes.push(CacheNode {
            value: unknown,
            state: None,
            children: HashMap::new(),
        });
        self.nodes[node as usize].children.insert(id, child);
        child
    }

    /// Cached value and continuation state for the full sequence, or `None`
    /// when the terminal node is missing or still holds a sentinel.
    pub fn check_ngram(&self, ids: &[WordId]) -> Option<(V, Option<ContinuationState>)> {
        let mut node = ROOT_NODE;
        for id in ids.iter().rev() {
            node = *self.nodes[node as usize].children.get(id)?;
        }
        let entry = &self.nodes[node as usize];
        if entry.value == self.unknown || entry.value == self.null {
            return None;
        }
        Some((entry.value, entry.state))
    }

    /// Stores `value` and `state` for the full sequence, creating the path.
    pub fn set_ngram(&mut self, ids: &[WordId], value: V, state: Option<ContinuationState>) {
        let mut node = ROOT_NODE;
        for &id in ids.iter().rev() {
            node = self.child_or_insert(node, id);
        }
        self.nodes[node as usize].value = value;
        self.nodes[node as usize].state = state;
    }

    /// Collects the node for every suffix along the path into `out`,
    /// deepest first, creating missing nodes with the `unknown` sentinel.
    /// Stops early when a node already holds `null` and returns the number
    /// of nodes collected. Callers fill in values as they climb.
    pub fn path_nodes(&mut self, ids: &[WordId], out: &mut Vec<NodeId>) -> usize {
        out.clear();
        let mut node = ROOT_NODE;
        for &id in ids.iter().rev() {
            node = self.child_or_insert(node, id);
            if self.nodes[node as usize].value == self.null {
                break;
            }
            out.push(node);
        }
        out.reverse();
        out.len()
    }

    /// Value held by `node`.
    #[inline]
    pub fn value(&self, node: NodeId) -> V {
        self.nodes[node as usize].value
    }

    /// Replaces the value held by `node`.
    #[inline]
    pub fn set_value(&mut self, node: NodeId, value: V) {
        self.nodes[node as usize].value = value;
    }

    /// Number of nodes, the root included.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Drops every node. Outstanding [`ContinuationState`]s become stale.
    pub fn clear(&mut self) {
        let unknown = self.unknown;
        self.nodes.clear();
        self.nodes.push(CacheNode {
            value: unknown,
            state: None,
            children: HashMap::new(),
        });
    }
}

/// Score-cache sentinel for "not computed yet".
const SCORE_UNKNOWN: f64 = f64::INFINITY;
/// Score-cache sentinel for "definitively absent".
const SCORE_NULL: f64 = f64::NEG_INFINITY;
/// Prefix-cache sentinels; stored values are non-negative counts.
const PREFIX_UNKNOWN: i64 = -1;
const PREFIX_NULL: i64 = -2;
/// The prefix cache is cleared once it grows past this many nodes.
const PREFIX_CACHE_LIMIT: usize = 10_000;

/// Construction parameters for an [`NgramModel`].
#[derive(Clone, Copy, Debug)]
pub struct ModelConfig {
    /// Table sizing and hashing parameters.
    pub table: TableConfig,
    /// When set, the corpus-size counter is frozen and fresh inserts are
    /// hit-marked immediately so adaptation sweeps keep them.
    pub adapting: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            table: TableConfig::default(),
            adapting: false,
        }
    }
}

/// Online randomized language-model store.
///
/// Wraps a [`FingerprintTable`] with vocabulary translation, stupid-backoff
/// probability estimation, mark-and-sweep eviction and a suffix cache that
/// memoizes scores between [`NgramModel::clear_cache`] calls.
pub struct NgramModel {
    vocab: Vocab,
    corpus_size: u64,
    order: usize,
    adapting: bool,
    alpha: Vec<f64>,
    marks: MarkBits,
    score_cache: SuffixCache<f64>,
    prefix_cache: SuffixCache<i64>,
    table: FingerprintTable,
}

impl NgramModel {
    /// Builds an empty model; hash seeds are drawn from `rng`.
    pub fn new<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        let table = FingerprintTable::new(&config.table, rng)?;
        let order = config.table.order;
        let alpha = (0..=order).map(|k| k as f64 * BACKOFF.log10()).collect();
        let marks = MarkBits::new(table.cells());
        Ok(NgramModel {
            vocab: Vocab::new(),
            corpus_size: 0,
            order,
            adapting: config.adapting,
            alpha,
            marks,
            score_cache: SuffixCache::new(SCORE_UNKNOWN, SCORE_NULL),
            prefix_cache: SuffixCache::new(PREFIX_UNKNOWN, PREFIX_NULL),
            table,
        })
    }

    /// Inserts an n-gram with its count, interning unseen tokens. The key
    /// lands in the filter or, on collision or a full bucket, in the exact
    /// overflow dictionary; either way it is retrievable afterwards.
    pub fn insert<S: AsRef<str>>(&mut self, tokens: &[S], count: u64) {
        let ids: Vec<WordId> = tokens
            .iter()
            .map(|t| self.vocab.id_or_insert(t.as_ref()))
            .collect();
        let row = self.table.insert(&ids, count);
        if count > 1 && ids.len() < self.order {
            self.mark_prefix(&ids);
        }
        // track corpus size from unigrams, excluding the start token
        if ids.len() == 1 && !self.adapting && ids[0] != BOS_ID {
            self.corpus_size += count;
        }
        if self.adapting {
            if let Some(row) = row {
                self.marks.mark_hit(row);
            }
        }
    }

    /// Adds `delta` to an n-gram's count, inserting it when absent. The
    /// context is checked and protected first; a missing context leaves the
    /// store untouched. Returns `true` when the key was already resident.
    pub fn update<S: AsRef<str>>(&mut self, tokens: &[S], delta: u64) -> bool {
        let ids: Vec<WordId> = tokens
            .iter()
            .map(|t| self.vocab.id_or_insert(t.as_ref()))
            .collect();
        if delta > 1 && ids.len() < self.order && !self.mark_prefix(&ids) {
            return false;
        }
        self.table.accumulate(&ids, delta, &mut self.marks)
    }

    /// Count stored for the id sequence, hit-marking whatever answers.
    /// `None` means the key is in neither the filter nor the overflow
    /// dictionary, which is distinct from a stored count.
    pub fn query(&mut self, ids: &[WordId]) -> Option<u64> {
        self.table.get_tracked(ids, &mut self.marks)
    }

    /// Removes an n-gram, interning unseen tokens like `insert` does.
    pub fn remove<S: AsRef<str>>(&mut self, tokens: &[S]) {
        let ids: Vec<WordId> = tokens
            .iter()
            .map(|t| self.vocab.id_or_insert(t.as_ref()))
            .collect();
        self.table.remove(&ids);
    }

    /// Stupid-backoff log10 probability of the last word of `ngram` given
    /// the preceding words, plus an opaque continuation state.
    ///
    /// The longest suffix whose count and context count are both present
    /// (with context >= count) provides the estimate; each order skipped
    /// costs a `log10(0.4)` penalty. Unigrams are normalized by the corpus
    /// size, and a sequence with nothing found falls back to a uniform
    /// out-of-vocabulary score. Results are memoized per suffix path until
    /// [`NgramModel::clear_cache`].
    pub fn prob(&mut self, ngram: &[WordId]) -> (f64, ContinuationState) {
        let len = ngram.len();
        assert!(len >= 1 && len <= self.order, "ngram length out of range");
        if let Some((cached, state)) = self.score_cache.check_ngram(ngram) {
            return (cached, state.unwrap_or(ROOT_STATE));
        }
        // counts[i] holds the count of the suffix starting at position i
        let mut counts = vec![0u64; len];
        let mut found = 0usize;
        for i in (0..len).rev() {
            if ngram[i] == OOV_ID {
                break;
            }
            counts[i] = self.query(&ngram[i..]).unwrap_or(0);
            if counts[i] > 0 {
                found = len - i;
            }
        }
        let mut denominator = 0u64;
        while found > 1 {
            let start = len - found;
            let den = self.query(&ngram[start..len - 1]).unwrap_or(0);
            if den > 0 && den >= counts[start] && counts[start] > 0 {
                denominator = den;
                break;
            }
            found -= 1;
        }
        if found == 1 && counts[len - 1] < 1 {
            found = 0;
        }
        let logprob = match found {
            0 => self.alpha[len] + self.oov_logprob(),
            1 => {
                let unigram = if self.corpus_size > 0 {
                    (counts[len - 1] as f64 / self.corpus_size as f64).log10()
                } else {
                    0.0
                };
                self.alpha[len - 1] + unigram
            }
            n => {
                debug_assert!(denominator > 0);
                self.alpha[len - n] + (counts[len - n] as f64 / denominator as f64).log10()
            }
        };
        let state = self.context_state(&ngram[len - found..]);
        self.score_cache.set_ngram(ngram, logprob, Some(state));
        (logprob, state)
    }

    /// Per-suffix counts for subsequence filtering. Fills `counts[i]` with
    /// the count of the suffix starting at `i` and returns the length of
    /// the longest suffix found. With `strict` set, the scan stops at the
    /// first miss and the result is verified against shorter contexts.
    pub fn suffix_counts(&mut self, ids: &[WordId], counts: &mut [u64], strict: bool) -> usize {
        let len = ids.len();
        debug_assert!(counts.len() >= len);
        let mut found = 0usize;
        for i in (0..len).rev() {
            match self.query(&ids[i..]) {
                Some(v) => {
                    counts[i] = v;
                    found = len - i;
                }
                None => {
                    counts[i] = 0;
                    if strict {
                        break;
                    }
                }
            }
        }
        while strict && found > 1 {
            if self.query(&ids[len - found..len - 1]).is_some() {
                break;
            }
            found -= 1;
        }
        found
    }

    /// Protects the context of `ids` from eviction. Returns `false` when
    /// the context is nowhere in the store, which means earlier inserts
    /// were lost and backoff for this key would miss its denominator.
    fn mark_prefix(&mut self, ids: &[WordId]) -> bool {
        if ids.len() <= 1 {
            return true;
        }
        let ctx = &ids[..ids.len() - 1];
        if self.prefix_cache.check_ngram(ctx).is_some() {
            return true;
        }
        let count = match self.table.locate(ctx) {
            Lookup::Miss => {
                warn!("backoff context is missing, the store is not well-formed");
                return false;
            }
            Lookup::Filter { row, count } => {
                self.marks.mark_prefix(row);
                count
            }
            // exact entries are never swept, no bit to set
            Lookup::Overflow(count) => count,
        };
        if self.prefix_cache.node_count() > PREFIX_CACHE_LIMIT {
            self.prefix_cache.clear();
        }
        self.prefix_cache.set_ngram(ctx, count as i64, None);
        true
    }

    fn oov_logprob(&self) -> f64 {
        let known = self.vocab.len().saturating_sub(1).max(1);
        (1.0 / known as f64).log10()
    }

    fn context_state(&mut self, suffix: &[WordId]) -> ContinuationState {
        if suffix.is_empty() {
            return ROOT_STATE;
        }
        let mut path = Vec::with_capacity(suffix.len());
        self.score_cache.path_nodes(suffix, &mut path);
        path.first().map_or(ROOT_STATE, |&n| ContinuationState(n))
    }

    /// Evicts up to `num_to_delete` unprotected rows, fullest buckets
    /// first. Rows with a hit or prefix mark are never touched. Returns the
    /// number of rows removed.
    pub fn heur_delete(&mut self, num_to_delete: u64, order: usize) -> u64 {
        debug!(num_to_delete, order, "starting eviction sweep");
        let mut deleted = 0u64;
        let mut level = self.table.largest_occupancy();
        'sweep: while level > 0 {
            for bucket in 0..self.table.buckets() {
                if deleted >= num_to_delete {
                    break 'sweep;
                }
                if self.table.bucket_occupancy(bucket) != level {
                    continue;
                }
                let first = bucket * self.table.bucket_range() as u64;
                for row in first..first + self.table.bucket_range() as u64 {
                    if self.marks.is_protected(row) || !self.table.row_in_use(row) {
                        continue;
                    }
                    self.table.remove_address(row);
                    deleted += 1;
                }
            }
            level -= 1;
        }
        info!(deleted, "eviction sweep finished");
        deleted
    }

    /// Removes every filter row with neither mark set, then prunes unhit
    /// higher-order entries from the overflow dictionary.
    pub fn remove_non_marked(&mut self) -> u64 {
        let mut deleted = 0u64;
        for row in 0..self.table.cells() {
            if !self.marks.is_protected(row) && self.table.row_in_use(row) {
                self.table.remove_address(row);
                deleted += 1;
            }
        }
        deleted += self.table.prune_overflow(3) as u64;
        info!(deleted, "removed unmarked entries");
        deleted
    }

    /// Clears hit marks everywhere, keeping prefix protection.
    pub fn clear_markings(&mut self) {
        debug!("clearing hit markings");
        self.marks.clear_hits();
        self.table.clear_overflow_hits();
    }

    /// Number of locations flagged by lookups since the last
    /// [`NgramModel::clear_markings`].
    pub fn hit_count(&self) -> u64 {
        self.marks.hit_count() + self.table.overflow_hit_count() as u64
    }

    /// Number of filter rows protecting a backoff context.
    pub fn prefix_count(&self) -> u64 {
        self.marks.prefix_count()
    }

    /// Drops all memoized scores and continuation states. Call between
    /// independent units of work to bound cache memory.
    pub fn clear_cache(&mut self) {
        self.score_cache.clear();
    }

    /// Ids for `tokens` without growing the vocabulary; unseen tokens map
    /// to [`OOV_ID`].
    pub fn lookup_ids<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<WordId> {
        tokens.iter().map(|t| self.vocab.id(t.as_ref())).collect()
    }

    #[inline]
    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    #[inline]
    pub fn corpus_size(&self) -> u64 {
        self.corpus_size
    }

    pub fn set_corpus_size(&mut self, size: u64) {
        self.corpus_size = size;
    }

    #[inline]
    pub fn table(&self) -> &FingerprintTable {
        &self.table
    }

    /// Occupancy and fallback statistics of the underlying table.
    pub fn table_stats(&self) -> TableStats {
        self.table.stats()
    }

    /// Writes the whole model: vocabulary, corpus size, order, mark
    /// filters, then the table. The output is byte-for-byte reproducible.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        info!(
            corpus_size = self.corpus_size,
            order = self.order,
            overflow = self.table.overflow_len(),
            "saving model"
        );
        self.vocab.save(w)?;
        write_u64(w, self.corpus_size)?;
        write_u32(w, self.order as u32)?;
        self.marks.save(w)?;
        self.table.save(w)
    }

    /// Reads a model written by [`NgramModel::save`]. The loaded model is
    /// in adaptation mode: the corpus size stays frozen and fresh inserts
    /// are protected from eviction.
    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let vocab = Vocab::load(r)?;
        let corpus_size = read_u64(r)?;
        let order = read_u32(r)? as usize;
        if order == 0 {
            return Err(ModelError::Corrupt("order is zero"));
        }
        let marks = MarkBits::load(r)?;
        let table = FingerprintTable::load(r)?;
        if table.order() != order {
            return Err(ModelError::Corrupt("hash order disagrees with model"));
        }
        if marks.addresses() != table.cells() {
            return Err(ModelError::Corrupt("mark filters sized unlike the table"));
        }
        let alpha = (0..=order).map(|k| k as f64 * BACKOFF.log10()).collect();
        info!(corpus_size, order, "loaded model");
        Ok(NgramModel {
            vocab,
            corpus_size,
            order,
            adapting: true,
            alpha,
            marks,
            score_cache: SuffixCache::new(SCORE_UNKNOWN, SCORE_NULL),
            prefix_cache: SuffixCache::new(PREFIX_UNKNOWN, PREFIX_NULL),
            table,
        })
    }

    /// Saves the model to a file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.save(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Loads a model from a file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(&mut BufReader::new(File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5EED)
    }

    // 1 MB, four rows per bucket, quantizer exact for counts up to ~10000
    fn tiny_table_config() -> TableConfig {
        TableConfig {
            budget_mb: 1,
            width: 16,
            bucket_range: 4,
            quant_base: 1.0001,
            order: 5,
        }
    }

    fn tiny_model_config() -> ModelConfig {
        ModelConfig {
            table: tiny_table_config(),
            adapting: false,
        }
    }

    fn tiny_model() -> NgramModel {
        NgramModel::new(&tiny_model_config(), &mut rng()).expect("model should build")
    }

    #[test]
    fn packed_array_round_trips_across_cell_boundaries() {
        for width in [11u32, 33] {
            let mut arr = PackedArray::new(200, width);
            let mask = (1u64 << width) - 1;
            for addr in 0..200u64 {
                arr.write(addr, addr.wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask);
            }
            for addr in 0..200u64 {
                assert_eq!(
                    arr.read(addr),
                    addr.wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask,
                    "width {width} address {addr}"
                );
            }
        }
    }

    #[test]
    fn packed_array_writes_do_not_clobber_neighbors() {
        let mut arr = PackedArray::new(64, 13);
        arr.write(20, 0x1FFF);
        arr.write(21, 0);
        arr.write(19, 0);
        assert_eq!(arr.read(20), 0x1FFF);
        arr.write(20, 0);
        assert_eq!(arr.read(19), 0);
        assert_eq!(arr.read(20), 0);
        assert_eq!(arr.read(21), 0);
    }

    #[test]
    fn packed_array_xor_variants_combine_in_one_pass() {
        let mut arr = PackedArray::new(32, 16);
        let finger = 0xBEEF;
        arr.write_xor(7, finger, 0x1234);
        assert_eq!(arr.read(7), 0x1234 ^ finger);
        assert_eq!(arr.read_xor(7, finger), 0x1234);
        arr.reset();
        assert_eq!(arr.read(7), 0);
    }

    #[test]
    fn packed_array_save_load_is_bit_exact() {
        let mut arr = PackedArray::new(100, 21);
        for addr in 0..100u64 {
            arr.write(addr, (addr * addr) & ((1 << 21) - 1));
        }
        let mut bytes = Vec::new();
        arr.save(&mut bytes).expect("save");
        let loaded = PackedArray::load(&mut bytes.as_slice()).expect("load");
        for addr in 0..100u64 {
            assert_eq!(loaded.read(addr), arr.read(addr));
        }
        let mut again = Vec::new();
        loaded.save(&mut again).expect("save");
        assert_eq!(bytes, again, "snapshot must be byte-for-byte reproducible");
    }

    #[test]
    fn bit_vector_set_test_clear() {
        let mut bits = BitVector::new(130);
        bits.set_bit(0);
        bits.set_bit(64);
        bits.set_bit(129);
        assert!(bits.test_bit(0) && bits.test_bit(64) && bits.test_bit(129));
        assert!(!bits.test_bit(1));
        assert_eq!(bits.count_ones(), 3);
        bits.clear_bit(64);
        assert!(!bits.test_bit(64));
        assert!((bits.fill_ratio() - 2.0 / 130.0).abs() < 1e-12);
        bits.reset();
        assert_eq!(bits.count_ones(), 0);
    }

    #[test]
    fn quantizer_never_overestimates() {
        let q = LogQuantizer::new(1.5).expect("quantizer");
        for v in [1u64, 2, 3, 10, 99, 12_345, 1 << 20, MAX_COUNT] {
            let c = q.code(v);
            assert!(q.value(c) <= v, "value {v} decoded above itself");
            if c < q.max_code() {
                assert!(q.value(c + 1) > v, "code for {v} is not the largest fit");
            }
        }
    }

    #[test]
    fn quantizer_round_trips_on_its_codomain() {
        let q = LogQuantizer::new(1.5).expect("quantizer");
        for c in 0..=q.max_code() {
            assert_eq!(q.code(q.value(c)), c);
            assert!((q.log_value(c) - (q.value(c) as f64).log10()).abs() < 1e-12);
        }
    }

    #[test]
    fn quantizer_rejects_degenerate_base() {
        assert!(LogQuantizer::new(1.0).is_err());
        assert!(LogQuantizer::new(0.5).is_err());
        assert!(LogQuantizer::new(f64::NAN).is_err());
    }

    #[test]
    fn quantizer_save_load_round_trip() {
        let q = LogQuantizer::new(1.3).expect("quantizer");
        let mut bytes = Vec::new();
        q.save(&mut bytes).expect("save");
        let loaded = LogQuantizer::load(&mut bytes.as_slice()).expect("load");
        assert_eq!(loaded.max_code(), q.max_code());
        for c in 0..=q.max_code() {
            assert_eq!(loaded.value(c), q.value(c));
        }
    }

    #[test]
    fn linear_hash_incremental_matches_full() {
        let h = LinearHash::generate(1 << 20, 4, 6, &mut rng());
        let ids = [4u32, 7, 9, 1_000_000];
        for func in 0..4 {
            let mut sum = 0u64;
            for (pos, &id) in ids.iter().enumerate() {
                sum = h.partial(sum, id, pos, func);
            }
            assert_eq!(h.finish(sum), h.hash(&ids, func));
        }
    }

    #[test]
    fn linear_hash_stays_in_range_and_differs_by_function() {
        let h = LinearHash::generate(97, 6, 5, &mut rng());
        let ids = [11u32, 22, 33];
        let mut values = Vec::new();
        for func in 0..6 {
            let v = h.hash(&ids, func);
            assert!(v < 97);
            values.push(v);
        }
        values.dedup();
        assert!(values.len() > 1, "independent functions all collided");
    }

    #[test]
    fn table_insert_get_remove() {
        let mut table = FingerprintTable::new(&tiny_table_config(), &mut rng()).expect("table");
        assert!(table.insert(&[1], 1000).is_some());
        assert!(table.insert(&[2], 5).is_some());
        assert!(table.insert(&[1, 2], 3).is_some());
        assert!(table.insert(&[3, 4, 5], 7).is_some());
        assert_eq!(table.get(&[1]), Some(1000));
        assert_eq!(table.get(&[2]), Some(5));
        assert_eq!(table.get(&[1, 2]), Some(3));
        assert_eq!(table.get(&[3, 4, 5]), Some(7));
        assert_eq!(table.get(&[9, 9]), None);
        table.remove(&[2]);
        assert_eq!(table.get(&[2]), None);
    }

    #[test]
    fn duplicate_insert_is_a_collision_and_goes_exact() {
        let mut table = FingerprintTable::new(&tiny_table_config(), &mut rng()).expect("table");
        assert!(table.insert(&[7], 5).is_some());
        // same key again matches its own fingerprint in the bucket
        assert!(table.insert(&[7], 9).is_none());
        assert_eq!(table.overflow_len(), 1);
        assert_eq!(table.get(&[7]), Some(9), "dictionary answers first");
        assert_eq!(table.stats().collisions, 1);
    }

    #[test]
    fn full_bucket_routes_to_overflow_with_exact_value() {
        let mut table = FingerprintTable::new(&tiny_table_config(), &mut rng()).expect("table");
        let target = table.bucket(&[0]);
        let mut same_bucket: Vec<WordId> = Vec::new();
        let mut fingerprints = Vec::new();
        let mut id: WordId = 0;
        while same_bucket.len() < 5 {
            let fp = table.fingerprint(&[id], target);
            if table.bucket(&[id]) == target && !fingerprints.contains(&fp) {
                same_bucket.push(id);
                fingerprints.push(fp);
            }
            id += 1;
        }
        for (i, &key) in same_bucket[..4].iter().enumerate() {
            assert!(
                table.insert(&[key], 10 * (i as u64 + 1)).is_some(),
                "row insert should stay in the filter"
            );
        }
        assert_eq!(table.bucket_occupancy(target), 4);
        // the fifth key finds its bucket full
        assert!(table.insert(&[same_bucket[4]], 123_456_789).is_none());
        assert_eq!(table.overflow_len(), 1);
        assert_eq!(table.get(&[same_bucket[4]]), Some(123_456_789));
        for (i, &key) in same_bucket[..4].iter().enumerate() {
            assert_eq!(table.get(&[key]), Some(10 * (i as u64 + 1)));
        }
    }

    #[test]
    fn insert_then_remove_restores_bit_exact_state() {
        let mut table = FingerprintTable::new(&tiny_table_config(), &mut rng()).expect("table");
        assert!(table.insert(&[3], 30).is_some());
        let mut before = Vec::new();
        table.save(&mut before).expect("save");
        assert!(table.insert(&[42, 43], 100).is_some());
        table.remove(&[42, 43]);
        let mut after = Vec::new();
        table.save(&mut after).expect("save");
        assert_eq!(before, after);
    }

    #[test]
    fn accumulate_adds_and_falls_through_to_insert() {
        let mut table = FingerprintTable::new(&tiny_table_config(), &mut rng()).expect("table");
        let mut sink = NoMark;
        assert!(!table.accumulate(&[5, 6], 4, &mut sink), "absent key inserts");
        assert_eq!(table.get(&[5, 6]), Some(4));
        assert!(table.accumulate(&[5, 6], 6, &mut sink));
        assert_eq!(table.get(&[5, 6]), Some(10));
    }

    #[test]
    fn tracked_get_marks_the_answering_row() {
        let mut table = FingerprintTable::new(&tiny_table_config(), &mut rng()).expect("table");
        assert!(table.insert(&[8], 12).is_some());
        let mut marks = MarkBits::new(table.cells());
        assert_eq!(table.get_tracked(&[8], &mut marks), Some(12));
        assert_eq!(marks.hit_count(), 1);
        assert_eq!(table.get_tracked(&[99], &mut marks), None);
        assert_eq!(marks.hit_count(), 1);
    }

    #[test]
    fn vocab_grows_and_maps_unknowns_to_oov() {
        let mut vocab = Vocab::new();
        let cat = vocab.id_or_insert("cat");
        assert_eq!(vocab.id_or_insert("cat"), cat);
        assert_eq!(vocab.id("cat"), cat);
        assert_eq!(vocab.id("never-seen"), OOV_ID);
        assert_eq!(vocab.word(cat), "cat");
        let mut bytes = Vec::new();
        vocab.save(&mut bytes).expect("save");
        let loaded = Vocab::load(&mut bytes.as_slice()).expect("load");
        assert_eq!(loaded.id("cat"), cat);
        assert_eq!(loaded.len(), vocab.len());
    }

    #[test]
    fn suffix_cache_memoizes_and_short_circuits_null() {
        let mut cache: SuffixCache<i64> = SuffixCache::new(-1, -2);
        assert!(cache.check_ngram(&[1, 2, 3]).is_none());
        cache.set_ngram(&[1, 2, 3], 42, None);
        assert_eq!(cache.check_ngram(&[1, 2, 3]), Some((42, None)));
        // sharing the [2, 3] suffix path costs one extra node
        let nodes = cache.node_count();
        cache.set_ngram(&[9, 2, 3], 7, None);
        assert_eq!(cache.node_count(), nodes + 1);
        // path nodes come back deepest first and accept climbed-in values
        let mut path = Vec::new();
        assert_eq!(cache.path_nodes(&[8, 2, 3], &mut path), 3);
        cache.set_value(path[0], 11);
        assert_eq!(cache.value(path[0]), 11);
        assert_eq!(cache.check_ngram(&[8, 2, 3]), Some((11, None)));
        // a null node stops deeper walks
        cache.set_ngram(&[3], -2, None);
        assert_eq!(cache.path_nodes(&[5, 4, 3], &mut path), 0);
        cache.clear();
        assert_eq!(cache.node_count(), 1);
        assert!(cache.check_ngram(&[1, 2, 3]).is_none());
    }

    #[test]
    fn model_uses_true_bigram_ratio() {
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        lm.insert(&["cat"], 5);
        lm.insert(&["the", "cat"], 3);
        let ids = lm.lookup_ids(&["the", "cat"]);
        let (logprob, _) = lm.prob(&ids);
        let expect = (3f64 / 1000f64).log10();
        assert!(
            (logprob - expect).abs() < 1e-9,
            "got {logprob}, want {expect}"
        );
    }

    #[test]
    fn model_backs_off_to_penalized_unigram() {
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        lm.insert(&["cat"], 5);
        lm.insert(&["the", "cat"], 3);
        let ids = lm.lookup_ids(&["cat", "the"]);
        let (logprob, _) = lm.prob(&ids);
        let corpus = lm.corpus_size() as f64;
        let expect = 0.4f64.log10() + (1000f64 / corpus).log10();
        assert!(
            (logprob - expect).abs() < 1e-9,
            "got {logprob}, want {expect}"
        );
    }

    #[test]
    fn model_scores_out_of_vocabulary_uniformly() {
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        let (logprob, state) = lm.prob(&[OOV_ID]);
        let known = (lm.vocab().len() - 1) as f64;
        let expect = 0.4f64.log10() + (1.0 / known).log10();
        assert!((logprob - expect).abs() < 1e-9);
        let (again, state2) = lm.prob(&[OOV_ID]);
        assert_eq!(logprob, again);
        assert_eq!(state, state2);
    }

    #[test]
    fn prob_is_memoized_with_stable_state() {
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        lm.insert(&["cat"], 5);
        lm.insert(&["the", "cat"], 3);
        let bigram = lm.lookup_ids(&["the", "cat"]);
        let unigram = lm.lookup_ids(&["cat"]);
        let (p1, s1) = lm.prob(&bigram);
        let (p2, s2) = lm.prob(&bigram);
        assert_eq!(p1, p2);
        assert_eq!(s1, s2, "continuation state must be identity-stable");
        let (_, s3) = lm.prob(&unigram);
        assert_ne!(s1, s3, "different contexts must not share a state");
        lm.clear_cache();
        let (p3, _) = lm.prob(&bigram);
        assert!((p1 - p3).abs() < 1e-12);
    }

    #[test]
    fn update_accumulates_counts() {
        let mut lm = tiny_model();
        lm.insert(&["dog"], 10);
        assert!(lm.update(&["dog"], 1));
        let ids = lm.lookup_ids(&["dog"]);
        assert_eq!(lm.query(&ids), Some(11));
    }

    #[test]
    fn update_without_context_changes_nothing() {
        let mut lm = tiny_model();
        // "zz qq" has no stored "zz" context, so the update is refused
        assert!(!lm.update(&["zz", "qq"], 5));
        let ids = lm.lookup_ids(&["zz", "qq"]);
        assert_eq!(lm.query(&ids), None);
    }

    #[test]
    fn suffix_counts_reports_longest_found() {
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        lm.insert(&["cat"], 5);
        lm.insert(&["the", "cat"], 3);
        let ids = lm.lookup_ids(&["the", "cat"]);
        let mut counts = [0u64; 2];
        assert_eq!(lm.suffix_counts(&ids, &mut counts, false), 2);
        assert_eq!(counts, [3, 5]);
        let unseen = lm.lookup_ids(&["cat", "the"]);
        let mut counts = [0u64; 2];
        assert_eq!(lm.suffix_counts(&unseen, &mut counts, true), 1);
        assert_eq!(counts[1], 1000);
    }

    #[test]
    fn heur_delete_never_touches_marked_rows() {
        let mut lm = tiny_model();
        let mut words = Vec::new();
        for i in 0..300 {
            let word = format!("w{i}");
            lm.insert(&[word.as_str()], 5);
            words.push(word);
        }
        // protect five entries by querying them
        for word in &words[..5] {
            let ids = lm.lookup_ids(&[word.as_str()]);
            assert_eq!(lm.query(&ids), Some(5));
        }
        let occupied = lm.table_stats().rows_occupied;
        let deleted = lm.heur_delete(u64::MAX, 5);
        assert_eq!(deleted, occupied - 5);
        assert_eq!(lm.table_stats().rows_occupied, 5);
        for word in &words[..5] {
            let ids = lm.lookup_ids(&[word.as_str()]);
            assert_eq!(lm.query(&ids), Some(5), "{word} was evicted while marked");
        }
    }

    #[test]
    fn prefix_marks_protect_backoff_denominators() {
        let mut lm = tiny_model();
        lm.insert(&["x"], 10);
        lm.insert(&["x", "y"], 5);
        assert_eq!(lm.prefix_count(), 1, "context of the bigram is protected");
        lm.clear_markings();
        let deleted = lm.heur_delete(u64::MAX, 5);
        assert!(deleted >= 1);
        let ctx = lm.lookup_ids(&["x"]);
        assert_eq!(lm.query(&ctx), Some(10), "denominator must survive sweeps");
    }

    #[test]
    fn remove_non_marked_prunes_unhit_overflow() {
        let mut lm = tiny_model();
        lm.insert(&["a", "b", "c"], 4);
        lm.insert(&["a", "b", "c"], 6); // duplicate lands in the dictionary
        lm.insert(&["k"], 3);
        lm.insert(&["k"], 8); // duplicate, order below the pruning cutoff
        assert_eq!(lm.table().overflow_len(), 2);
        lm.clear_markings();
        lm.remove_non_marked();
        assert_eq!(
            lm.table().overflow_len(),
            1,
            "only the higher-order unhit entry is pruned"
        );
        assert_eq!(lm.table_stats().rows_occupied, 0);
    }

    #[test]
    fn clear_markings_resets_hits_but_keeps_prefixes() {
        let mut lm = tiny_model();
        lm.insert(&["x"], 10);
        lm.insert(&["x", "y"], 5);
        let ids = lm.lookup_ids(&["x", "y"]);
        assert_eq!(lm.query(&ids), Some(5));
        assert!(lm.hit_count() > 0);
        let prefixes = lm.prefix_count();
        lm.clear_markings();
        assert_eq!(lm.hit_count(), 0);
        assert_eq!(lm.prefix_count(), prefixes);
    }

    #[test]
    fn save_load_preserves_every_answer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.bin");
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        lm.insert(&["cat"], 5);
        lm.insert(&["the", "cat"], 3);
        lm.insert(&["the", "cat"], 4); // exact duplicate in the dictionary
        let bigram = lm.lookup_ids(&["the", "cat"]);
        let (p_before, _) = lm.prob(&bigram);
        lm.save_to_path(&path).expect("save");
        let mut loaded = NgramModel::load_from_path(&path).expect("load");
        assert_eq!(loaded.corpus_size(), lm.corpus_size());
        assert_eq!(loaded.order(), lm.order());
        assert_eq!(loaded.lookup_ids(&["the", "cat"]), bigram);
        assert_eq!(loaded.query(&bigram), lm.query(&bigram));
        let (p_after, _) = loaded.prob(&bigram);
        assert!((p_before - p_after).abs() < 1e-12);
        // a second snapshot of the reloaded model is byte-identical
        let mut first = Vec::new();
        lm.save(&mut first).expect("save");
        let mut second = Vec::new();
        loaded.save(&mut second).expect("save");
        assert_eq!(first, second);
    }

    #[test]
    fn load_rejects_truncated_input() {
        let mut lm = tiny_model();
        lm.insert(&["the"], 1000);
        let mut bytes = Vec::new();
        lm.save(&mut bytes).expect("save");
        bytes.truncate(bytes.len() / 2);
        assert!(NgramModel::load(&mut bytes.as_slice()).is_err());
    }
}

#[cfg(test)]
mod proptests;
