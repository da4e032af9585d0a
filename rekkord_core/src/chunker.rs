//! Content-defined chunking: a FastCDC-class variable-size splitter keyed
//! by a repository-specific 64-bit seed.
//!
//! This is the normalized two-mask FastCDC construction, with one
//! deliberate deviation from the textbook version: a published gear table
//! would let anyone compare chunk boundaries across unrelated repositories
//! that happen to share bytes, so the table here is reseeded per
//! repository from the splitter seed rather than reused as a fixed public
//! constant. The `process(window, eof, emit)` push interface (rather than
//! a `Read`-based iterator) lets the caller feed bounded windows instead
//! of handing the splitter a whole stream at once.

const NORMALIZATION_LEVEL: u32 = 1;

/// A 256-entry gear table, deterministically derived from a 64-bit seed via
/// splitmix64. Two chunkers built from the same seed always agree on
/// boundaries for the same byte stream.
fn gear_table(seed: u64) -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = seed;
    for slot in table.iter_mut() {
        state = state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        *slot = z;
    }
    table
}

fn logarithm2(value: u32) -> u32 {
    (value as f64).log2().round() as u32
}

/// A deterministic, pure function of `(bytes, seed)`. Feed it bounded
/// windows via [`Chunker::process`]; it calls `emit` for every boundary it
/// finds and internally buffers whatever it hasn't emitted yet.
pub struct Chunker {
    gear: [u64; 256],
    min_size: usize,
    avg_size: usize,
    max_size: usize,
    mask_small: u64,
    mask_large: u64,
    buffer: Vec<u8>,
    absolute_offset: u64,
    next_index: u64,
}

impl Chunker {
    pub fn new(seed: u64, min_size: usize, avg_size: usize, max_size: usize) -> Self {
        let bits = logarithm2(avg_size as u32);
        let mask_small = mask(bits + NORMALIZATION_LEVEL);
        let mask_large = mask(bits.saturating_sub(NORMALIZATION_LEVEL));

        Self {
            gear: gear_table(seed),
            min_size,
            avg_size,
            max_size,
            mask_small,
            mask_large,
            buffer: Vec::with_capacity(max_size),
            absolute_offset: 0,
            next_index: 0,
        }
    }

    /// Feeds `window` into the splitter. Always consumes the entire window
    /// (buffering any bytes not yet enough to cut a chunk), so the return
    /// value is always `window.len()`. On `eof`, flushes any remainder as a
    /// final chunk, however small.
    pub fn process(
        &mut self,
        window: &[u8],
        eof: bool,
        mut emit: impl FnMut(u64, u64, &[u8]),
    ) -> usize {
        self.buffer.extend_from_slice(window);

        while self.buffer.len() >= self.max_size {
            let cut = self.find_cut(&self.buffer[..self.max_size.min(self.buffer.len())]);
            self.emit_chunk(cut, &mut emit);
        }

        if eof {
            while !self.buffer.is_empty() {
                let cut = self.find_cut(&self.buffer);
                self.emit_chunk(cut, &mut emit);
            }
        }

        window.len()
    }

    fn emit_chunk(&mut self, cut: usize, emit: &mut impl FnMut(u64, u64, &[u8])) {
        let chunk: Vec<u8> = self.buffer.drain(..cut).collect();
        emit(self.next_index, self.absolute_offset, &chunk);
        self.next_index += 1;
        self.absolute_offset += chunk.len() as u64;
    }

    /// Classic normalized FastCDC boundary search over `source` (at most
    /// `max_size` bytes): strict mask before the average-size point,
    /// relaxed mask after, so small and large chunks are both possible but
    /// the distribution concentrates near `avg_size`.
    fn find_cut(&self, source: &[u8]) -> usize {
        let len = source.len();
        if len <= self.min_size {
            return len;
        }

        let center = self.avg_size.min(len);
        let mut hash: u64 = 0;
        let mut i = self.min_size;

        while i < center {
            hash = (hash << 1).wrapping_add(self.gear[source[i] as usize]);
            if hash & self.mask_small == 0 {
                return i + 1;
            }
            i += 1;
        }
        while i < len {
            hash = (hash << 1).wrapping_add(self.gear[source[i] as usize]);
            if hash & self.mask_large == 0 {
                return i + 1;
            }
            i += 1;
        }

        len
    }
}

fn mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        (1u64 << bits.min(63)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: usize = 256 * 1024;
    const AVG: usize = 512 * 1024;
    const MAX: usize = 2 * 1024 * 1024;

    fn chunk_all(bytes: &[u8], seed: u64, window: usize) -> Vec<Vec<u8>> {
        let mut chunker = Chunker::new(seed, MIN, AVG, MAX);
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + window).min(bytes.len());
            let consumed = chunker.process(&bytes[offset..end], false, |_, _, data| {
                chunks.push(data.to_vec());
            });
            offset += consumed;
        }
        chunker.process(&[], true, |_, _, data| chunks.push(data.to_vec()));
        chunks
    }

    fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut state = seed;
        while out.len() < len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[test]
    fn deterministic_across_window_sizes() {
        let data = pseudo_random_bytes(8 * 1024 * 1024, 42);
        let a = chunk_all(&data, 1234, 4096);
        let b = chunk_all(&data, 1234, 64 * 1024);
        let c = chunk_all(&data, 1234, data.len());
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn chunks_reconstruct_input() {
        let data = pseudo_random_bytes(5 * 1024 * 1024, 7);
        let chunks = chunk_all(&data, 99, 100_000);
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, data);
    }

    #[test]
    fn bounds_are_respected() {
        let data = pseudo_random_bytes(10 * 1024 * 1024, 3);
        let chunks = chunk_all(&data, 55, 1 << 16);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.len() <= MAX);
            if i + 1 < chunks.len() {
                assert!(chunk.len() >= MIN);
            }
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let data = pseudo_random_bytes(4 * 1024 * 1024, 11);
        let a = chunk_all(&data, 1, data.len());
        let b = chunk_all(&data, 2, data.len());
        assert_ne!(a, b);
    }

    #[test]
    fn small_input_is_one_chunk() {
        let data = pseudo_random_bytes(10, 1);
        let chunks = chunk_all(&data, 1, data.len());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], data);
    }
}
