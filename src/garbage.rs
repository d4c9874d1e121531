//! Routines for generating an infinite amount of deterministic garbage.
//!
//! Block contents are AES-128-CTR keystream. That is as incompressible as
//! anything a filesystem will ever see, so neither compression nor sparse
//! files nor deduplication can make a block cost less than its size.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::io;

type Keystream = ctr::Ctr64BE<Aes128>;

/// Buffers larger than this are filled in parallel, one chunk per task.
const PARALLEL_CHUNK: usize = 4 * 1024 * 1024;

/// Largest piece of a block held in memory at once while streaming it out.
pub const STREAM_CHUNK: usize = 4 * PARALLEL_CHUNK;

/// A generator for deterministically random-looking garbage data.
#[derive(Clone)]
pub struct GarbageGenerator {
    key: [u8; 16],
    seed: u64,
}

impl GarbageGenerator {
    /// Generate a new garbage generator from a seed.
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut key = [0; 16];
        rng.fill_bytes(&mut key);
        Self { key, seed }
    }

    /// A generator seeded from the thread-local RNG.
    pub fn random() -> Self {
        Self::new(thread_rng().gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Overwrites `buf` with the contents of block number `index`.
    ///
    /// The block index occupies the upper half of the counter block, so
    /// blocks never share keystream as long as a block is shorter than
    /// 2^68 bytes.
    pub fn fill_block(&self, index: u64, buf: &mut [u8]) {
        self.fill_at(index, 0, buf);
    }

    /// Overwrites `buf` with the bytes of block `index` starting at `offset`.
    pub fn fill_at(&self, index: u64, offset: u64, buf: &mut [u8]) {
        buf.par_chunks_mut(PARALLEL_CHUNK)
            .enumerate()
            .for_each(|(chunk_index, chunk)| {
                let mut cipher = self.keystream(index);
                cipher.seek(offset + (chunk_index * PARALLEL_CHUNK) as u64);
                chunk.fill(0);
                cipher.apply_keystream(chunk);
            });
    }

    /// Writes `len` bytes of block `index` to `out`, one `buf`-sized piece
    /// at a time, so the block never has to fit in memory.
    pub fn write_block(
        &self,
        index: u64,
        len: u64,
        buf: &mut [u8],
        out: &mut impl io::Write,
    ) -> io::Result<()> {
        if buf.is_empty() && len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot stream a block through an empty buffer",
            ));
        }
        let mut offset = 0;
        while offset < len {
            let piece = (len - offset).min(buf.len() as u64) as usize;
            let chunk = &mut buf[..piece];
            self.fill_at(index, offset, chunk);
            out.write_all(chunk)?;
            offset += piece as u64;
        }
        Ok(())
    }

    fn keystream(&self, index: u64) -> Keystream {
        let mut iv = [0; 16];
        iv[..8].copy_from_slice(&index.to_be_bytes());
        Keystream::new(&self.key.into(), &iv.into())
    }
}
