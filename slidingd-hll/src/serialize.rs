//! Versioned binary encoding of dense sliding HLLs.
//!
//! Host byte order, fixed-width fields. Layout (version 2):
//!
//! ```text
//! u32 version | u32 precision | u32 window_period | u32 window_precision
//! per register: u64 sample_count, then sample_count x (u64 timestamp, u64 value)
//! ```
//!
//! Every primitive write is bounds-checked; a short buffer fails cleanly
//! without touching bytes past the last complete primitive.

use crate::dense::{Register, Sample, SlidingHll};
use crate::{Error, Result, MAX_PRECISION, MIN_PRECISION};

pub const SERIAL_VERSION: u32 = 2;

/// Extra room the encode path allocates beyond `serialized_size`, absorbing
/// growth races between sizing and encoding.
pub const SERIALIZE_SLACK: usize = 256;

const HEADER_SIZE: usize = 4 * std::mem::size_of::<u32>();

/// Serialized footprint of an empty structure at the given precision, used
/// as a storage baseline when nothing is resident.
pub fn bytes_for_precision(precision: u8) -> Result<usize> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(Error::PrecisionOutOfRange);
    }
    Ok(HEADER_SIZE + (1usize << precision) * 8)
}

/// Exact minimum byte count for the current contents.
pub fn serialized_size(h: &SlidingHll) -> usize {
    let mut size = HEADER_SIZE;
    for r in h.registers() {
        size += 8 + r.len() * 16;
    }
    size
}

pub fn serialize(h: &SlidingHll) -> Result<Vec<u8>> {
    let mut buf = vec![0; serialized_size(h) + SERIALIZE_SLACK];
    let written = serialize_into(h, &mut buf)?;
    buf.truncate(written);
    Ok(buf)
}

/// Encodes into a caller-provided buffer, returning the bytes written.
pub fn serialize_into(h: &SlidingHll, buf: &mut [u8]) -> Result<usize> {
    let mut w = Writer::new(buf);
    w.put_u32(SERIAL_VERSION)?;
    w.put_u32(h.precision() as u32)?;
    w.put_u32(h.window_period())?;
    w.put_u32(h.window_precision())?;
    for r in h.registers() {
        w.put_u64(r.len() as u64)?;
        for s in r.samples() {
            w.put_u64(s.timestamp as u64)?;
            w.put_u64(s.value)?;
        }
    }
    Ok(w.offset)
}

pub fn unserialize(bytes: &[u8]) -> Result<SlidingHll> {
    let mut r = Reader::new(bytes);
    let version = r.get_u32()?;
    if version != SERIAL_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let precision = r.get_u32()?;
    // reject out-of-range precisions before sizing the register vector
    if precision < MIN_PRECISION as u32 || precision > MAX_PRECISION as u32 {
        return Err(Error::PrecisionOutOfRange);
    }
    let precision = precision as u8;
    let window_period = r.get_u32()?;
    let window_precision = r.get_u32()?;
    let num_registers = 1usize << precision;

    let mut registers = Vec::with_capacity(num_registers);
    for _ in 0..num_registers {
        let count = r.get_u64()?;
        if count > (r.remaining() / 16) as u64 {
            return Err(Error::Truncated);
        }
        let mut samples = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let timestamp = r.get_u64()? as i64;
            let value = r.get_u64()?;
            samples.push(Sample { timestamp, value });
        }
        registers.push(Register::from_samples(samples));
    }
    SlidingHll::from_parts(precision, window_period, window_precision, registers)
}

struct Writer<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.offset + bytes.len();
        if end > self.buf.len() {
            return Err(Error::BufferOverflow);
        }
        self.buf[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.get::<4>()?))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.get::<8>()?))
    }

    fn get<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.offset + N;
        let bytes = self
            .buf
            .get(self.offset..end)
            .ok_or(Error::Truncated)?
            .try_into()
            .map_err(|_| Error::Truncated)?;
        self.offset = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::{
        rand_core::{RngCore, SeedableRng},
        Xoshiro256PlusPlus,
    };

    fn sample_hll() -> SlidingHll {
        let mut h = SlidingHll::new(6, 3600, 10).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        for t in 0..200 {
            h.add_hash_at(rng.next_u64(), t);
        }
        h
    }

    fn register_values(h: &SlidingHll) -> Vec<Vec<Sample>> {
        h.registers().iter().map(|r| {
            let mut s = r.samples().to_vec();
            s.sort_by_key(|s| (s.timestamp, s.value));
            s
        }).collect()
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let h = sample_hll();
        let bytes = serialize(&h).unwrap();
        assert_eq!(bytes.len(), serialized_size(&h));
        let back = unserialize(&bytes).unwrap();
        assert_eq!(back.precision(), h.precision());
        assert_eq!(back.window_period(), h.window_period());
        assert_eq!(back.window_precision(), h.window_precision());
        assert_eq!(register_values(&back), register_values(&h));
        assert_eq!(back.size_total(), h.size_total());
    }

    #[test]
    fn empty_roundtrip() {
        let h = SlidingHll::new(4, 60, 1).unwrap();
        assert_eq!(serialized_size(&h), 16 + 16 * 8);
        let back = unserialize(&serialize(&h).unwrap()).unwrap();
        assert_eq!(back.size_total(), 0.0);
    }

    #[test]
    fn short_buffer_fails_cleanly() {
        let h = sample_hll();
        let size = serialized_size(&h);
        let mut buf = vec![0xAA; size - 2];
        assert_eq!(serialize_into(&h, &mut buf).unwrap_err(), Error::BufferOverflow);
        // bytes past the last complete primitive are untouched
        assert_eq!(buf[buf.len() - 1], 0xAA);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let h = sample_hll();
        let mut bytes = serialize(&h).unwrap();
        bytes[..4].copy_from_slice(&1u32.to_ne_bytes());
        assert_eq!(unserialize(&bytes).unwrap_err(), Error::UnsupportedVersion(1));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let h = sample_hll();
        let bytes = serialize(&h).unwrap();
        assert_eq!(unserialize(&bytes[..bytes.len() - 3]).unwrap_err(), Error::Truncated);
        assert_eq!(unserialize(&bytes[..10]).unwrap_err(), Error::Truncated);
        assert_eq!(unserialize(&[]).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn bogus_precision_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SERIAL_VERSION.to_ne_bytes());
        bytes.extend_from_slice(&25u32.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        assert_eq!(unserialize(&bytes).unwrap_err(), Error::PrecisionOutOfRange);
    }

    #[test]
    fn absurd_sample_count_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SERIAL_VERSION.to_ne_bytes());
        bytes.extend_from_slice(&4u32.to_ne_bytes());
        bytes.extend_from_slice(&60u32.to_ne_bytes());
        bytes.extend_from_slice(&1u32.to_ne_bytes());
        bytes.extend_from_slice(&u64::MAX.to_ne_bytes());
        assert_eq!(unserialize(&bytes).unwrap_err(), Error::Truncated);
    }
}
