//! Positional readers and writers for replication wire messages

use crate::errors::{CdcError, CdcResult};

/// A buffer reader that manages position and provides meaningful parsing methods
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a new buffer reader from a byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Read a single byte at current position
    pub fn read_u8(&mut self) -> CdcResult<u8> {
        if !self.has_bytes(1) {
            return Err(CdcError::decode("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Read a single byte as an ASCII tag character
    pub fn read_char(&mut self) -> CdcResult<char> {
        Ok(self.read_u8()? as char)
    }

    pub fn read_i8(&mut self) -> CdcResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a big-endian 16-bit integer at current position
    pub fn read_i16(&mut self) -> CdcResult<i16> {
        if !self.has_bytes(2) {
            return Err(CdcError::decode("not enough bytes for i16"));
        }
        let bytes: [u8; 2] = self.buffer[self.position..self.position + 2]
            .try_into()
            .expect("length checked");
        self.position += 2;
        Ok(i16::from_be_bytes(bytes))
    }

    /// Read a big-endian 32-bit unsigned integer at current position
    pub fn read_u32(&mut self) -> CdcResult<u32> {
        if !self.has_bytes(4) {
            return Err(CdcError::decode("not enough bytes for u32"));
        }
        let bytes: [u8; 4] = self.buffer[self.position..self.position + 4]
            .try_into()
            .expect("length checked");
        self.position += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read a big-endian 32-bit signed integer at current position
    pub fn read_i32(&mut self) -> CdcResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a big-endian 64-bit unsigned integer at current position
    pub fn read_u64(&mut self) -> CdcResult<u64> {
        if !self.has_bytes(8) {
            return Err(CdcError::decode("not enough bytes for u64"));
        }
        let bytes: [u8; 8] = self.buffer[self.position..self.position + 8]
            .try_into()
            .expect("length checked");
        self.position += 8;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Read a big-endian 64-bit signed integer at current position
    pub fn read_i64(&mut self) -> CdcResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read exactly `count` raw bytes
    pub fn read_bytes(&mut self, count: usize) -> CdcResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(CdcError::decode("not enough bytes for raw read"));
        }
        let out = self.buffer[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(out)
    }

    /// Read a null-terminated string
    pub fn read_cstr(&mut self) -> CdcResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(CdcError::decode("unterminated string"));
        }
        let value = String::from_utf8_lossy(&self.buffer[start..self.position]).into_owned();
        self.position += 1; // null terminator
        Ok(value)
    }
}

/// A buffer writer that manages position for fixed-size reply messages
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }

    pub fn write_u8(&mut self, value: u8) -> CdcResult<()> {
        if self.position + 1 > self.buffer.len() {
            return Err(CdcError::decode("write buffer full"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> CdcResult<()> {
        if self.position + 8 > self.buffer.len() {
            return Err(CdcError::decode("write buffer full"));
        }
        self.buffer[self.position..self.position + 8].copy_from_slice(&value.to_be_bytes());
        self.position += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> CdcResult<()> {
        self.write_u64(value as u64)
    }
}
