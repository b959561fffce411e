//! Pattern-initialization bytecode.
//!
//! `PatternInitializedData` sections are stored as a stream of small instructions that
//! expand into the section's initialized bytes. Each instruction byte carries a 3-bit opcode
//! in its high bits and a 5-bit count in its low bits; a count of zero means the real count
//! follows as a varint. Varints are big-endian groups of 7 bits with the top bit marking
//! continuation.
//!
//! | Opcode | Name             | Effect                                                      |
//! |--------|------------------|-------------------------------------------------------------|
//! | 0      | `Zero`           | emit `count` zero bytes                                     |
//! | 1      | `BlockCopy`      | copy the next `count` bytes                                 |
//! | 2      | `RepeatBlock`    | emit the next `count` bytes `repeat + 1` times              |
//! | 3      | `InterleaveCopy` | common block of `count` bytes interleaved with custom data  |
//! | 4      | `InterleaveZero` | `count` zero bytes interleaved with custom data             |
//!
//! Expansion consumes exactly the packed input and fills exactly the requested output; any
//! other outcome is an error.
//!
//! # Examples
//!
//! ```rust
//! use pefrun::container::pattern::{expand, PatternEncoder};
//!
//! let mut encoder = PatternEncoder::new();
//! encoder.repeat_block(&[0xAA, 0xBB, 0xCC], 2).zero(3);
//! let packed = encoder.finish();
//!
//! let data = expand(&packed, 12)?;
//! assert_eq!(&data[..9], &[0xAA, 0xBB, 0xCC, 0xAA, 0xBB, 0xCC, 0xAA, 0xBB, 0xCC]);
//! assert_eq!(&data[9..], &[0, 0, 0]);
//! # Ok::<(), pefrun::Error>(())
//! ```

use log::debug;
use strum::{EnumCount, EnumIter};

use crate::{
    file::parser::{Parser, MAX_VARINT_LEN},
    Error, Result,
};

/// The five pattern-initialization instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount)]
pub enum PatternOpcode {
    /// Emit zero bytes
    Zero = 0,
    /// Copy bytes from the input
    BlockCopy = 1,
    /// Repeat a block from the input
    RepeatBlock = 2,
    /// Interleave a common block from the input with custom blocks
    InterleaveCopy = 3,
    /// Interleave zero bytes with custom blocks
    InterleaveZero = 4,
}

impl PatternOpcode {
    /// Decode the 3-bit opcode field.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<PatternOpcode> {
        match bits {
            0 => Some(PatternOpcode::Zero),
            1 => Some(PatternOpcode::BlockCopy),
            2 => Some(PatternOpcode::RepeatBlock),
            3 => Some(PatternOpcode::InterleaveCopy),
            4 => Some(PatternOpcode::InterleaveZero),
            _ => None,
        }
    }
}

/// Decode one pattern varint from the start of `data`.
///
/// Returns the value and the number of bytes it occupied.
///
/// # Errors
/// Returns [`crate::Error::MalformedPattern`] if the varint is truncated, longer than five
/// bytes or does not fit a `u32`.
pub fn decode_varint(data: &[u8]) -> Result<(u32, usize)> {
    let mut parser = Parser::new(data);
    let value = read_count(&mut parser)?;
    Ok((value, parser.pos()))
}

/// Encode `value` as a pattern varint.
#[must_use]
pub fn encode_varint(value: u32) -> Vec<u8> {
    let mut groups = [0u8; MAX_VARINT_LEN];
    let mut remaining = value;
    let mut count = 0;

    loop {
        groups[count] = (remaining & 0x7F) as u8;
        count += 1;
        remaining >>= 7;
        if remaining == 0 {
            break;
        }
    }

    let mut encoded = Vec::with_capacity(count);
    for (index, group) in groups[..count].iter().rev().enumerate() {
        if index + 1 < count {
            encoded.push(group | 0x80);
        } else {
            encoded.push(*group);
        }
    }
    encoded
}

/// Expand a packed pattern stream into a new buffer of exactly `unpacked_size` bytes.
///
/// # Errors
/// Returns [`crate::Error::InvalidOpcode`] for opcodes 5-7 and
/// [`crate::Error::MalformedPattern`] for any read or write overrun, leftover input or
/// unfilled output.
pub fn expand(input: &[u8], unpacked_size: usize) -> Result<Vec<u8>> {
    let mut output = vec![0u8; unpacked_size];
    expand_into(input, &mut output)?;
    Ok(output)
}

/// Expand a packed pattern stream into `output`, which must be filled exactly.
///
/// # Errors
/// Same as [`expand`].
pub fn expand_into(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut expander = Expander {
        input: Parser::new(input),
        output,
        written: 0,
    };

    while expander.input.has_more_data() {
        expander.step()?;
    }

    if expander.written != expander.output.len() {
        return Err(pattern_error!(
            "stream produced {} bytes, {} expected",
            expander.written,
            expander.output.len()
        ));
    }

    debug!(
        "Expanded {} packed bytes into {} bytes",
        input.len(),
        expander.written
    );
    Ok(())
}

fn read_count(parser: &mut Parser) -> Result<u32> {
    let offset = parser.pos();
    parser.read_varint().map_err(|error| match error {
        Error::OutOfBounds => pattern_error!("varint at packed offset {} is truncated", offset),
        _ => pattern_error!("invalid varint at packed offset {}: {}", offset, error),
    })
}

fn to_usize(value: u32) -> Result<usize> {
    usize::try_from(value).map_err(|_| pattern_error!("count {} does not fit in memory", value))
}

struct Expander<'a, 'b> {
    input: Parser<'a>,
    output: &'b mut [u8],
    written: usize,
}

impl<'a> Expander<'a, '_> {
    fn step(&mut self) -> Result<()> {
        let offset = self.input.pos();
        let instruction = self.input.read_be::<u8>()?;

        let Some(opcode) = PatternOpcode::from_bits(instruction >> 5) else {
            return Err(Error::InvalidOpcode {
                opcode: instruction >> 5,
                offset,
            });
        };

        let count = match instruction & 0x1F {
            0 => to_usize(read_count(&mut self.input)?)?,
            inline => usize::from(inline),
        };

        match opcode {
            PatternOpcode::Zero => {
                let target = self.reserve(count, offset)?;
                target.fill(0);
            }
            PatternOpcode::BlockCopy => {
                let block = self.take_input(count, offset)?;
                self.reserve(count, offset)?.copy_from_slice(block);
            }
            PatternOpcode::RepeatBlock => {
                let repeat = to_usize(read_count(&mut self.input)?)?;
                let block = self.take_input(count, offset)?;
                let total = repeat
                    .checked_add(1)
                    .and_then(|times| times.checked_mul(count))
                    .ok_or_else(|| pattern_error!("repeat at packed offset {} overflows", offset))?;

                let target = self.reserve(total, offset)?;
                if count > 0 {
                    for chunk in target.chunks_exact_mut(count) {
                        chunk.copy_from_slice(block);
                    }
                }
            }
            PatternOpcode::InterleaveCopy | PatternOpcode::InterleaveZero => {
                let custom_size = to_usize(read_count(&mut self.input)?)?;
                let repeat = to_usize(read_count(&mut self.input)?)?;

                let common = if opcode == PatternOpcode::InterleaveCopy {
                    Some(self.take_input(count, offset)?)
                } else {
                    None
                };

                let custom_total = custom_size
                    .checked_mul(repeat)
                    .ok_or_else(|| pattern_error!("interleave at packed offset {} overflows", offset))?;
                let custom = self.take_input(custom_total, offset)?;

                let total = repeat
                    .checked_add(1)
                    .and_then(|times| times.checked_mul(count))
                    .and_then(|common_total| common_total.checked_add(custom_total))
                    .ok_or_else(|| pattern_error!("interleave at packed offset {} overflows", offset))?;
                let target = self.reserve(total, offset)?;

                if total > 0 {
                    let mut position = 0;
                    for index in 0..=repeat {
                        let slot = &mut target[position..position + count];
                        match common {
                            Some(block) => slot.copy_from_slice(block),
                            None => slot.fill(0),
                        }
                        position += count;

                        if index < repeat {
                            let source = &custom[index * custom_size..(index + 1) * custom_size];
                            target[position..position + custom_size].copy_from_slice(source);
                            position += custom_size;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn take_input(&mut self, length: usize, offset: usize) -> Result<&'a [u8]> {
        self.input.read_bytes(length).map_err(|_| {
            pattern_error!(
                "instruction at packed offset {} reads {} bytes past the end of the input",
                offset,
                length
            )
        })
    }

    fn reserve(&mut self, length: usize, offset: usize) -> Result<&mut [u8]> {
        let end = self
            .written
            .checked_add(length)
            .filter(|end| *end <= self.output.len())
            .ok_or_else(|| {
                pattern_error!(
                    "instruction at packed offset {} writes {} bytes, only {} left",
                    offset,
                    length,
                    self.output.len() - self.written
                )
            })?;

        let start = self.written;
        self.written = end;
        Ok(&mut self.output[start..end])
    }
}

/// Builds pattern-initialization streams.
///
/// Used by tooling and tests to produce packed section data; the counterpart of [`expand`].
#[derive(Debug, Default, Clone)]
pub struct PatternEncoder {
    bytes: Vec<u8>,
}

impl PatternEncoder {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn instruction(&mut self, opcode: PatternOpcode, count: usize) {
        let opcode = (opcode as u8) << 5;
        match u8::try_from(count) {
            Ok(inline @ 1..=0x1F) => self.bytes.push(opcode | inline),
            _ => {
                self.bytes.push(opcode);
                self.count(count);
            }
        }
    }

    fn count(&mut self, value: usize) {
        let value = u32::try_from(value).unwrap_or(u32::MAX);
        self.bytes.extend_from_slice(&encode_varint(value));
    }

    /// Emit `count` zero bytes.
    pub fn zero(&mut self, count: usize) -> &mut Self {
        self.instruction(PatternOpcode::Zero, count);
        self
    }

    /// Copy `block` verbatim.
    pub fn block_copy(&mut self, block: &[u8]) -> &mut Self {
        self.instruction(PatternOpcode::BlockCopy, block.len());
        self.bytes.extend_from_slice(block);
        self
    }

    /// Emit `block` `repeat_count + 1` times.
    pub fn repeat_block(&mut self, block: &[u8], repeat_count: u32) -> &mut Self {
        self.instruction(PatternOpcode::RepeatBlock, block.len());
        self.bytes.extend_from_slice(&encode_varint(repeat_count));
        self.bytes.extend_from_slice(block);
        self
    }

    /// Emit `common`, then each custom block followed by `common` again.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedPattern`] if the custom blocks differ in length.
    pub fn interleave_copy<B: AsRef<[u8]>>(
        &mut self,
        common: &[u8],
        customs: &[B],
    ) -> Result<&mut Self> {
        let custom_size = Self::custom_size(customs)?;
        self.instruction(PatternOpcode::InterleaveCopy, common.len());
        self.count(custom_size);
        self.count(customs.len());
        self.bytes.extend_from_slice(common);
        for custom in customs {
            self.bytes.extend_from_slice(custom.as_ref());
        }
        Ok(self)
    }

    /// Like [`PatternEncoder::interleave_copy`] with a common block of `zeros` zero bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedPattern`] if the custom blocks differ in length.
    pub fn interleave_zero<B: AsRef<[u8]>>(
        &mut self,
        zeros: usize,
        customs: &[B],
    ) -> Result<&mut Self> {
        let custom_size = Self::custom_size(customs)?;
        self.instruction(PatternOpcode::InterleaveZero, zeros);
        self.count(custom_size);
        self.count(customs.len());
        for custom in customs {
            self.bytes.extend_from_slice(custom.as_ref());
        }
        Ok(self)
    }

    fn custom_size<B: AsRef<[u8]>>(customs: &[B]) -> Result<usize> {
        let size = customs.first().map_or(0, |custom| custom.as_ref().len());
        if customs.iter().any(|custom| custom.as_ref().len() != size) {
            return Err(pattern_error!(
                "interleaved blocks must all be {} bytes long",
                size
            ));
        }
        Ok(size)
    }

    /// Number of bytes emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if no instruction has been emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consume the encoder and return the packed stream.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
