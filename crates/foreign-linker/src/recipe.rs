//! Compact call recipes and the universal invoker.
//!
//! A recipe describes a call as three instruction streams, one per storage
//! class: integer registers, vector registers and 8-byte stack slots. Each
//! instruction is two bits:
//!
//! - `PULL` moves the next word of the class's flat array into the next storage
//! - `SKIP` leaves the next storage untouched
//! - `STOP` ends the stream
//!
//! Instructions are packed 32 to a 64-bit word, lowest bits first. One
//! [`UniversalInvoker`] executes any recipe over flat `u64` arrays.

use std::fmt;
use std::sync::Arc;

use crate::abi::AbiDescriptor;
use crate::calling_sequence::{CallingSequence, Direction};
use crate::downcall;
use crate::frame::{NativeFrame, NativeSymbol};
use crate::shuffle::{ErasedSlot, erased_signature};
use crate::storage::{StorageClass, VMStorage};
use crate::upcall::{self, UpcallTarget};
use crate::value::Value;
use crate::{Error, Result};

pub const PULL: u64 = 1;
pub const SKIP: u64 = 2;
pub const STOP: u64 = 3;

const CODES_PER_WORD: usize = 32;
const STACK_SLOT: u32 = 8;

/// Packed 2-bit instructions for one storage class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeStream {
    words: Vec<u64>,
    len: usize,
}

impl RecipeStream {
    fn push(&mut self, code: u64) {
        let word = self.len / CODES_PER_WORD;
        if word == self.words.len() {
            self.words.push(0);
        }
        self.words[word] |= code << ((self.len % CODES_PER_WORD) * 2);
        self.len += 1;
    }

    /// Builds the stream for the sorted storage positions a class uses.
    fn from_positions(positions: &[usize]) -> Self {
        let mut stream = Self::default();
        let mut next = 0;
        for &position in positions {
            while next < position {
                stream.push(SKIP);
                next += 1;
            }
            stream.push(PULL);
            next += 1;
        }
        stream.push(STOP);
        stream
    }

    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Decoded instructions, `STOP` included.
    pub fn codes(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(|i| (self.words[i / CODES_PER_WORD] >> ((i % CODES_PER_WORD) * 2)) & 0b11)
    }
}

impl fmt::Display for RecipeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, code) in self.codes().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(match code {
                PULL => "PULL",
                SKIP => "SKIP",
                STOP => "STOP",
                _ => "?",
            })?;
        }
        Ok(())
    }
}

/// Storage class a recipe stream addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Integer,
    Vector,
    /// 8-byte stack slots from the start of the argument area.
    Stack,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Integer, Lane::Vector, Lane::Stack];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Moves words between flat arrays and a native frame according to a recipe.
pub struct UniversalInvoker<'d> {
    descriptor: &'d AbiDescriptor,
}

impl<'d> UniversalInvoker<'d> {
    #[must_use]
    pub fn new(descriptor: &'d AbiDescriptor) -> Self {
        Self { descriptor }
    }

    fn storage(&self, lane: Lane, position: usize) -> Result<VMStorage> {
        let registers = match lane {
            Lane::Integer => &self.descriptor.integer_args,
            Lane::Vector => &self.descriptor.vector_args,
            Lane::Stack => {
                let offset = u32::try_from(position)
                    .ok()
                    .and_then(|p| p.checked_mul(STACK_SLOT))
                    .ok_or_else(|| Error::Internal("stack slot out of range".into()))?;
                return Ok(VMStorage::stack(offset, STACK_SLOT));
            }
        };
        registers
            .get(position)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("recipe position {position} has no register")))
    }

    /// Writes `lane_words` into the storages `stream` pulls.
    pub fn scatter(
        &self,
        lane: Lane,
        stream: &RecipeStream,
        lane_words: &[u64],
        frame: &mut NativeFrame,
    ) -> Result<()> {
        let mut words = lane_words.iter();
        for (position, code) in stream.codes().enumerate() {
            match code {
                PULL => {
                    let word = words
                        .next()
                        .ok_or_else(|| Error::Internal("recipe pulls past its arguments".into()))?;
                    frame.store_bits(&self.storage(lane, position)?, *word)?;
                }
                STOP => break,
                _ => {}
            }
        }
        Ok(())
    }

    /// Reads the storages `stream` pulls into a flat array.
    pub fn gather(
        &self,
        lane: Lane,
        stream: &RecipeStream,
        frame: &NativeFrame,
    ) -> Result<Vec<u64>> {
        let mut words = Vec::new();
        for (position, code) in stream.codes().enumerate() {
            match code {
                PULL => words.push(frame.load_bits(&self.storage(lane, position)?)?),
                STOP => break,
                _ => {}
            }
        }
        Ok(words)
    }
}

/// A sequence reduced to three instruction streams.
pub struct CompactRecipe {
    sequence: Arc<CallingSequence>,
    streams: [RecipeStream; 3],
    /// Caller parameter indices in pull order, per lane.
    order: [Vec<usize>; 3],
    params: Vec<ErasedSlot>,
    ret: Option<ErasedSlot>,
}

impl CompactRecipe {
    pub fn new(sequence: Arc<CallingSequence>) -> Result<Self> {
        let (params, ret) = erased_signature(&sequence)?;
        let descriptor = sequence.abi().descriptor();
        let mut placed: [Vec<(usize, usize)>; 3] = Default::default();
        for (i, slot) in params.iter().enumerate() {
            let (lane, position) = lane_position(descriptor, &slot.storage)?;
            placed[lane.index()].push((position, i));
        }
        let mut streams: [RecipeStream; 3] = Default::default();
        let mut order: [Vec<usize>; 3] = Default::default();
        for lane in Lane::ALL {
            let entries = &mut placed[lane.index()];
            entries.sort_unstable();
            let positions: Vec<usize> = entries.iter().map(|&(p, _)| p).collect();
            streams[lane.index()] = RecipeStream::from_positions(&positions);
            order[lane.index()] = entries.iter().map(|&(_, i)| i).collect();
        }
        tracing::debug!(
            signature = %sequence.signature(),
            integer = %streams[0],
            vector = %streams[1],
            stack = %streams[2],
            "compact recipe"
        );
        Ok(Self {
            sequence,
            streams,
            order,
            params,
            ret,
        })
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.sequence.direction()
    }

    #[must_use]
    pub fn integer_stream(&self) -> &RecipeStream {
        &self.streams[Lane::Integer.index()]
    }

    #[must_use]
    pub fn vector_stream(&self) -> &RecipeStream {
        &self.streams[Lane::Vector.index()]
    }

    #[must_use]
    pub fn stack_stream(&self) -> &RecipeStream {
        &self.streams[Lane::Stack.index()]
    }

    fn invoker(&self) -> UniversalInvoker<'static> {
        UniversalInvoker::new(self.sequence.abi().descriptor())
    }

    pub(crate) fn invoke_downcall(
        &self,
        target: &NativeSymbol,
        args: &[Value],
    ) -> Result<Option<Value>> {
        downcall::check_arguments(&self.sequence, args)?;
        let invoker = self.invoker();
        let mut frame = NativeFrame::new();
        for lane in Lane::ALL {
            let words = self.order[lane.index()]
                .iter()
                .map(|&i| self.params[i].erase(&args[i]))
                .collect::<Result<Vec<_>>>()?;
            invoker.scatter(lane, &self.streams[lane.index()], &words, &mut frame)?;
        }
        downcall::call_native(target, &mut frame)?;
        match &self.ret {
            Some(slot) => Ok(Some(slot.restore(frame.load_bits(&slot.storage)?)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn invoke_upcall(&self, target: &UpcallTarget, frame: &mut NativeFrame) -> Result<()> {
        let invoker = self.invoker();
        let mut params = Vec::new();
        params.resize_with(self.params.len(), || Value::I64(0));
        for lane in Lane::ALL {
            let words = invoker.gather(lane, &self.streams[lane.index()], frame)?;
            for (bits, &i) in words.into_iter().zip(&self.order[lane.index()]) {
                params[i] = self.params[i].restore(bits)?;
            }
        }
        let result = target.call(&params)?;
        if let (Some(slot), Some(value)) = (&self.ret, upcall::prepare_return(&self.sequence, None, result)?) {
            frame.store_bits(&slot.storage, slot.erase(&value)?)?;
        }
        Ok(())
    }
}

/// Lane and position of a storage within the ABI's argument catalog.
fn lane_position(descriptor: &AbiDescriptor, storage: &VMStorage) -> Result<(Lane, usize)> {
    let unsupported = || Error::UnsupportedShape(format!("`{storage}` is not a recipe storage"));
    match storage.class() {
        StorageClass::Integer => descriptor
            .integer_args
            .iter()
            .position(|r| r == storage)
            .map(|p| (Lane::Integer, p))
            .ok_or_else(unsupported),
        StorageClass::Vector => descriptor
            .vector_args
            .iter()
            .position(|r| r == storage)
            .map(|p| (Lane::Vector, p))
            .ok_or_else(unsupported),
        StorageClass::Stack
            if storage.size() == STACK_SLOT && storage.offset() % STACK_SLOT == 0 =>
        {
            Ok((Lane::Stack, (storage.offset() / STACK_SLOT) as usize))
        }
        _ => Err(unsupported()),
    }
}

impl fmt::Display for CompactRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "integer: {}", self.integer_stream())?;
        writeln!(f, "vector:  {}", self.vector_stream())?;
        write!(f, "stack:   {}", self.stack_stream())
    }
}

impl fmt::Debug for CompactRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactRecipe")
            .field("integer", &self.integer_stream().to_string())
            .field("vector", &self.vector_stream().to_string())
            .field("stack", &self.stack_stream().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::classify::classify;
    use crate::layout::{FunctionType, TypeLayout};

    fn recipe(sig: &FunctionType, abi: Abi) -> Result<CompactRecipe> {
        CompactRecipe::new(Arc::new(classify(sig, abi, Direction::Downcall)?))
    }

    #[test]
    fn test_stream_packing() {
        let stream = RecipeStream::from_positions(&[0, 2]);
        assert_eq!(stream.to_string(), "PULL SKIP PULL STOP");
        assert_eq!(stream.words(), &[PULL | (SKIP << 2) | (PULL << 4) | (STOP << 6)]);

        let long = RecipeStream::from_positions(&(0..40).collect::<Vec<_>>());
        assert_eq!(long.words().len(), 2);
        assert_eq!(long.codes().filter(|&c| c == PULL).count(), 40);
    }

    #[test]
    fn test_windows_positions_skip() {
        // Positional assignment: the float in slot 1 leaves rdx unused.
        let sig = FunctionType::void([TypeLayout::I32, TypeLayout::F64, TypeLayout::I64]);
        let r = recipe(&sig, Abi::Win64).unwrap();
        assert_eq!(r.integer_stream().to_string(), "PULL SKIP PULL STOP");
        assert_eq!(r.vector_stream().to_string(), "SKIP PULL STOP");
        assert_eq!(r.stack_stream().to_string(), "STOP");
    }

    #[test]
    fn test_stack_slots_are_pulled() {
        let sig = FunctionType::void(vec![TypeLayout::I64; 8]);
        let r = recipe(&sig, Abi::SysV).unwrap();
        assert_eq!(r.stack_stream().to_string(), "PULL PULL STOP");
    }

    #[test]
    fn test_packed_stack_is_rejected() {
        let sig = FunctionType::void(vec![TypeLayout::I32; 10]);
        assert!(matches!(
            recipe(&sig, Abi::Aarch64MacOs),
            Err(Error::UnsupportedShape(_))
        ));
    }
}
