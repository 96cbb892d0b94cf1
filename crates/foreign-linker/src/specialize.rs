//! Straight-line call stubs.
//!
//! A [`SpecializedStub`] replays the binding programs of a calling sequence
//! without an operand stack: every stack depth is resolved to a local slot when
//! the stub is built, and each operator becomes one closure over those slots.
//!
//! Local slots are laid out as follows:
//! - `0..n`: caller-visible parameters
//! - `n`: return buffer
//! - `n + 1`: return value
//! - `n + 2`: vector register count
//! - `n + 3..`: operand stack depths 1 and deeper, shared by all programs
//!
//! Depth 0 of a program is its anchor slot, so unboxing starts directly on the
//! caller's parameter and boxing finishes directly in its destination.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::binding::Binding;
use crate::calling_sequence::{ArgumentRole, CallingSequence, Direction};
use crate::downcall;
use crate::frame::{NativeFrame, NativeSymbol, StorageAccess};
use crate::memory::{self, Arena, AutoAllocator, SegmentAllocator};
use crate::storage::VMStorage;
use crate::upcall::{self, UpcallTarget};
use crate::value::{Address, Value, ValueType};
use crate::{Error, Result};

/// Most local slots a stub may use.
pub const MAX_LOCALS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Arguments,
    Return,
}

struct StubState<'f> {
    locals: Vec<Option<Value>>,
    natives: Vec<Option<Value>>,
    frame: &'f mut NativeFrame,
    arena: Arena,
}

impl StubState<'_> {
    fn get(&self, slot: usize) -> Result<&Value> {
        self.locals
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Internal(format!("local {slot} read before it was written")))
    }

    fn take(&mut self, slot: usize) -> Result<Value> {
        self.locals
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| Error::Internal(format!("local {slot} read before it was written")))
    }

    fn set(&mut self, slot: usize, value: Value) {
        self.locals[slot] = Some(value);
    }

    fn allocate(&mut self, phase: Phase, size: u64, align: u64) -> Result<memory::Segment> {
        match phase {
            Phase::Arguments => self.arena.allocate(size, align),
            Phase::Return => AutoAllocator.allocate(size, align),
        }
    }
}

type StubOp = Box<dyn Fn(&mut StubState<'_>) -> Result<()> + Send + Sync>;

/// A compiled marshalling procedure for one calling sequence.
pub struct SpecializedStub {
    sequence: Arc<CallingSequence>,
    argument_ops: Vec<StubOp>,
    return_ops: Vec<StubOp>,
    native_params: Vec<(VMStorage, ValueType)>,
    locals: usize,
    listing: Vec<String>,
}

struct StubCompiler {
    direction: Direction,
    scratch_base: usize,
    max_scratch: usize,
    native_params: Vec<(VMStorage, ValueType)>,
    listing: Vec<String>,
}

impl StubCompiler {
    fn slot(&mut self, anchor: usize, depth: usize) -> usize {
        if depth == 0 {
            anchor
        } else {
            self.max_scratch = self.max_scratch.max(depth);
            self.scratch_base + depth - 1
        }
    }

    fn compile(
        &mut self,
        label: &str,
        program: &[Binding],
        anchor: usize,
        phase: Phase,
        unboxing: bool,
    ) -> Result<Vec<StubOp>> {
        let mut depth = usize::from(unboxing);
        let mut ops = Vec::with_capacity(program.len());
        for binding in program {
            let (op, next_depth, effect) = self.compile_one(binding, anchor, depth, phase)?;
            let text = binding.to_string();
            self.listing.push(format!("{label:<14} {text:<32} {effect}"));
            ops.push(op);
            depth = next_depth;
        }
        Ok(ops)
    }

    #[allow(clippy::too_many_lines)]
    fn compile_one(
        &mut self,
        binding: &Binding,
        anchor: usize,
        depth: usize,
        phase: Phase,
    ) -> Result<(StubOp, usize, String)> {
        let underflow = || Error::Internal(format!("`{binding}` underflows the operand stack"));
        let top = depth.checked_sub(1).map(|d| self.slot(anchor, d));
        let compiled: (StubOp, usize, String) = match binding.clone() {
            Binding::VmStore { storage, ty } => {
                let src = top.ok_or_else(underflow)?;
                match (self.direction, phase) {
                    (Direction::Downcall, Phase::Arguments) => {
                        let k = self.native_params.len();
                        self.native_params.push((storage, ty));
                        (
                            Box::new(move |s: &mut StubState<'_>| {
                                let value = s.take(src)?;
                                s.natives[k] = Some(value);
                                Ok(())
                            }),
                            depth - 1,
                            format!("native{k} <- l{src}"),
                        )
                    }
                    (Direction::Upcall, Phase::Return) => {
                        let effect = format!("{storage} <- l{src}");
                        (
                            Box::new(move |s: &mut StubState<'_>| {
                                let value = s.take(src)?;
                                s.frame.store(&storage, ty, &value)
                            }),
                            depth - 1,
                            effect,
                        )
                    }
                    _ => return Err(misplaced(binding)),
                }
            }
            Binding::VmLoad { storage, ty } => {
                let dst = self.slot(anchor, depth);
                match (self.direction, phase) {
                    (Direction::Upcall, Phase::Arguments) => {
                        let k = self.native_params.len();
                        self.native_params.push((storage, ty));
                        (
                            Box::new(move |s: &mut StubState<'_>| {
                                let value = s.natives[k].clone().ok_or_else(|| {
                                    Error::Internal(format!("native parameter {k} was not loaded"))
                                })?;
                                s.set(dst, value);
                                Ok(())
                            }),
                            depth + 1,
                            format!("l{dst} <- native{k}"),
                        )
                    }
                    (Direction::Downcall, Phase::Return) => {
                        let effect = format!("l{dst} <- {storage}");
                        (
                            Box::new(move |s: &mut StubState<'_>| {
                                let value = s.frame.load(&storage, ty)?;
                                s.set(dst, value);
                                Ok(())
                            }),
                            depth + 1,
                            effect,
                        )
                    }
                    _ => return Err(misplaced(binding)),
                }
            }
            Binding::BufferStore { offset, size, .. } => {
                let value = top.ok_or_else(underflow)?;
                let buffer = self.slot(anchor, depth.checked_sub(2).ok_or_else(underflow)?);
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let v = s.take(value)?;
                        let b = s.take(buffer)?;
                        b.as_segment()?.set(offset, size, &v)
                    }),
                    depth - 2,
                    format!("l{buffer}[{offset}] <- l{value}"),
                )
            }
            Binding::BufferLoad { offset, ty, size } => {
                let slot = top.ok_or_else(underflow)?;
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let value = s.get(slot)?.as_segment()?.get(ty, offset, size)?;
                        s.set(slot, value);
                        Ok(())
                    }),
                    depth,
                    format!("l{slot} <- l{slot}[{offset}]"),
                )
            }
            Binding::Copy { size, align } => {
                let slot = top.ok_or_else(underflow)?;
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let bytes = s.get(slot)?.as_segment()?.slice(0, size)?.to_vec()?;
                        let copy = s.allocate(phase, size, align)?;
                        copy.write(0, &bytes)?;
                        s.set(slot, Value::Segment(copy));
                        Ok(())
                    }),
                    depth,
                    format!("l{slot} <- copy l{slot}"),
                )
            }
            Binding::Allocate { size, align } => {
                let dst = self.slot(anchor, depth);
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let segment = s.allocate(phase, size, align)?;
                        s.set(dst, Value::Segment(segment));
                        Ok(())
                    }),
                    depth + 1,
                    format!("l{dst} <- allocate"),
                )
            }
            Binding::BoxAddress { size } => {
                let slot = top.ok_or_else(underflow)?;
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let raw = s.get(slot)?.to_bits();
                        s.set(slot, Value::Address(Address::new(raw, size)));
                        Ok(())
                    }),
                    depth,
                    format!("l{slot} <- address l{slot}"),
                )
            }
            Binding::UnboxAddress => {
                let slot = top.ok_or_else(underflow)?;
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let raw = s.get(slot)?.raw_address()?;
                        s.set(slot, Value::I64(raw as i64));
                        Ok(())
                    }),
                    depth,
                    format!("l{slot} <- raw l{slot}"),
                )
            }
            Binding::ToSegment { size } => {
                let slot = top.ok_or_else(underflow)?;
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let raw = s.get(slot)?.raw_address()?;
                        s.set(slot, Value::Segment(memory::resolve(raw, size)?));
                        Ok(())
                    }),
                    depth,
                    format!("l{slot} <- segment l{slot}"),
                )
            }
            Binding::Dup => {
                let src = top.ok_or_else(underflow)?;
                let dst = self.slot(anchor, depth);
                (
                    Box::new(move |s: &mut StubState<'_>| {
                        let value = s.get(src)?.clone();
                        s.set(dst, value);
                        Ok(())
                    }),
                    depth + 1,
                    format!("l{dst} <- l{src}"),
                )
            }
        };
        Ok(compiled)
    }
}

fn misplaced(binding: &Binding) -> Error {
    Error::BindingVerification(format!("`{binding}` cannot appear in this program"))
}

/// Builds a specialized stub for `sequence`.
///
/// Fails with [`Error::UnsupportedShape`] for variadic sequences and for stubs
/// needing more than [`MAX_LOCALS`] local slots.
pub fn specialize(sequence: Arc<CallingSequence>) -> Result<SpecializedStub> {
    if sequence.signature().is_variadic() {
        return Err(Error::UnsupportedShape(
            "variadic calls are interpreted".into(),
        ));
    }
    let arity = sequence.caller_arity();
    let buffer_slot = arity;
    let return_slot = arity + 1;
    let count_slot = arity + 2;
    let mut compiler = StubCompiler {
        direction: sequence.direction(),
        scratch_base: arity + 3,
        max_scratch: 0,
        native_params: Vec::new(),
        listing: Vec::new(),
    };
    let unbox_args = sequence.direction() == Direction::Downcall;

    let mut argument_ops = Vec::new();
    for arg in sequence.arguments() {
        let (anchor, label) = match arg.role {
            ArgumentRole::Parameter(i) => (i, format!("arg {i}")),
            ArgumentRole::ReturnBuffer => (buffer_slot, "return buffer".to_owned()),
            ArgumentRole::VectorRegisterCount(n) => {
                argument_ops.push(Box::new(move |s: &mut StubState<'_>| {
                    s.set(count_slot, Value::I64(n as i64));
                    Ok(())
                }) as StubOp);
                compiler.listing.push(format!(
                    "{:<14} {:<32} l{count_slot} <- {n}",
                    "vector count", "const"
                ));
                (count_slot, "vector count".to_owned())
            }
        };
        argument_ops.extend(compiler.compile(
            &label,
            &arg.program,
            anchor,
            Phase::Arguments,
            unbox_args,
        )?);
    }
    let return_ops = compiler.compile(
        "return",
        sequence.return_program(),
        return_slot,
        Phase::Return,
        !unbox_args,
    )?;

    let locals = compiler.scratch_base + compiler.max_scratch;
    let total = locals + compiler.native_params.len();
    if total > MAX_LOCALS {
        return Err(Error::UnsupportedShape(format!(
            "stub needs {total} locals, at most {MAX_LOCALS} are supported"
        )));
    }
    tracing::debug!(
        signature = %sequence.signature(),
        direction = %sequence.direction(),
        locals = total,
        "specialized stub"
    );
    Ok(SpecializedStub {
        sequence,
        argument_ops,
        return_ops,
        native_params: compiler.native_params,
        locals,
        listing: compiler.listing,
    })
}

impl SpecializedStub {
    #[must_use]
    pub fn sequence(&self) -> &Arc<CallingSequence> {
        &self.sequence
    }

    /// One line per resolved instruction.
    #[must_use]
    pub fn listing(&self) -> &[String] {
        &self.listing
    }

    /// Local slots used, native parameter slots included.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.locals + self.native_params.len()
    }

    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "stub for {} ({} locals, {} native params)",
            self.sequence.signature(),
            self.local_count(),
            self.native_params.len()
        );
        for line in &self.listing {
            let _ = writeln!(out, "  {line}");
        }
        out
    }

    fn state<'f>(&self, frame: &'f mut NativeFrame) -> Result<StubState<'f>> {
        let mut locals = Vec::new();
        locals.resize_with(self.locals, || None);
        let mut natives = Vec::new();
        natives.resize_with(self.native_params.len(), || None);
        Ok(StubState {
            locals,
            natives,
            frame,
            arena: Arena::bounded(self.sequence.scratch_allocation_size())?,
        })
    }

    pub(crate) fn invoke_downcall(
        &self,
        target: &NativeSymbol,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let sequence = &self.sequence;
        downcall::check_arguments(sequence, args)?;
        let arity = sequence.caller_arity();
        let buffer = downcall::return_buffer(sequence)?;
        let mut frame = NativeFrame::new();
        let mut state = self.state(&mut frame)?;
        for (i, arg) in args.iter().enumerate() {
            state.set(i, arg.clone());
        }
        if let Some(buffer) = &buffer {
            state.set(arity, Value::Segment(buffer.clone()));
        }
        for op in &self.argument_ops {
            op(&mut state)?;
        }
        for (k, (storage, ty)) in self.native_params.iter().enumerate() {
            let value = state.natives[k]
                .take()
                .ok_or_else(|| Error::Internal(format!("native parameter {k} was not produced")))?;
            state.frame.store(storage, *ty, &value)?;
        }
        downcall::call_native(target, &mut *state.frame)?;
        for op in &self.return_ops {
            op(&mut state)?;
        }
        let result = match buffer {
            Some(buffer) => Some(Value::Segment(buffer)),
            None => state.locals[arity + 1].take(),
        };
        state.arena.release();
        Ok(result)
    }

    pub(crate) fn invoke_upcall(
        &self,
        target: &UpcallTarget,
        frame: &mut NativeFrame,
    ) -> Result<()> {
        let sequence = &self.sequence;
        let arity = sequence.caller_arity();
        let mut state = self.state(frame)?;
        for (k, (storage, ty)) in self.native_params.iter().enumerate() {
            state.natives[k] = Some(state.frame.load(storage, *ty)?);
        }
        for op in &self.argument_ops {
            op(&mut state)?;
        }
        let params = (0..arity)
            .map(|i| state.take(i))
            .collect::<Result<Vec<_>>>()?;
        let buffer = match state.locals[arity].take() {
            Some(value) => Some(value.as_segment()?.clone()),
            None => None,
        };
        let result = target.call(&params)?;
        if let Some(value) = upcall::prepare_return(sequence, buffer, result)? {
            state.set(arity + 1, value);
            for op in &self.return_ops {
                op(&mut state)?;
            }
        }
        state.arena.release();
        Ok(())
    }
}

impl std::fmt::Debug for SpecializedStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecializedStub")
            .field("signature", &self.sequence.signature().to_string())
            .field("locals", &self.local_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::classify::classify;
    use crate::layout::{FunctionType, TypeLayout};

    #[test]
    fn test_variadic_is_unsupported() {
        let sig = FunctionType::void([TypeLayout::I32]).variadic();
        let seq = classify(&sig, Abi::SysV, Direction::Downcall).unwrap();
        let err = specialize(Arc::new(seq)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");
    }

    #[test]
    fn test_too_many_locals_is_unsupported() {
        let sig = FunctionType::void(vec![TypeLayout::I64; 200]);
        let seq = classify(&sig, Abi::SysV, Direction::Downcall).unwrap();
        let err = specialize(Arc::new(seq)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");
    }

    #[test]
    fn test_listing_resolves_slots() {
        let pair = TypeLayout::structure([TypeLayout::I64, TypeLayout::F64]);
        let sig = FunctionType::returning([TypeLayout::I32, pair], TypeLayout::I32);
        let seq = classify(&sig, Abi::SysV, Direction::Downcall).unwrap();
        let stub = specialize(Arc::new(seq)).unwrap();
        // Two parameters, three fixed slots and one scratch depth for the dup.
        assert_eq!(stub.local_count(), 2 + 3 + 1 + 3);
        assert!(stub.listing()[0].contains("native0 <- l0"), "{:?}", stub.listing());
        assert!(stub.dump().contains("return"));
    }
}
