//! Generic execution of binding programs.

use crate::binding::Binding;
use crate::calling_sequence::{ArgumentRole, CallingSequence};
use crate::downcall;
use crate::frame::{NativeFrame, NativeSymbol, StorageAccess};
use crate::memory::{self, Arena, AutoAllocator, SegmentAllocator};
use crate::upcall::{self, UpcallTarget};
use crate::value::{Address, Value};
use crate::{Error, Result};

/// Runs `program` starting from `stack` and returns the final stack.
pub fn run(
    program: &[Binding],
    mut stack: Vec<Value>,
    access: &mut dyn StorageAccess,
    allocator: &mut dyn SegmentAllocator,
) -> Result<Vec<Value>> {
    for op in program {
        step(op, &mut stack, access, allocator)?;
    }
    Ok(stack)
}

/// Runs an unboxing program on `value`.
pub fn unbox(
    program: &[Binding],
    value: Value,
    access: &mut dyn StorageAccess,
    allocator: &mut dyn SegmentAllocator,
) -> Result<()> {
    let rest = run(program, vec![value], access, allocator)?;
    if rest.is_empty() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "unbox program left {} values on the stack",
            rest.len()
        )))
    }
}

/// Runs a boxing program and returns the value it produced, if any.
pub fn box_value(
    program: &[Binding],
    access: &mut dyn StorageAccess,
    allocator: &mut dyn SegmentAllocator,
) -> Result<Option<Value>> {
    let mut rest = run(program, Vec::new(), access, allocator)?;
    match rest.len() {
        0 | 1 => Ok(rest.pop()),
        n => Err(Error::Internal(format!(
            "box program left {n} values on the stack"
        ))),
    }
}

fn pop(stack: &mut Vec<Value>, op: &Binding) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| Error::Internal(format!("`{op}` on an empty operand stack")))
}

fn step(
    op: &Binding,
    stack: &mut Vec<Value>,
    access: &mut dyn StorageAccess,
    allocator: &mut dyn SegmentAllocator,
) -> Result<()> {
    match op {
        Binding::VmStore { storage, ty } => {
            let value = pop(stack, op)?;
            access.store(storage, *ty, &value)?;
        }
        Binding::VmLoad { storage, ty } => {
            stack.push(access.load(storage, *ty)?);
        }
        Binding::BufferStore { offset, size, .. } => {
            let value = pop(stack, op)?;
            let buffer = pop(stack, op)?;
            buffer.as_segment()?.set(*offset, *size, &value)?;
        }
        Binding::BufferLoad { offset, ty, size } => {
            let buffer = pop(stack, op)?;
            stack.push(buffer.as_segment()?.get(*ty, *offset, *size)?);
        }
        Binding::Copy { size, align } => {
            let source = pop(stack, op)?;
            let bytes = source.as_segment()?.slice(0, *size)?.to_vec()?;
            let copy = allocator.allocate(*size, *align)?;
            copy.write(0, &bytes)?;
            stack.push(Value::Segment(copy));
        }
        Binding::Allocate { size, align } => {
            stack.push(Value::Segment(allocator.allocate(*size, *align)?));
        }
        Binding::BoxAddress { size } => {
            let raw = pop(stack, op)?.to_bits();
            stack.push(Value::Address(Address::new(raw, *size)));
        }
        Binding::UnboxAddress => {
            let raw = pop(stack, op)?.raw_address()?;
            stack.push(Value::I64(raw as i64));
        }
        Binding::ToSegment { size } => {
            let raw = pop(stack, op)?.raw_address()?;
            stack.push(Value::Segment(memory::resolve(raw, *size)?));
        }
        Binding::Dup => {
            let top = stack
                .last()
                .cloned()
                .ok_or_else(|| Error::Internal("`dup()` on an empty operand stack".into()))?;
            stack.push(top);
        }
    }
    Ok(())
}

/// Performs a downcall by interpreting every program of `sequence`.
pub(crate) fn invoke_downcall(
    sequence: &CallingSequence,
    target: &NativeSymbol,
    args: &[Value],
) -> Result<Option<Value>> {
    downcall::check_arguments(sequence, args)?;
    let buffer = downcall::return_buffer(sequence)?;
    let mut arena = Arena::bounded(sequence.scratch_allocation_size())?;
    let mut frame = NativeFrame::new();
    for arg in sequence.arguments() {
        let value = downcall::argument_value(arg.role, args, buffer.as_ref())?;
        unbox(&arg.program, value, &mut frame, &mut arena)?;
    }
    downcall::call_native(target, &mut frame)?;
    match buffer {
        Some(buffer) => Ok(Some(Value::Segment(buffer))),
        None => box_value(sequence.return_program(), &mut frame, &mut AutoAllocator),
    }
}

/// Handles an upcall by interpreting every program of `sequence`.
pub(crate) fn invoke_upcall(
    sequence: &CallingSequence,
    target: &UpcallTarget,
    frame: &mut NativeFrame,
) -> Result<()> {
    let mut arena = Arena::bounded(sequence.scratch_allocation_size())?;
    let mut params = Vec::new();
    params.resize_with(sequence.caller_arity(), || None);
    let mut buffer = None;
    for arg in sequence.arguments() {
        let value = box_value(&arg.program, frame, &mut arena)?
            .ok_or_else(|| Error::Internal("argument program produced no value".into()))?;
        match arg.role {
            ArgumentRole::Parameter(i) => params[i] = Some(value),
            ArgumentRole::ReturnBuffer => buffer = Some(value.as_segment()?.clone()),
            ArgumentRole::VectorRegisterCount(_) => {}
        }
    }
    let params: Vec<Value> = params
        .into_iter()
        .collect::<Option<_>>()
        .ok_or_else(|| Error::Internal("upcall parameter without a program".into()))?;
    let result = target.call(&params)?;
    if let Some(value) = upcall::prepare_return(sequence, buffer, result)? {
        unbox(sequence.return_program(), value, frame, &mut AutoAllocator)?;
    }
    Ok(())
}
