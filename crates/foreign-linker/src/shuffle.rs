//! Register-only fast path.
//!
//! When every argument of a sequence travels in exactly one register, the
//! binding programs reduce to moving raw 64-bit words. The shuffler erases each
//! caller parameter to a wide integer or wide float and reorders the parameters
//! so that all integers come first, followed by all floats.

use std::fmt;
use std::sync::Arc;

use crate::binding::Binding;
use crate::calling_sequence::{ArgumentRole, CallingSequence, Direction};
use crate::downcall;
use crate::frame::{NativeFrame, NativeSymbol};
use crate::storage::{StorageClass, VMStorage};
use crate::upcall::{self, UpcallTarget};
use crate::value::{Address, Value, ValueType};
use crate::{Error, Result};

/// Most caller parameters the shuffler accepts.
pub const MAX_ARITY: usize = 16;

/// One scalar or address moved as a raw word through a single storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErasedSlot {
    pub storage: VMStorage,
    pub ty: ValueType,
    /// Pointee size when the slot carries an address.
    pub address_size: Option<u64>,
}

impl ErasedSlot {
    pub(crate) fn is_float(&self) -> bool {
        self.ty.is_float()
    }

    pub(crate) fn erase(&self, value: &Value) -> Result<u64> {
        match self.address_size {
            Some(_) => value.raw_address(),
            None => Ok(value.to_bits()),
        }
    }

    pub(crate) fn restore(&self, bits: u64) -> Result<Value> {
        match self.address_size {
            Some(size) => Ok(Value::Address(Address::new(bits, size))),
            None => Value::from_bits(self.ty, bits),
        }
    }
}

/// Recognizes the single-storage form of an argument or return program.
///
/// Unboxing programs must be `[vm_store]` or `[unbox_address, vm_store]`;
/// boxing programs `[vm_load]` or `[vm_load, box_address]`.
pub(crate) fn erased_slot(program: &[Binding], unboxing: bool) -> Option<ErasedSlot> {
    let slot = |storage: &VMStorage, ty: ValueType, address_size| ErasedSlot {
        storage: storage.clone(),
        ty,
        address_size,
    };
    match (unboxing, program) {
        (true, [Binding::VmStore { storage, ty }]) if ty.is_primitive() => {
            Some(slot(storage, *ty, None))
        }
        (true, [Binding::UnboxAddress, Binding::VmStore { storage, ty }]) => {
            Some(slot(storage, *ty, Some(0)))
        }
        (false, [Binding::VmLoad { storage, ty }]) if ty.is_primitive() => {
            Some(slot(storage, *ty, None))
        }
        (false, [Binding::VmLoad { storage, ty }, Binding::BoxAddress { size }]) => {
            Some(slot(storage, *ty, Some(*size)))
        }
        _ => None,
    }
}

/// Erased parameters and return slot of a sequence whose every argument is a
/// caller parameter carried in one storage.
pub(crate) fn erased_signature(
    sequence: &CallingSequence,
) -> Result<(Vec<ErasedSlot>, Option<ErasedSlot>)> {
    if sequence.needs_return_buffer() {
        return Err(Error::UnsupportedShape("in-memory return".into()));
    }
    let unbox_args = sequence.direction() == Direction::Downcall;
    let mut params = Vec::with_capacity(sequence.arguments().len());
    for (i, arg) in sequence.arguments().iter().enumerate() {
        if arg.role != ArgumentRole::Parameter(i) {
            return Err(Error::UnsupportedShape(format!(
                "argument {i} is not a plain parameter"
            )));
        }
        let slot = erased_slot(&arg.program, unbox_args).ok_or_else(|| {
            Error::UnsupportedShape(format!("argument {i} does not use a single storage"))
        })?;
        params.push(slot);
    }
    let ret = if sequence.return_program().is_empty() {
        None
    } else {
        Some(
            erased_slot(sequence.return_program(), !unbox_args).ok_or_else(|| {
                Error::UnsupportedShape("return does not use a single register".into())
            })?,
        )
    };
    if ret.as_ref().is_some_and(|slot| !slot.storage.is_register()) {
        return Err(Error::UnsupportedShape("return is not in a register".into()));
    }
    Ok((params, ret))
}

/// A compiled register shuffle.
pub struct ShuffledStub {
    sequence: Arc<CallingSequence>,
    params: Vec<ErasedSlot>,
    ret: Option<ErasedSlot>,
    /// `permutation[j]` is the caller parameter moved into position `j`.
    permutation: Vec<usize>,
}

impl ShuffledStub {
    pub fn new(sequence: Arc<CallingSequence>) -> Result<Self> {
        if sequence.caller_arity() > MAX_ARITY {
            return Err(Error::UnsupportedShape(format!(
                "{} parameters, at most {MAX_ARITY} are shuffled",
                sequence.caller_arity()
            )));
        }
        let (params, ret) = erased_signature(&sequence)?;
        if let Some(slot) = params.iter().find(|slot| !slot.storage.is_register()) {
            return Err(Error::UnsupportedShape(format!(
                "parameter passed in `{}`",
                slot.storage
            )));
        }
        let (ints, floats): (Vec<usize>, Vec<usize>) =
            (0..params.len()).partition(|&i| !params[i].is_float());
        let permutation = ints.into_iter().chain(floats).collect();
        tracing::debug!(
            signature = %sequence.signature(),
            ?permutation,
            "shuffled stub"
        );
        Ok(Self {
            sequence,
            params,
            ret,
            permutation,
        })
    }

    #[must_use]
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Number of parameters erased to wide integers.
    #[must_use]
    pub fn integer_count(&self) -> usize {
        self.params.iter().filter(|slot| !slot.is_float()).count()
    }

    pub(crate) fn invoke_downcall(&self, target: &NativeSymbol, args: &[Value]) -> Result<Option<Value>> {
        downcall::check_arguments(&self.sequence, args)?;
        let mut frame = NativeFrame::new();
        for &i in &self.permutation {
            let slot = &self.params[i];
            frame.store_bits(&slot.storage, slot.erase(&args[i])?)?;
        }
        downcall::call_native(target, &mut frame)?;
        match &self.ret {
            Some(slot) => Ok(Some(slot.restore(frame.load_bits(&slot.storage)?)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn invoke_upcall(&self, target: &UpcallTarget, frame: &mut NativeFrame) -> Result<()> {
        let mut wide = Vec::with_capacity(self.permutation.len());
        for &i in &self.permutation {
            wide.push(frame.load_bits(&self.params[i].storage)?);
        }
        let mut params = Vec::new();
        params.resize_with(self.params.len(), || Value::I64(0));
        for (bits, &i) in wide.into_iter().zip(&self.permutation) {
            params[i] = self.params[i].restore(bits)?;
        }
        let result = target.call(&params)?;
        if let (Some(slot), Some(value)) = (&self.ret, upcall::prepare_return(&self.sequence, None, result)?) {
            frame.store_bits(&slot.storage, slot.erase(&value)?)?;
        }
        Ok(())
    }
}

impl fmt::Display for ShuffledStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shuffle {:?}", self.permutation)?;
        for &i in &self.permutation {
            let slot = &self.params[i];
            let class = match slot.storage.class() {
                StorageClass::Vector => "float",
                _ => "int",
            };
            write!(f, "\n  arg {i} -> {class} {}", slot.storage)?;
        }
        if let Some(ret) = &self.ret {
            write!(f, "\n  return <- {}", ret.storage)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ShuffledStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffledStub")
            .field("permutation", &self.permutation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::classify::classify;
    use crate::layout::{FunctionType, TypeLayout};

    fn shuffled(sig: &FunctionType, abi: Abi) -> Result<ShuffledStub> {
        ShuffledStub::new(Arc::new(classify(sig, abi, Direction::Downcall)?))
    }

    #[test]
    fn test_integers_before_floats() {
        let sig = FunctionType::returning(
            [TypeLayout::F64, TypeLayout::I32, TypeLayout::F32, TypeLayout::POINTER],
            TypeLayout::F64,
        );
        let stub = shuffled(&sig, Abi::SysV).unwrap();
        assert_eq!(stub.permutation(), &[1, 3, 0, 2]);
        assert_eq!(stub.integer_count(), 2);
    }

    #[test]
    fn test_rejected_shapes() {
        let pair = TypeLayout::structure([TypeLayout::I64, TypeLayout::I64]);
        let composite = FunctionType::void([pair]);
        assert!(matches!(
            shuffled(&composite, Abi::SysV),
            Err(Error::UnsupportedShape(_))
        ));

        let wide = FunctionType::void(vec![TypeLayout::I32; MAX_ARITY + 1]);
        assert!(matches!(
            shuffled(&wide, Abi::SysV),
            Err(Error::UnsupportedShape(_))
        ));

        let spilled = FunctionType::void(vec![TypeLayout::I64; 7]);
        assert!(matches!(
            shuffled(&spilled, Abi::SysV),
            Err(Error::UnsupportedShape(_))
        ));
    }

    #[test]
    fn test_shuffle_moves_bits() {
        let sig = FunctionType::returning([TypeLayout::F64, TypeLayout::I32], TypeLayout::I64);
        let stub = shuffled(&sig, Abi::SysV).unwrap();
        let add = NativeSymbol::new("add", |frame| {
            let sum = f64::from_bits(frame.vector(0)) as i64 + frame.integer(7) as i64;
            frame.set_integer(0, sum as u64);
            Ok(())
        });
        let result = stub
            .invoke_downcall(&add, &[Value::F64(2.0), Value::I32(-5)])
            .unwrap();
        assert_eq!(result, Some(Value::I64(-3)));
    }
}
