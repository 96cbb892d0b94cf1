//! Calling native code.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::calling_sequence::{ArgumentRole, CallingSequence, Direction};
use crate::classify::classify;
use crate::frame::{NativeFrame, NativeSymbol};
use crate::interpret;
use crate::layout::{FunctionType, TypeLayout};
use crate::memory::Segment;
use crate::stub::{Backend, StubStrategy};
use crate::value::{Value, ValueType};
use crate::{Error, Result};

/// Checks the number and carrier types of the caller's arguments.
pub(crate) fn check_arguments(sequence: &CallingSequence, args: &[Value]) -> Result<()> {
    let expected = sequence.caller_type();
    if args.len() != expected.params().len() {
        return Err(Error::InvalidArgument(format!(
            "expected {} arguments, got {}",
            expected.params().len(),
            args.len()
        )));
    }
    for (i, (arg, ty)) in args.iter().zip(expected.params()).enumerate() {
        if !arg.value_type().is_assignable_to(*ty) {
            return Err(Error::InvalidArgument(format!(
                "argument {i}: expected {ty}, got {}",
                arg.value_type()
            )));
        }
    }
    Ok(())
}

/// Allocates the in-memory return buffer, if the sequence needs one.
///
/// The buffer becomes the caller's result, so it is not drawn from the call arena.
pub(crate) fn return_buffer(sequence: &CallingSequence) -> Result<Option<Segment>> {
    if sequence.needs_return_buffer() {
        Segment::allocate(sequence.return_buffer_size(), sequence.return_buffer_align()).map(Some)
    } else {
        Ok(None)
    }
}

/// The high-level value fed to the program of an argument with `role`.
pub(crate) fn argument_value(
    role: ArgumentRole,
    args: &[Value],
    buffer: Option<&Segment>,
) -> Result<Value> {
    match role {
        ArgumentRole::Parameter(i) => args
            .get(i)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("missing argument {i}"))),
        ArgumentRole::ReturnBuffer => buffer
            .cloned()
            .map(Value::Segment)
            .ok_or_else(|| Error::Internal("return buffer was not allocated".into())),
        ArgumentRole::VectorRegisterCount(n) => Ok(Value::I64(n as i64)),
    }
}

pub(crate) fn call_native(target: &NativeSymbol, frame: &mut NativeFrame) -> Result<()> {
    tracing::trace!(symbol = target.name(), ?frame, "calling native code");
    target.call(frame).map_err(|fault| Error::NativeCallFailure {
        symbol: target.name().to_owned(),
        code: fault.code,
        message: fault.message,
    })
}

/// Layout a variadic argument is passed with, inferred from its value.
fn promoted_layout(index: usize, value: &Value) -> Result<TypeLayout> {
    match value.value_type() {
        ValueType::I32 => Ok(TypeLayout::I32),
        ValueType::I64 => Ok(TypeLayout::I64),
        ValueType::F64 => Ok(TypeLayout::F64),
        ValueType::Address => Ok(TypeLayout::POINTER),
        other => Err(Error::InvalidArgument(format!(
            "variadic argument {index}: {other} is not a promoted variadic type"
        ))),
    }
}

struct VariadicShapes {
    signature: FunctionType,
    sequences: Mutex<HashMap<Vec<TypeLayout>, Arc<CallingSequence>>>,
}

impl VariadicShapes {
    fn sequence_for(&self, abi: crate::abi::Abi, args: &[Value]) -> Result<Arc<CallingSequence>> {
        let fixed = self.signature.fixed_arity();
        if args.len() < fixed {
            return Err(Error::InvalidArgument(format!(
                "expected at least {fixed} arguments, got {}",
                args.len()
            )));
        }
        let shape = args[fixed..]
            .iter()
            .enumerate()
            .map(|(i, value)| promoted_layout(fixed + i, value))
            .collect::<Result<Vec<_>>>()?;
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sequence) = sequences.get(&shape) {
            return Ok(Arc::clone(sequence));
        }
        let concrete = self.signature.with_variadic_args(shape.iter().cloned());
        let sequence = Arc::new(classify(&concrete, abi, Direction::Downcall)?);
        sequences.insert(shape, Arc::clone(&sequence));
        Ok(sequence)
    }
}

struct HandleInner {
    sequence: Arc<CallingSequence>,
    backend: Backend,
    variadic: Option<VariadicShapes>,
}

/// A reusable invoker for one downcall signature.
///
/// Cloning is cheap; all clones share the compiled stub.
#[derive(Clone)]
pub struct DowncallHandle {
    inner: Arc<HandleInner>,
}

impl DowncallHandle {
    /// Compiles a handle for an already classified downcall sequence.
    pub fn new(sequence: Arc<CallingSequence>, strategy: StubStrategy) -> Result<Self> {
        if sequence.direction() != Direction::Downcall {
            return Err(Error::Internal(
                "downcall handle built from an upcall sequence".into(),
            ));
        }
        let (backend, variadic) = if sequence.signature().is_variadic() {
            let shapes = VariadicShapes {
                signature: sequence.signature().clone(),
                sequences: Mutex::new(HashMap::new()),
            };
            (Backend::Interpreted, Some(shapes))
        } else {
            (Backend::select(&sequence, strategy), None)
        };
        Ok(Self {
            inner: Arc::new(HandleInner {
                sequence,
                backend,
                variadic,
            }),
        })
    }

    #[must_use]
    pub fn sequence(&self) -> &Arc<CallingSequence> {
        &self.inner.sequence
    }

    /// The strategy actually used by this handle.
    #[must_use]
    pub fn strategy(&self) -> StubStrategy {
        self.inner.backend.strategy()
    }

    /// Whether two handles share one compiled stub.
    #[must_use]
    pub fn same_stub(&self, other: &DowncallHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Calls `target` with `args`.
    ///
    /// In-memory returns come back as a fresh [`Segment`] holding the result.
    pub fn invoke(&self, target: &NativeSymbol, args: &[Value]) -> Result<Option<Value>> {
        let inner = &self.inner;
        match &inner.variadic {
            Some(shapes) => {
                let sequence = shapes.sequence_for(inner.sequence.abi(), args)?;
                interpret::invoke_downcall(&sequence, target, args)
            }
            None => inner.backend.invoke_downcall(&inner.sequence, target, args),
        }
    }
}

impl fmt::Debug for DowncallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DowncallHandle")
            .field("signature", &self.inner.sequence.signature().to_string())
            .field("abi", &self.inner.sequence.abi())
            .field("strategy", &self.strategy())
            .finish()
    }
}
