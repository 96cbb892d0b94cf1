//! Native code calling back into managed code.
//!
//! An [`UpcallStub`] owns an entry point: a unique address registered in the
//! process-wide upcall registry. Native code reaches the managed target by
//! calling [`invoke_entry_point`] with that address and its register frame.
//! Failures of the target never propagate to native code; they are reported to
//! the uncaught handler and a zero value is returned instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::calling_sequence::{ArgumentRole, CallingSequence, Direction};
use crate::frame::NativeFrame;
use crate::interpret;
use crate::memory::{AutoAllocator, Segment};
use crate::stub::{Backend, StubStrategy};
use crate::value::{MethodType, Value, ValueType};
use crate::{Error, Result};

type TargetFn = dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync;

/// Receives every error raised while handling an upcall.
pub type UncaughtHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// The handler used when none is configured: log and carry on.
#[must_use]
pub fn default_uncaught_handler() -> UncaughtHandler {
    Arc::new(|error: &Error| tracing::error!(%error, "uncaught error in upcall"))
}

/// A managed function native code may call.
#[derive(Clone)]
pub struct UpcallTarget {
    id: Arc<str>,
    ty: MethodType,
    func: Arc<TargetFn>,
}

impl UpcallTarget {
    pub fn new<F>(id: &str, ty: MethodType, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            ty,
            func: Arc::new(func),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn method_type(&self) -> &MethodType {
        &self.ty
    }

    pub fn call(&self, params: &[Value]) -> Result<Option<Value>> {
        (self.func)(params).map_err(|error| match error {
            Error::UpcallFailure(_) => error,
            other => Error::UpcallFailure(format!("`{}`: {other}", self.id)),
        })
    }
}

impl fmt::Debug for UpcallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallTarget")
            .field("id", &self.id)
            .field("ty", &self.ty.to_string())
            .finish()
    }
}

/// Checks the target's result and turns it into the value the return program consumes.
///
/// For in-memory returns the result is copied into `buffer`.
pub(crate) fn prepare_return(
    sequence: &CallingSequence,
    buffer: Option<Segment>,
    result: Option<Value>,
) -> Result<Option<Value>> {
    let ret = sequence.caller_type().ret();
    if let Some(buffer) = buffer {
        let value = result.ok_or_else(|| {
            Error::UpcallFailure("target returned nothing for a composite result".into())
        })?;
        let source = value.as_segment().map_err(|_| {
            Error::UpcallFailure(format!("target returned {}, expected a segment", value.value_type()))
        })?;
        buffer.copy_from(&source.slice(0, buffer.len())?)?;
        return Ok(sequence.return_carrier().map(|_| Value::Segment(buffer)));
    }
    match (ret, result) {
        (None, None) => Ok(None),
        (Some(expected), Some(value)) if value.value_type().is_assignable_to(expected) => {
            Ok(Some(value))
        }
        (expected, actual) => Err(Error::UpcallFailure(format!(
            "target returned {}, expected {}",
            actual.map_or_else(|| "nothing".to_owned(), |v| v.value_type().to_string()),
            expected.map_or_else(|| "nothing".to_owned(), |t| t.to_string()),
        ))),
    }
}

/// Writes a zero result into `frame` after a failed upcall.
fn write_default_return(sequence: &CallingSequence, frame: &mut NativeFrame) -> Result<()> {
    let value = if sequence.needs_return_buffer() {
        let arg = sequence
            .arguments()
            .iter()
            .find(|arg| arg.role == ArgumentRole::ReturnBuffer)
            .ok_or_else(|| Error::Internal("in-memory return without a buffer argument".into()))?;
        let buffer = interpret::box_value(&arg.program, frame, &mut AutoAllocator)?
            .ok_or_else(|| Error::Internal("return buffer program produced no value".into()))?;
        let segment = buffer.as_segment()?;
        segment.write(0, &vec![0; segment.len() as usize])?;
        match sequence.return_carrier() {
            Some(_) => buffer,
            None => return Ok(()),
        }
    } else {
        match (sequence.return_carrier(), sequence.signature().ret()) {
            (None, _) => return Ok(()),
            (Some(ty), Some(layout)) if ty == ValueType::Segment => {
                Value::Segment(Segment::allocate(layout.size(), layout.align())?)
            }
            (Some(ty), _) => Value::zero(ty)
                .ok_or_else(|| Error::Internal(format!("no zero value for {ty}")))?,
        }
    };
    interpret::unbox(sequence.return_program(), value, frame, &mut AutoAllocator)
}

/// Compiled upcall code for one signature, shared by every stub built from it.
pub struct UpcallCode {
    sequence: Arc<CallingSequence>,
    backend: Backend,
}

impl UpcallCode {
    pub fn new(sequence: Arc<CallingSequence>, strategy: StubStrategy) -> Result<Self> {
        if sequence.direction() != Direction::Upcall {
            return Err(Error::Internal(
                "upcall code built from a downcall sequence".into(),
            ));
        }
        let backend = Backend::select(&sequence, strategy);
        Ok(Self { sequence, backend })
    }

    #[must_use]
    pub fn sequence(&self) -> &Arc<CallingSequence> {
        &self.sequence
    }

    #[must_use]
    pub fn strategy(&self) -> StubStrategy {
        self.backend.strategy()
    }

    /// Runs the upcall. Never fails: errors go to `handler`.
    fn dispatch(&self, target: &UpcallTarget, handler: &UncaughtHandler, frame: &mut NativeFrame) {
        let Err(error) = self.backend.invoke_upcall(&self.sequence, target, frame) else {
            return;
        };
        handler(&error);
        if let Err(error) = write_default_return(&self.sequence, frame) {
            tracing::error!(%error, target = target.id(), "failed to write default upcall result");
        }
    }
}

impl fmt::Debug for UpcallCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallCode")
            .field("signature", &self.sequence.signature().to_string())
            .field("strategy", &self.strategy())
            .finish()
    }
}

struct Entry {
    code: Arc<UpcallCode>,
    target: UpcallTarget,
    handler: UncaughtHandler,
    /// Keeps the entry point's address mapped.
    anchor: Segment,
}

#[derive(Default)]
struct UpcallRegistry {
    entries: RwLock<HashMap<u64, Arc<Entry>>>,
}

static REGISTRY: OnceLock<UpcallRegistry> = OnceLock::new();

impl UpcallRegistry {
    fn get() -> &'static UpcallRegistry {
        REGISTRY.get_or_init(UpcallRegistry::default)
    }

    fn insert(&self, entry: Entry) -> u64 {
        let address = entry.anchor.address();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, Arc::new(entry));
        address
    }

    fn remove(&self, address: u64) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
            .is_some()
    }

    fn lookup(&self, address: u64) -> Option<Arc<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }
}

/// Calls the upcall stub registered at `address` with the register state in `frame`.
///
/// Fails only if no stub is registered there.
pub fn invoke_entry_point(address: u64, frame: &mut NativeFrame) -> Result<()> {
    let entry = UpcallRegistry::get().lookup(address).ok_or_else(|| {
        Error::InvalidArgument(format!("no upcall stub registered at {address:#x}"))
    })?;
    entry.code.dispatch(&entry.target, &entry.handler, frame);
    Ok(())
}

/// A callable entry point for one managed target.
///
/// The entry point stays valid until [`UpcallStub::release`] is called or the
/// stub is dropped.
pub struct UpcallStub {
    entry_point: u64,
    code: Arc<UpcallCode>,
    released: bool,
}

impl UpcallStub {
    pub(crate) fn register(
        code: Arc<UpcallCode>,
        target: UpcallTarget,
        handler: UncaughtHandler,
    ) -> Result<Self> {
        let anchor = Segment::allocate(16, 16)?;
        let entry_point = UpcallRegistry::get().insert(Entry {
            code: Arc::clone(&code),
            target,
            handler,
            anchor,
        });
        tracing::debug!(entry_point = format_args!("{entry_point:#x}"), "registered upcall stub");
        Ok(Self {
            entry_point,
            code,
            released: false,
        })
    }

    #[must_use]
    pub const fn entry_point(&self) -> u64 {
        self.entry_point
    }

    #[must_use]
    pub fn code(&self) -> &Arc<UpcallCode> {
        &self.code
    }

    /// Unregisters the entry point. Later calls through it fail.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            UpcallRegistry::get().remove(self.entry_point);
        }
    }
}

impl Drop for UpcallStub {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for UpcallStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallStub")
            .field("entry_point", &format_args!("{:#x}", self.entry_point))
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::classify::classify;
    use crate::layout::{FunctionType, TypeLayout};
    use std::sync::Mutex;

    fn code(sig: &FunctionType, abi: Abi) -> Arc<UpcallCode> {
        let seq = classify(sig, abi, Direction::Upcall).unwrap();
        Arc::new(UpcallCode::new(Arc::new(seq), StubStrategy::Auto).unwrap())
    }

    #[test]
    fn test_entry_point_dispatch() {
        let sig = FunctionType::returning([TypeLayout::I32, TypeLayout::I32], TypeLayout::I32);
        let target = UpcallTarget::new(
            "sub",
            sig.carrier_type(),
            |args| match args {
                [Value::I32(a), Value::I32(b)] => Ok(Some(Value::I32(a - b))),
                _ => Err(Error::InvalidArgument("bad arguments".into())),
            },
        );
        let mut stub = UpcallStub::register(code(&sig, Abi::SysV), target, default_uncaught_handler()).unwrap();
        let mut frame = NativeFrame::new();
        frame.set_integer(7, 10);
        frame.set_integer(6, 3);
        invoke_entry_point(stub.entry_point(), &mut frame).unwrap();
        assert_eq!(frame.integer(0), 7);

        stub.release();
        let err = invoke_entry_point(stub.entry_point(), &mut frame).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
    }

    #[test]
    fn test_failure_writes_zero_and_reports() {
        let sig = FunctionType::returning([], TypeLayout::F64);
        let target = UpcallTarget::new("boom", sig.carrier_type(), |_| {
            Err(Error::Internal("boom".into()))
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: UncaughtHandler = Arc::new(move |e: &Error| sink.lock().unwrap().push(e.clone()));
        let stub = UpcallStub::register(code(&sig, Abi::SysV), target, handler).unwrap();
        let mut frame = NativeFrame::new();
        frame.set_vector(0, 1.5f64.to_bits());
        invoke_entry_point(stub.entry_point(), &mut frame).unwrap();
        assert_eq!(frame.vector(0), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Error::UpcallFailure(_)));
    }

    #[test]
    fn test_wrong_result_type_is_a_failure() {
        let sig = FunctionType::returning([], TypeLayout::I64);
        let seq = classify(&sig, Abi::SysV, Direction::Upcall).unwrap();
        let err = prepare_return(&seq, None, Some(Value::F64(1.0))).unwrap_err();
        assert!(matches!(err, Error::UpcallFailure(_)), "{err}");
        assert_eq!(
            prepare_return(&seq, None, Some(Value::I64(4))).unwrap(),
            Some(Value::I64(4))
        );
        assert_eq!(seq.caller_type().ret(), Some(ValueType::I64));
    }
}
