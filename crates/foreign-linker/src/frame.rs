//! The native side of a call: register files, the outgoing stack area and
//! callable native functions.

use std::fmt;
use std::sync::Arc;

use crate::storage::{StorageClass, VMStorage};
use crate::value::{Value, ValueType};
use crate::{Error, Result};

pub const INTEGER_REGISTERS: usize = 32;
pub const VECTOR_REGISTERS: usize = 32;
pub const X87_REGISTERS: usize = 8;

/// Read and write access to machine storage, as used by binding programs.
pub trait StorageAccess {
    fn store(&mut self, storage: &VMStorage, ty: ValueType, value: &Value) -> Result<()>;
    fn load(&mut self, storage: &VMStorage, ty: ValueType) -> Result<Value>;
}

/// Register and stack state exchanged with a native function.
///
/// Registers hold raw 64-bit patterns. Vector registers keep a float's own
/// bits in their low lane; narrow integers are sign-extended. Stack slots are
/// written with the slot's width and read with the type's width.
#[derive(Clone, PartialEq, Eq)]
pub struct NativeFrame {
    integer: [u64; INTEGER_REGISTERS],
    vector: [u64; VECTOR_REGISTERS],
    x87: [u64; X87_REGISTERS],
    stack: Vec<u8>,
}

impl Default for NativeFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeFrame {
    #[must_use]
    pub fn new() -> Self {
        Self {
            integer: [0; INTEGER_REGISTERS],
            vector: [0; VECTOR_REGISTERS],
            x87: [0; X87_REGISTERS],
            stack: Vec::new(),
        }
    }

    #[must_use]
    pub fn integer(&self, index: usize) -> u64 {
        self.integer.get(index).copied().unwrap_or(0)
    }

    pub fn set_integer(&mut self, index: usize, bits: u64) {
        if let Some(reg) = self.integer.get_mut(index) {
            *reg = bits;
        }
    }

    #[must_use]
    pub fn vector(&self, index: usize) -> u64 {
        self.vector.get(index).copied().unwrap_or(0)
    }

    pub fn set_vector(&mut self, index: usize, bits: u64) {
        if let Some(reg) = self.vector.get_mut(index) {
            *reg = bits;
        }
    }

    #[must_use]
    pub fn stack(&self) -> &[u8] {
        &self.stack
    }

    /// Raw bits of a register, or the 8 bytes of a stack slot.
    pub fn load_bits(&self, storage: &VMStorage) -> Result<u64> {
        match storage.class() {
            StorageClass::Stack => {
                let mut raw = [0u8; 8];
                let width = (storage.size() as usize).min(8);
                self.read_stack(storage.offset() as usize, &mut raw[..width])?;
                Ok(u64::from_le_bytes(raw))
            }
            _ => self.register(storage).map(|reg| *reg),
        }
    }

    /// Overwrites a register, or the bytes of a stack slot, with `bits`.
    pub fn store_bits(&mut self, storage: &VMStorage, bits: u64) -> Result<()> {
        match storage.class() {
            StorageClass::Stack => {
                let width = (storage.size() as usize).min(8);
                self.write_stack(storage.offset() as usize, &bits.to_le_bytes()[..width]);
                Ok(())
            }
            _ => {
                *self.register_mut(storage)? = bits;
                Ok(())
            }
        }
    }

    fn register(&self, storage: &VMStorage) -> Result<&u64> {
        let index = storage.index() as usize;
        let file: &[u64] = match storage.class() {
            StorageClass::Integer => &self.integer,
            StorageClass::Vector => &self.vector,
            StorageClass::X87 => &self.x87,
            StorageClass::Stack => &[],
        };
        file.get(index)
            .ok_or_else(|| Error::Internal(format!("no such register `{storage}`")))
    }

    fn register_mut(&mut self, storage: &VMStorage) -> Result<&mut u64> {
        let index = storage.index() as usize;
        let file: &mut [u64] = match storage.class() {
            StorageClass::Integer => &mut self.integer,
            StorageClass::Vector => &mut self.vector,
            StorageClass::X87 => &mut self.x87,
            StorageClass::Stack => &mut [],
        };
        file.get_mut(index)
            .ok_or_else(|| Error::Internal(format!("no such register `{storage}`")))
    }

    fn read_stack(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let bytes = self.stack.get(offset..offset + out.len()).ok_or_else(|| {
            Error::MemoryAccess(format!(
                "stack read of {} bytes at offset {offset} past the argument area",
                out.len()
            ))
        })?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    fn write_stack(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if self.stack.len() < end {
            self.stack.resize(end, 0);
        }
        self.stack[offset..end].copy_from_slice(data);
    }
}

impl StorageAccess for NativeFrame {
    fn store(&mut self, storage: &VMStorage, _ty: ValueType, value: &Value) -> Result<()> {
        self.store_bits(storage, value.to_bits())
    }

    fn load(&mut self, storage: &VMStorage, ty: ValueType) -> Result<Value> {
        let bits = match storage.class() {
            StorageClass::Stack => {
                let width = ty.byte_size().unwrap_or(8).min(u64::from(storage.size())) as usize;
                let mut raw = [0u8; 8];
                self.read_stack(storage.offset() as usize, &mut raw[..width])?;
                u64::from_le_bytes(raw)
            }
            _ => *self.register(storage)?,
        };
        Value::from_bits(ty, bits)
    }
}

impl fmt::Debug for NativeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = |file: &[u64]| -> Vec<(usize, String)> {
            file.iter()
                .enumerate()
                .filter(|(_, bits)| **bits != 0)
                .map(|(i, bits)| (i, format!("{bits:#x}")))
                .collect()
        };
        f.debug_struct("NativeFrame")
            .field("integer", &live(&self.integer))
            .field("vector", &live(&self.vector))
            .field("x87", &live(&self.x87))
            .field("stack", &self.stack.len())
            .finish()
    }
}

/// Error reported by a native function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct NativeFault {
    pub code: i32,
    pub message: String,
}

impl NativeFault {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Native code: reads its arguments from the frame and writes its results back.
pub trait NativeFunction: Send + Sync {
    fn call(&self, frame: &mut NativeFrame) -> std::result::Result<(), NativeFault>;
}

impl<F> NativeFunction for F
where
    F: Fn(&mut NativeFrame) -> std::result::Result<(), NativeFault> + Send + Sync,
{
    fn call(&self, frame: &mut NativeFrame) -> std::result::Result<(), NativeFault> {
        self(frame)
    }
}

/// A named native entry point.
#[derive(Clone)]
pub struct NativeSymbol {
    name: Arc<str>,
    code: Arc<dyn NativeFunction>,
}

impl NativeSymbol {
    pub fn new<F>(name: &str, code: F) -> Self
    where
        F: Fn(&mut NativeFrame) -> std::result::Result<(), NativeFault> + Send + Sync + 'static,
    {
        Self::from_function(name, Arc::new(code))
    }

    #[must_use]
    pub fn from_function(name: &str, code: Arc<dyn NativeFunction>) -> Self {
        Self {
            name: name.into(),
            code,
        }
    }

    /// A symbol calling whatever upcall stub is registered at `address`.
    #[must_use]
    pub fn at_address(address: u64) -> Self {
        Self::new(&format!("fn@{address:#x}"), move |frame| {
            crate::upcall::invoke_entry_point(address, frame)
                .map_err(|e| NativeFault::new(-1, e.to_string()))
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, frame: &mut NativeFrame) -> std::result::Result<(), NativeFault> {
        self.code.call(frame)
    }
}

impl fmt::Debug for NativeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSymbol").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_round_trip() {
        let rdi = VMStorage::register(StorageClass::Integer, 7, 8, "rdi");
        let mut frame = NativeFrame::new();
        frame.store(&rdi, ValueType::I16, &Value::I16(-3)).unwrap();
        assert_eq!(frame.integer(7), u64::MAX - 2);
        assert_eq!(frame.load(&rdi, ValueType::I16).unwrap(), Value::I16(-3));
    }

    #[test]
    fn test_stack_slots_grow_the_area() {
        let mut frame = NativeFrame::new();
        let slot = VMStorage::stack(8, 8);
        frame.store(&slot, ValueType::F32, &Value::F32(2.5)).unwrap();
        assert_eq!(frame.stack().len(), 16);
        assert_eq!(frame.load(&slot, ValueType::F32).unwrap(), Value::F32(2.5));
        assert!(frame.load(&VMStorage::stack(16, 8), ValueType::I64).is_err());
    }

    #[test]
    fn test_packed_stack_slot_writes_its_width() {
        let mut frame = NativeFrame::new();
        frame.store(&VMStorage::stack(0, 4), ValueType::I32, &Value::I32(-1)).unwrap();
        frame.store(&VMStorage::stack(4, 1), ValueType::I8, &Value::I8(7)).unwrap();
        assert_eq!(frame.stack(), &[0xff, 0xff, 0xff, 0xff, 7]);
    }

    #[test]
    fn test_symbol_reports_fault() {
        let symbol = NativeSymbol::new("fails", |_| Err(NativeFault::new(22, "EINVAL")));
        let err = symbol.call(&mut NativeFrame::new()).unwrap_err();
        assert_eq!(err.code, 22);
        assert_eq!(symbol.name(), "fails");
    }
}
