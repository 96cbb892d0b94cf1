//! Binding operators.
//!
//! A binding program is a list of [`Binding`]s run against an operand stack.
//! Unboxing programs start with one high-level value and end empty; boxing
//! programs start empty and end with exactly one value.

mod verify;

use std::fmt;

use crate::storage::VMStorage;
use crate::value::ValueType;

pub use verify::{verify, verify_box, verify_unbox};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Pop a value and write it to `storage`.
    VmStore { storage: VMStorage, ty: ValueType },
    /// Read a value from `storage` and push it.
    VmLoad { storage: VMStorage, ty: ValueType },
    /// Pop a value, then a buffer, and write the low `size` bytes of the value at `offset`.
    BufferStore {
        offset: u64,
        ty: ValueType,
        size: u64,
    },
    /// Pop a buffer and push the `size` bytes at `offset` as a value.
    BufferLoad {
        offset: u64,
        ty: ValueType,
        size: u64,
    },
    /// Pop a buffer and push a fresh copy of its first `size` bytes.
    Copy { size: u64, align: u64 },
    /// Push a zero-filled buffer.
    Allocate { size: u64, align: u64 },
    /// Pop a raw address and push it as an address bounded to `size` bytes.
    BoxAddress { size: u64 },
    /// Pop an addressable value and push its raw address.
    UnboxAddress,
    /// Pop an address and push the buffer it designates.
    ToSegment { size: u64 },
    /// Push a copy of the top of the stack.
    Dup,
}

impl Binding {
    #[must_use]
    pub const fn vm_store(storage: VMStorage, ty: ValueType) -> Self {
        Self::VmStore { storage, ty }
    }

    #[must_use]
    pub const fn vm_load(storage: VMStorage, ty: ValueType) -> Self {
        Self::VmLoad { storage, ty }
    }

    #[must_use]
    pub const fn buffer_store(offset: u64, ty: ValueType, size: u64) -> Self {
        Self::BufferStore { offset, ty, size }
    }

    #[must_use]
    pub const fn buffer_load(offset: u64, ty: ValueType, size: u64) -> Self {
        Self::BufferLoad { offset, ty, size }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VmStore { .. } => "vm_store",
            Self::VmLoad { .. } => "vm_load",
            Self::BufferStore { .. } => "buffer_store",
            Self::BufferLoad { .. } => "buffer_load",
            Self::Copy { .. } => "copy",
            Self::Allocate { .. } => "allocate",
            Self::BoxAddress { .. } => "box_address",
            Self::UnboxAddress => "unbox_address",
            Self::ToSegment { .. } => "to_segment",
            Self::Dup => "dup",
        }
    }

    /// Whether the operator may appear in a program of the given mode.
    #[must_use]
    pub const fn allowed_in(&self, mode: Mode) -> bool {
        match mode {
            Mode::Unbox => matches!(
                self,
                Self::VmStore { .. }
                    | Self::BufferLoad { .. }
                    | Self::Copy { .. }
                    | Self::UnboxAddress
                    | Self::Dup
            ),
            Mode::Box => matches!(
                self,
                Self::VmLoad { .. }
                    | Self::BufferStore { .. }
                    | Self::Allocate { .. }
                    | Self::BoxAddress { .. }
                    | Self::ToSegment { .. }
                    | Self::Dup
            ),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Self::VmStore { storage, ty } | Self::VmLoad { storage, ty } => {
                write!(f, "{name}({storage}, {ty})")
            }
            Self::BufferStore { offset, ty, size } | Self::BufferLoad { offset, ty, size } => {
                write!(f, "{name}({offset}, {ty}, {size})")
            }
            Self::Copy { size, align } | Self::Allocate { size, align } => {
                write!(f, "{name}({size}, {align})")
            }
            Self::BoxAddress { size } | Self::ToSegment { size } => write!(f, "{name}({size})"),
            Self::UnboxAddress | Self::Dup => write!(f, "{name}()"),
        }
    }
}

/// Direction of a binding program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// High-level value to storage.
    Unbox,
    /// Storage to high-level value.
    Box,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unbox => "unbox",
            Self::Box => "box",
        })
    }
}

/// Formats a program as `[op, op, ...]`.
pub struct ProgramDisplay<'a>(pub &'a [Binding]);

impl fmt::Display for ProgramDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, binding) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{binding}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageClass;

    #[test]
    fn test_textual_form() {
        let rdi = VMStorage::register(StorageClass::Integer, 7, 8, "rdi");
        let program = [
            Binding::buffer_load(0, ValueType::I64, 8),
            Binding::vm_store(rdi, ValueType::I64),
        ];
        assert_eq!(
            ProgramDisplay(&program).to_string(),
            "[buffer_load(0, I64, 8), vm_store(rdi, I64)]"
        );
        assert_eq!(Binding::UnboxAddress.to_string(), "unbox_address()");
    }

    #[test]
    fn test_mode_sets_are_disjoint_except_dup() {
        let all = [
            Binding::Copy { size: 1, align: 1 },
            Binding::Allocate { size: 1, align: 1 },
            Binding::BoxAddress { size: 1 },
            Binding::UnboxAddress,
            Binding::ToSegment { size: 1 },
            Binding::buffer_load(0, ValueType::I8, 1),
            Binding::buffer_store(0, ValueType::I8, 1),
            Binding::Dup,
        ];
        for binding in &all {
            let both = binding.allowed_in(Mode::Unbox) && binding.allowed_in(Mode::Box);
            assert_eq!(both, *binding == Binding::Dup, "{binding}");
        }
    }
}
