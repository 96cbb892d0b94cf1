//! The immutable per-signature call plan.

use std::fmt;
use std::sync::Arc;

use crate::abi::Abi;
use crate::binding::{Binding, Mode, ProgramDisplay, verify};
use crate::layout::FunctionType;
use crate::storage::{Argument, StorageClassification};
use crate::value::ValueType;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Managed code calling native code.
    Downcall,
    /// Native code calling back into managed code.
    Upcall,
}

impl Direction {
    /// Mode of the argument programs.
    #[must_use]
    pub const fn argument_mode(self) -> Mode {
        match self {
            Self::Downcall => Mode::Unbox,
            Self::Upcall => Mode::Box,
        }
    }

    /// Mode of the return program.
    #[must_use]
    pub const fn return_mode(self) -> Mode {
        match self {
            Self::Downcall => Mode::Box,
            Self::Upcall => Mode::Unbox,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Downcall => "downcall",
            Self::Upcall => "upcall",
        })
    }
}

/// What a native argument carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentRole {
    /// The caller-visible parameter with this index.
    Parameter(usize),
    /// Pointer to the in-memory return buffer.
    ReturnBuffer,
    /// Number of vector registers used by a variadic call.
    VectorRegisterCount(u64),
}

/// Binding program of one native argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentProgram {
    pub role: ArgumentRole,
    pub argument: Arc<Argument>,
    /// High-level type entering (downcall) or leaving (upcall) the program.
    pub carrier: ValueType,
    pub program: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingSequence {
    pub(crate) abi: Abi,
    pub(crate) direction: Direction,
    pub(crate) signature: FunctionType,
    pub(crate) arguments: Vec<ArgumentProgram>,
    pub(crate) return_program: Vec<Binding>,
    pub(crate) return_carrier: Option<ValueType>,
    pub(crate) needs_return_buffer: bool,
    pub(crate) return_buffer_size: u64,
    pub(crate) return_buffer_align: u64,
    pub(crate) scratch_size: u64,
    pub(crate) scratch_align: u64,
    pub(crate) classification: StorageClassification,
}

impl CallingSequence {
    #[must_use]
    pub const fn abi(&self) -> Abi {
        self.abi
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn signature(&self) -> &FunctionType {
        &self.signature
    }

    /// Argument programs in native order, hidden arguments included.
    #[must_use]
    pub fn arguments(&self) -> &[ArgumentProgram] {
        &self.arguments
    }

    #[must_use]
    pub fn return_program(&self) -> &[Binding] {
        &self.return_program
    }

    /// Type of the value the return program consumes (upcall) or produces (downcall).
    #[must_use]
    pub const fn return_carrier(&self) -> Option<ValueType> {
        self.return_carrier
    }

    #[must_use]
    pub const fn needs_return_buffer(&self) -> bool {
        self.needs_return_buffer
    }

    #[must_use]
    pub const fn return_buffer_size(&self) -> u64 {
        self.return_buffer_size
    }

    #[must_use]
    pub const fn return_buffer_align(&self) -> u64 {
        self.return_buffer_align
    }

    /// Bytes of call-scoped scratch memory one call needs.
    #[must_use]
    pub const fn scratch_allocation_size(&self) -> u64 {
        self.scratch_size
    }

    #[must_use]
    pub const fn scratch_allocation_align(&self) -> u64 {
        self.scratch_align
    }

    #[must_use]
    pub const fn classification(&self) -> &StorageClassification {
        &self.classification
    }

    /// Number of caller-visible parameters.
    #[must_use]
    pub fn caller_arity(&self) -> usize {
        self.signature.params().len()
    }

    /// The carrier type a managed implementation of this signature sees.
    #[must_use]
    pub fn caller_type(&self) -> crate::value::MethodType {
        self.signature.carrier_type()
    }

    /// Symbolically verifies every program.
    pub fn verify(&self) -> Result<()> {
        for arg in &self.arguments {
            verify(&arg.program, self.direction.argument_mode(), Some(arg.carrier))?;
        }
        verify(
            &self.return_program,
            self.direction.return_mode(),
            self.return_carrier,
        )
    }
}

impl fmt::Display for CallingSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} on {}", self.direction, self.signature, self.abi)?;
        for arg in &self.arguments {
            let role = match arg.role {
                ArgumentRole::Parameter(i) => format!("arg {i}"),
                ArgumentRole::ReturnBuffer => "return buffer".to_owned(),
                ArgumentRole::VectorRegisterCount(n) => format!("vector count = {n}"),
            };
            writeln!(f, "  {role:<16} {}", ProgramDisplay(&arg.program))?;
        }
        writeln!(f, "  {:<16} {}", "return", ProgramDisplay(&self.return_program))?;
        if self.needs_return_buffer {
            writeln!(
                f,
                "  return buffer: {} bytes, align {}",
                self.return_buffer_size, self.return_buffer_align
            )?;
        }
        write!(f, "  scratch: {} bytes", self.scratch_size)
    }
}
