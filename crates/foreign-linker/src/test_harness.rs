//! Test harness for foreign-linker tests
//!
//! This module provides pattern matchers over binding programs and a few
//! canned native functions. It is only available when running tests or when
//! the `test-harness` feature is enabled.
//!
//! # Example
//!
//! ```rust
//! use foreign_linker::test_harness::*;
//! use foreign_linker::value::ValueType;
//!
//! let seq = downcall_sequence("(i32) -> void", "sysv").expect("classify");
//! assert_matches(
//!     &seq.arguments()[0].program,
//!     &[BindingPattern::VmStore {
//!         storage: Pat::Exact("rdi".into()),
//!         ty: Pat::Exact(ValueType::I32),
//!     }],
//! );
//! ```

#![allow(
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc
)]

use crate::abi::Abi;
use crate::binding::Binding;
use crate::calling_sequence::{CallingSequence, Direction};
use crate::classify::classify;
use crate::frame::{NativeFault, NativeFrame, NativeSymbol};
use crate::layout::FunctionType;
use crate::value::ValueType;
use crate::Result;

/// Parse a signature and ABI name and classify them as a downcall
pub fn downcall_sequence(signature: &str, abi: &str) -> Result<CallingSequence> {
    let signature: FunctionType = signature.parse()?;
    classify(&signature, abi.parse::<Abi>()?, Direction::Downcall)
}

/// Parse a signature and ABI name and classify them as an upcall
pub fn upcall_sequence(signature: &str, abi: &str) -> Result<CallingSequence> {
    let signature: FunctionType = signature.parse()?;
    classify(&signature, abi.parse::<Abi>()?, Direction::Upcall)
}

/// Pattern matching for binding fields
#[derive(Debug, Clone)]
pub enum Pat<T> {
    /// Match any value
    Any,
    /// Match exact value
    Exact(T),
    /// Match if value satisfies predicate
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    /// Check if a value matches this pattern
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(pred) => pred(value),
        }
    }
}

/// Pattern for matching binding operators in tests
///
/// Storages are matched by their debug name (`"rdi"`, `"xmm0"`, `"stack[8]"`).
#[derive(Debug, Clone)]
pub enum BindingPattern {
    /// Match any operator
    Any,
    VmStore {
        storage: Pat<String>,
        ty: Pat<ValueType>,
    },
    VmLoad {
        storage: Pat<String>,
        ty: Pat<ValueType>,
    },
    BufferStore {
        offset: Pat<u64>,
        ty: Pat<ValueType>,
        size: Pat<u64>,
    },
    BufferLoad {
        offset: Pat<u64>,
        ty: Pat<ValueType>,
        size: Pat<u64>,
    },
    Copy {
        size: Pat<u64>,
    },
    Allocate {
        size: Pat<u64>,
    },
    BoxAddress {
        size: Pat<u64>,
    },
    UnboxAddress,
    ToSegment {
        size: Pat<u64>,
    },
    Dup,
}

impl BindingPattern {
    /// `vm_store` into the named storage with an exact type
    pub fn store(storage: &str, ty: ValueType) -> Self {
        Self::VmStore {
            storage: Pat::Exact(storage.to_owned()),
            ty: Pat::Exact(ty),
        }
    }

    /// `vm_load` from the named storage with an exact type
    pub fn load(storage: &str, ty: ValueType) -> Self {
        Self::VmLoad {
            storage: Pat::Exact(storage.to_owned()),
            ty: Pat::Exact(ty),
        }
    }

    /// Check if a binding matches this pattern
    pub fn matches(&self, binding: &Binding) -> bool {
        use BindingPattern as P;

        match (self, binding) {
            (P::Any, _) => true,
            (P::UnboxAddress, Binding::UnboxAddress) => true,
            (P::Dup, Binding::Dup) => true,
            (P::VmStore { storage: s, ty: t }, Binding::VmStore { storage, ty })
            | (P::VmLoad { storage: s, ty: t }, Binding::VmLoad { storage, ty }) => {
                s.matches(&storage.debug_name().to_owned()) && t.matches(ty)
            }
            (
                P::BufferStore {
                    offset: o,
                    ty: t,
                    size: z,
                },
                Binding::BufferStore { offset, ty, size },
            )
            | (
                P::BufferLoad {
                    offset: o,
                    ty: t,
                    size: z,
                },
                Binding::BufferLoad { offset, ty, size },
            ) => o.matches(offset) && t.matches(ty) && z.matches(size),
            (P::Copy { size: z }, Binding::Copy { size, .. })
            | (P::Allocate { size: z }, Binding::Allocate { size, .. })
            | (P::BoxAddress { size: z }, Binding::BoxAddress { size })
            | (P::ToSegment { size: z }, Binding::ToSegment { size }) => z.matches(size),
            _ => false,
        }
    }
}

/// Find a pattern in a binding program
///
/// Returns the index of the first match, or None if not found
pub fn find_pattern(program: &[Binding], pattern: &[BindingPattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }

    'outer: for start in 0..=program.len().saturating_sub(pattern.len()) {
        for (i, pat) in pattern.iter().enumerate() {
            match program.get(start + i) {
                Some(binding) if pat.matches(binding) => {}
                _ => continue 'outer,
            }
        }
        return Some(start);
    }
    None
}

/// Assert that a binding program contains a pattern
pub fn assert_has_pattern(program: &[Binding], pattern: &[BindingPattern]) {
    if find_pattern(program, pattern).is_none() {
        panic!(
            "Pattern not found in binding program.\n\nExpected pattern:\n{}\n\nActual program:\n{}",
            format_patterns(pattern),
            format_program(program)
        );
    }
}

/// Assert that a binding program matches a pattern exactly
pub fn assert_matches(program: &[Binding], pattern: &[BindingPattern]) {
    if program.len() != pattern.len() {
        panic!(
            "Binding count mismatch: expected {}, got {}.\n\nExpected pattern:\n{}\n\nActual program:\n{}",
            pattern.len(),
            program.len(),
            format_patterns(pattern),
            format_program(program)
        );
    }

    for (i, (binding, pat)) in program.iter().zip(pattern).enumerate() {
        if !pat.matches(binding) {
            panic!(
                "Binding mismatch at index {i}:\nExpected: {pat:?}\nActual:   {binding}\n\nFull program:\n{}",
                format_program(program)
            );
        }
    }
}

fn format_patterns(patterns: &[BindingPattern]) -> String {
    patterns
        .iter()
        .map(|p| format!("  {p:?}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_program(program: &[Binding]) -> String {
    program
        .iter()
        .map(|b| format!("  {b}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Count operators with the given name (`"vm_store"`, `"dup"`, ...)
pub fn count_binding(program: &[Binding], name: &str) -> usize {
    program.iter().filter(|b| b.name() == name).count()
}

/// Names of the storages a program writes, in order
pub fn stored_storages(program: &[Binding]) -> Vec<String> {
    program
        .iter()
        .filter_map(|b| match b {
            Binding::VmStore { storage, .. } => Some(storage.debug_name().to_owned()),
            _ => None,
        })
        .collect()
}

/// A native function that does nothing
pub fn noop_native() -> NativeSymbol {
    NativeSymbol::new("noop", |_| Ok(()))
}

/// A native function that always faults with `code`
pub fn failing_native(code: i32) -> NativeSymbol {
    NativeSymbol::new("failing", move |_| Err(NativeFault::new(code, "canned failure")))
}

/// A native function that records the frame it was called with
pub fn recording_native(
    sink: std::sync::Arc<std::sync::Mutex<Vec<NativeFrame>>>,
) -> NativeSymbol {
    NativeSymbol::new("recording", move |frame| {
        sink.lock()
            .map_err(|_| NativeFault::new(-1, "poisoned"))?
            .push(frame.clone());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_search() {
        let seq = downcall_sequence("({i64, f64}) -> void", "sysv").unwrap();
        let program = &seq.arguments()[0].program;
        assert_has_pattern(
            program,
            &[
                BindingPattern::BufferLoad {
                    offset: Pat::Exact(8),
                    ty: Pat::Exact(ValueType::F64),
                    size: Pat::Any,
                },
                BindingPattern::store("xmm0", ValueType::F64),
            ],
        );
        assert_eq!(count_binding(program, "dup"), 1);
        assert_eq!(stored_storages(program), ["rdi", "xmm0"]);
    }
}
