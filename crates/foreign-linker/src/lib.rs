#![allow(
    clippy::cast_possible_truncation, // register words are narrowed to the value's own width
    clippy::cast_possible_wrap, // raw addresses travel as i64 carriers
    clippy::cast_sign_loss, // and come back as u64
    clippy::missing_errors_doc
)]

pub mod abi;
pub mod binding;
pub mod calling_sequence;
pub mod classify;
pub mod downcall;
pub mod error;
pub mod frame;
pub mod interpret;
pub mod layout;
pub mod linker;
pub mod memory;
pub mod recipe;
pub mod shuffle;
pub mod specialize;
pub mod storage;
pub mod stub;
pub mod upcall;
pub mod value;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use abi::Abi;
pub use binding::Binding;
pub use calling_sequence::{CallingSequence, Direction};
pub use classify::{CallingSequenceBuilder, classify};
pub use downcall::DowncallHandle;
pub use error::{Error, Result};
pub use frame::{NativeFault, NativeFrame, NativeSymbol};
pub use layout::{FunctionType, TypeLayout};
pub use linker::{CacheStats, Linker, LinkerConfig};
pub use memory::{Arena, Segment};
pub use stub::StubStrategy;
pub use upcall::{UpcallStub, UpcallTarget, invoke_entry_point};
pub use value::{Address, MethodType, Value, ValueType};
