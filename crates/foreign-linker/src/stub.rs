//! Stub strategy selection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::calling_sequence::CallingSequence;
use crate::frame::{NativeFrame, NativeSymbol};
use crate::interpret;
use crate::recipe::CompactRecipe;
use crate::shuffle::ShuffledStub;
use crate::specialize::{SpecializedStub, specialize};
use crate::upcall::UpcallTarget;
use crate::value::Value;
use crate::{Error, Result};

/// How a handle or stub executes its calling sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StubStrategy {
    /// Register shuffle if possible, else a specialized stub, else the interpreter.
    #[default]
    Auto,
    Specialized,
    Interpreted,
    /// Register shuffle.
    Direct,
    /// Compact recipe run by the universal invoker.
    Universal,
}

impl StubStrategy {
    pub const ALL: [StubStrategy; 5] = [
        StubStrategy::Auto,
        StubStrategy::Specialized,
        StubStrategy::Interpreted,
        StubStrategy::Direct,
        StubStrategy::Universal,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Specialized => "specialized",
            Self::Interpreted => "interpreted",
            Self::Direct => "direct",
            Self::Universal => "universal",
        }
    }
}

impl fmt::Display for StubStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StubStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown stub strategy `{s}`")))
    }
}

/// The compiled form of a calling sequence.
pub(crate) enum Backend {
    Interpreted,
    Specialized(SpecializedStub),
    Direct(ShuffledStub),
    Universal(CompactRecipe),
}

impl Backend {
    /// Compiles `sequence` with `strategy`, falling back to the specializer and
    /// then the interpreter when a form rejects the sequence.
    pub(crate) fn select(sequence: &Arc<CallingSequence>, strategy: StubStrategy) -> Backend {
        let fast = match strategy {
            StubStrategy::Interpreted => return Backend::Interpreted,
            StubStrategy::Specialized => None,
            StubStrategy::Auto | StubStrategy::Direct => {
                Some(ShuffledStub::new(Arc::clone(sequence)).map(Backend::Direct))
            }
            StubStrategy::Universal => {
                Some(CompactRecipe::new(Arc::clone(sequence)).map(Backend::Universal))
            }
        };
        match fast {
            Some(Ok(backend)) => return backend,
            Some(Err(error)) => fallback(sequence, strategy, &error),
            None => {}
        }
        match specialize(Arc::clone(sequence)) {
            Ok(stub) => Backend::Specialized(stub),
            Err(error) => {
                fallback(sequence, strategy, &error);
                Backend::Interpreted
            }
        }
    }

    pub(crate) fn strategy(&self) -> StubStrategy {
        match self {
            Backend::Interpreted => StubStrategy::Interpreted,
            Backend::Specialized(_) => StubStrategy::Specialized,
            Backend::Direct(_) => StubStrategy::Direct,
            Backend::Universal(_) => StubStrategy::Universal,
        }
    }

    pub(crate) fn invoke_downcall(
        &self,
        sequence: &CallingSequence,
        target: &NativeSymbol,
        args: &[Value],
    ) -> Result<Option<Value>> {
        match self {
            Backend::Interpreted => interpret::invoke_downcall(sequence, target, args),
            Backend::Specialized(stub) => stub.invoke_downcall(target, args),
            Backend::Direct(stub) => stub.invoke_downcall(target, args),
            Backend::Universal(recipe) => recipe.invoke_downcall(target, args),
        }
    }

    pub(crate) fn invoke_upcall(
        &self,
        sequence: &CallingSequence,
        target: &UpcallTarget,
        frame: &mut NativeFrame,
    ) -> Result<()> {
        match self {
            Backend::Interpreted => interpret::invoke_upcall(sequence, target, frame),
            Backend::Specialized(stub) => stub.invoke_upcall(target, frame),
            Backend::Direct(stub) => stub.invoke_upcall(target, frame),
            Backend::Universal(recipe) => recipe.invoke_upcall(target, frame),
        }
    }
}

fn fallback(sequence: &CallingSequence, strategy: StubStrategy, error: &Error) {
    if strategy == StubStrategy::Auto {
        tracing::debug!(signature = %sequence.signature(), %error, "falling back");
    } else {
        tracing::warn!(
            signature = %sequence.signature(),
            %strategy,
            %error,
            "requested stub strategy unavailable, falling back"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::calling_sequence::Direction;
    use crate::classify::classify;
    use crate::layout::{FunctionType, TypeLayout};

    fn selected(sig: &FunctionType, strategy: StubStrategy) -> StubStrategy {
        let seq = Arc::new(classify(sig, Abi::SysV, Direction::Downcall).unwrap());
        Backend::select(&seq, strategy).strategy()
    }

    #[test]
    fn test_fallback_chain() {
        let scalars = FunctionType::returning([TypeLayout::I32, TypeLayout::F64], TypeLayout::I64);
        assert_eq!(selected(&scalars, StubStrategy::Auto), StubStrategy::Direct);
        assert_eq!(selected(&scalars, StubStrategy::Universal), StubStrategy::Universal);
        assert_eq!(selected(&scalars, StubStrategy::Interpreted), StubStrategy::Interpreted);

        let big = TypeLayout::structure(vec![TypeLayout::I64; 4]);
        let composite = FunctionType::returning([big.clone()], big);
        assert_eq!(selected(&composite, StubStrategy::Auto), StubStrategy::Specialized);
        assert_eq!(selected(&composite, StubStrategy::Universal), StubStrategy::Specialized);

        let many = FunctionType::void(vec![TypeLayout::I64; 200]);
        assert_eq!(selected(&many, StubStrategy::Direct), StubStrategy::Interpreted);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("universal".parse::<StubStrategy>().unwrap(), StubStrategy::Universal);
        assert!("jit".parse::<StubStrategy>().is_err());
    }
}
