//! Machine storage locations and the per-argument storage assignment.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::layout::TypeLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageClass {
    Integer,
    Vector,
    Stack,
    X87,
}

impl StorageClass {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Vector => "vector",
            Self::Stack => "stack",
            Self::X87 => "x87",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One physical storage location.
///
/// For registers `index` is the hardware register number and `size` the
/// register width in bytes. For stack slots `index` is the byte offset from the
/// start of the outgoing argument area and `size` the slot width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VMStorage {
    class: StorageClass,
    index: u32,
    size: u32,
    debug_name: Cow<'static, str>,
}

impl VMStorage {
    #[must_use]
    pub const fn register(class: StorageClass, index: u32, size: u32, name: &'static str) -> Self {
        Self {
            class,
            index,
            size,
            debug_name: Cow::Borrowed(name),
        }
    }

    #[must_use]
    pub fn stack(offset: u32, size: u32) -> Self {
        Self {
            class: StorageClass::Stack,
            index: offset,
            size,
            debug_name: Cow::Owned(format!("stack[{offset}]")),
        }
    }

    #[must_use]
    pub const fn class(&self) -> StorageClass {
        self.class
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Byte offset of a stack slot. Same as [`VMStorage::index`].
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[must_use]
    pub fn is_register(&self) -> bool {
        self.class != StorageClass::Stack
    }
}

impl fmt::Display for VMStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_name)
    }
}

/// Where an argument sits in the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Position {
    Return,
    Param(usize),
    /// An argument synthesized by the classifier (return buffer, vector count).
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Argument {
    pub position: Position,
    pub layout: TypeLayout,
    pub name: Option<String>,
}

impl Argument {
    #[must_use]
    pub fn param(index: usize, layout: TypeLayout) -> Self {
        Self {
            position: Position::Param(index),
            layout,
            name: None,
        }
    }

    #[must_use]
    pub fn ret(layout: TypeLayout) -> Self {
        Self {
            position: Position::Return,
            layout,
            name: None,
        }
    }

    #[must_use]
    pub fn hidden(name: &str, layout: TypeLayout) -> Self {
        Self {
            position: Position::Hidden,
            layout,
            name: Some(name.to_owned()),
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.position, &self.name) {
            (_, Some(name)) => write!(f, "{name}: {}", self.layout),
            (Position::Return, None) => write!(f, "return: {}", self.layout),
            (Position::Param(i), None) => write!(f, "arg{i}: {}", self.layout),
            (Position::Hidden, None) => write!(f, "hidden: {}", self.layout),
        }
    }
}

/// A storage location holding `argument`'s bytes starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgumentBinding {
    pub storage: VMStorage,
    pub argument: Arc<Argument>,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Argument,
    Return,
}

/// Argument bindings grouped by storage class and side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageClassification {
    groups: BTreeMap<(StorageClass, Side), Vec<ArgumentBinding>>,
}

impl StorageClassification {
    pub fn push(&mut self, side: Side, binding: ArgumentBinding) {
        self.groups
            .entry((binding.storage.class(), side))
            .or_default()
            .push(binding);
    }

    #[must_use]
    pub fn bindings(&self, class: StorageClass, side: Side) -> &[ArgumentBinding] {
        self.groups.get(&(class, side)).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StorageClass, Side, &[ArgumentBinding])> {
        self.groups
            .iter()
            .map(|((class, side), bindings)| (*class, *side, bindings.as_slice()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_equality_is_by_value() {
        let a = VMStorage::stack(16, 8);
        let b = VMStorage::stack(16, 8);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "stack[16]");
        assert_ne!(a, VMStorage::stack(24, 8));
    }

    #[test]
    fn test_classification_groups_by_class() {
        let arg = Arc::new(Argument::param(0, TypeLayout::I32));
        let mut classification = StorageClassification::default();
        classification.push(
            Side::Argument,
            ArgumentBinding {
                storage: VMStorage::register(StorageClass::Integer, 7, 8, "rdi"),
                argument: Arc::clone(&arg),
                offset: 0,
            },
        );
        classification.push(
            Side::Argument,
            ArgumentBinding {
                storage: VMStorage::stack(0, 8),
                argument: arg,
                offset: 0,
            },
        );
        assert_eq!(classification.bindings(StorageClass::Integer, Side::Argument).len(), 1);
        assert_eq!(classification.bindings(StorageClass::Stack, Side::Argument).len(), 1);
        assert!(classification.bindings(StorageClass::Vector, Side::Return).is_empty());
    }
}
