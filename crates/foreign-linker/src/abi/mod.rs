//! Platform ABI catalogs and argument placement.
//!
//! Each supported ABI has a read-only [`AbiDescriptor`] listing its argument and
//! return registers. The descriptors are built once per process. Placement of a
//! concrete signature is done by a per-ABI [`Arranger`], which walks the return
//! value and then each parameter, handing out registers and stack slots.

mod aarch64;
mod sysv;
mod windows;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::layout::{ScalarKind, TypeLayout, align_up};
use crate::storage::VMStorage;
use crate::value::ValueType;
use crate::{Error, Result};

pub use aarch64::{AARCH64_INTEGER_ARGS, AARCH64_VECTOR_ARGS};
pub use sysv::{SYSV_INTEGER_ARGS, SYSV_VECTOR_ARGS};
pub use windows::WIN64_INTEGER_ARGS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Abi {
    SysV,
    Win64,
    Aarch64Linux,
    Aarch64MacOs,
}

impl Abi {
    pub const ALL: [Abi; 4] = [Abi::SysV, Abi::Win64, Abi::Aarch64Linux, Abi::Aarch64MacOs];

    /// The ABI of the machine this crate was built for, falling back to SysV.
    #[must_use]
    pub const fn host() -> Abi {
        if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            Abi::Aarch64MacOs
        } else if cfg!(target_arch = "aarch64") {
            Abi::Aarch64Linux
        } else if cfg!(all(target_arch = "x86_64", target_os = "windows")) {
            Abi::Win64
        } else {
            Abi::SysV
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Abi::SysV => "sysv",
            Abi::Win64 => "win64",
            Abi::Aarch64Linux => "aarch64-linux",
            Abi::Aarch64MacOs => "aarch64-macos",
        }
    }

    #[must_use]
    pub fn descriptor(self) -> &'static AbiDescriptor {
        ProcessWideAbiTables::get().descriptor(self)
    }

    pub(crate) fn arranger(self) -> Box<dyn Arranger> {
        let desc = self.descriptor();
        match self {
            Abi::SysV => Box::new(sysv::SysVArranger::new(desc)),
            Abi::Win64 => Box::new(windows::Win64Arranger::new(desc)),
            Abi::Aarch64Linux => Box::new(aarch64::Aarch64Arranger::new(desc, false)),
            Abi::Aarch64MacOs => Box::new(aarch64::Aarch64Arranger::new(desc, true)),
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Abi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sysv" | "x86_64-sysv" => Ok(Abi::SysV),
            "win64" | "x86_64-windows" => Ok(Abi::Win64),
            "aarch64-linux" | "aapcs64" => Ok(Abi::Aarch64Linux),
            "aarch64-macos" => Ok(Abi::Aarch64MacOs),
            other => Err(Error::InvalidArgument(format!("unknown ABI `{other}`"))),
        }
    }
}

/// Register catalog of one ABI.
#[derive(Debug, Clone)]
pub struct AbiDescriptor {
    pub abi: Abi,
    pub integer_args: Vec<VMStorage>,
    pub vector_args: Vec<VMStorage>,
    pub integer_returns: Vec<VMStorage>,
    pub vector_returns: Vec<VMStorage>,
    pub x87_returns: Vec<VMStorage>,
    /// Register that carries the hidden return-buffer pointer into the callee.
    pub return_buffer: VMStorage,
    /// Register in which a callee hands the return-buffer pointer back, if any.
    pub return_buffer_result: Option<VMStorage>,
    /// Register receiving the vector-register count of a variadic call.
    pub vector_count: Option<VMStorage>,
    /// Largest composite passed or returned by value in registers.
    pub register_composite_limit: u64,
    pub stack_alignment: u64,
    /// Bytes the caller reserves above the outgoing arguments for the callee.
    pub shadow_space: u64,
}

/// All ABI descriptors, constructed once and read-only afterwards.
pub struct ProcessWideAbiTables {
    sysv: AbiDescriptor,
    win64: AbiDescriptor,
    aarch64_linux: AbiDescriptor,
    aarch64_macos: AbiDescriptor,
}

static ABI_TABLES: OnceLock<ProcessWideAbiTables> = OnceLock::new();

impl ProcessWideAbiTables {
    pub fn get() -> &'static ProcessWideAbiTables {
        ABI_TABLES.get_or_init(|| ProcessWideAbiTables {
            sysv: sysv::descriptor(),
            win64: windows::descriptor(),
            aarch64_linux: aarch64::descriptor(Abi::Aarch64Linux),
            aarch64_macos: aarch64::descriptor(Abi::Aarch64MacOs),
        })
    }

    #[must_use]
    pub fn descriptor(&self, abi: Abi) -> &AbiDescriptor {
        match abi {
            Abi::SysV => &self.sysv,
            Abi::Win64 => &self.win64,
            Abi::Aarch64Linux => &self.aarch64_linux,
            Abi::Aarch64MacOs => &self.aarch64_macos,
        }
    }
}

/// One register-sized piece of a composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub storage: VMStorage,
    pub offset: u64,
    pub ty: ValueType,
    pub width: u64,
}

/// Where one value lives, before binding programs are synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Placement {
    /// A scalar in one storage, or several when it must be duplicated.
    Scalar { storages: Vec<VMStorage>, ty: ValueType },
    Address { storage: VMStorage },
    /// A composite split across registers or stack slots.
    Chunks(Vec<Chunk>),
    /// A composite passed as a pointer to a private copy.
    Reference { storage: VMStorage },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReturnPlacement {
    Void,
    Value(Placement),
    InMemory {
        buffer: VMStorage,
        result: Option<VMStorage>,
    },
}

pub(crate) trait Arranger {
    /// Places the return value. Must be called before any parameter.
    fn arrange_return(&mut self, layout: Option<&TypeLayout>) -> Result<ReturnPlacement>;

    fn arrange_param(&mut self, layout: &TypeLayout, variadic: bool) -> Result<Placement>;

    /// Hidden vector-count argument of a variadic call, once all parameters are placed.
    fn vector_count(&self) -> Option<(VMStorage, u64)> {
        None
    }
}

/// Hands out outgoing stack slots in increasing offset order.
#[derive(Debug, Default)]
pub(crate) struct StackCursor {
    offset: u64,
}

impl StackCursor {
    pub(crate) fn next(&mut self, size: u64, align: u64) -> Result<VMStorage> {
        self.offset = align_up(self.offset, align);
        let overflow = || Error::InvalidSignature("outgoing stack area overflows".into());
        let offset = u32::try_from(self.offset).map_err(|_| overflow())?;
        let width = u32::try_from(size).map_err(|_| overflow())?;
        self.offset = self.offset.checked_add(size).ok_or_else(overflow)?;
        Ok(VMStorage::stack(offset, width))
    }

    pub(crate) fn align_to(&mut self, align: u64) {
        self.offset = align_up(self.offset, align);
    }

    /// Places a composite on the stack as consecutive 8-byte integer chunks.
    pub(crate) fn composite(&mut self, layout: &TypeLayout) -> Result<Placement> {
        self.align_to(layout.align().max(8));
        let chunks = eightbytes(layout.size())
            .map(|(offset, width)| {
                Ok(Chunk {
                    storage: self.next(8, 8)?,
                    offset,
                    ty: ValueType::integer_for_size(width),
                    width,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Placement::Chunks(chunks))
    }
}

/// Splits `size` bytes into `(offset, width)` pieces of at most 8 bytes.
pub(crate) fn eightbytes(size: u64) -> impl Iterator<Item = (u64, u64)> {
    (0..size.div_ceil(8)).map(move |i| (i * 8, (size - i * 8).min(8)))
}

/// Members of a homogeneous floating-point aggregate: 1 to 4 leaves, all of
/// one float kind, tiling the composite exactly.
pub(crate) fn hfa_members(layout: &TypeLayout) -> Option<(ScalarKind, u64)> {
    if !layout.is_composite() || layout.size() > 4 * 8 {
        return None;
    }
    let fields = layout.flatten();
    let kind = fields.first()?.float?;
    let count = fields.len() as u64;
    let homogeneous = fields
        .iter()
        .enumerate()
        .all(|(i, f)| f.float == Some(kind) && f.offset == i as u64 * kind.size());
    (homogeneous && (1..=4).contains(&count) && layout.size() == count * kind.size())
        .then_some((kind, count))
}

pub(crate) fn scalar_type(layout: &TypeLayout) -> Option<ValueType> {
    match layout {
        TypeLayout::Scalar(kind) => Some(kind.carrier()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_names_round_trip() {
        for abi in Abi::ALL {
            assert_eq!(abi.name().parse::<Abi>().unwrap(), abi);
        }
        assert!("mips".parse::<Abi>().is_err());
    }

    #[test]
    fn test_tables_are_built_once() {
        let a: *const AbiDescriptor = Abi::SysV.descriptor();
        let b: *const AbiDescriptor = ProcessWideAbiTables::get().descriptor(Abi::SysV);
        assert_eq!(a, b);
    }

    #[test]
    fn test_eightbytes_split() {
        let pieces: Vec<_> = eightbytes(20).collect();
        assert_eq!(pieces, vec![(0, 8), (8, 8), (16, 4)]);
    }

    #[test]
    fn test_stack_cursor_offsets_stay_in_range() {
        let mut cursor = StackCursor::default();
        assert_eq!(cursor.next(4, 4).unwrap(), VMStorage::stack(0, 4));
        assert_eq!(cursor.next(8, 8).unwrap(), VMStorage::stack(8, 8));

        let mut cursor = StackCursor {
            offset: u64::from(u32::MAX) - 7,
        };
        assert!(cursor.next(8, 8).is_ok());
        let err = cursor.next(8, 8).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)), "{err}");
        assert!(StackCursor::default().next(1 << 32, 8).is_err());
    }

    #[test]
    fn test_hfa_detection() {
        let quad = TypeLayout::structure([TypeLayout::F32; 4]);
        assert_eq!(hfa_members(&quad), Some((ScalarKind::F32, 4)));
        let nested = TypeLayout::structure([
            TypeLayout::F64,
            TypeLayout::structure([TypeLayout::F64, TypeLayout::F64]),
        ]);
        assert_eq!(hfa_members(&nested), Some((ScalarKind::F64, 3)));
        let mixed = TypeLayout::structure([TypeLayout::F32, TypeLayout::F64]);
        assert_eq!(hfa_members(&mixed), None);
        let five = TypeLayout::structure([TypeLayout::F32; 5]);
        assert_eq!(hfa_members(&five), None);
    }
}
