//! System V x86-64.
//!
//! - Integer arguments in RDI, RSI, RDX, RCX, R8, R9; vector arguments in XMM0-XMM7.
//! - Returns in RAX/RDX (integer) or XMM0/XMM1 (vector).
//! - Composites up to 16 bytes are split into eightbytes classified INTEGER or SSE;
//!   larger ones are MEMORY: copied onto the stack, or returned through a hidden
//!   pointer in RDI.
//! - Variadic calls receive the number of vector registers used in AL.

use super::{AbiDescriptor, Arranger, Chunk, Placement, ReturnPlacement, StackCursor, eightbytes, scalar_type};
use crate::abi::Abi;
use crate::layout::TypeLayout;
use crate::storage::{StorageClass, VMStorage};
use crate::value::ValueType;
use crate::{Error, Result};

const fn gpr(index: u32, name: &'static str) -> VMStorage {
    VMStorage::register(StorageClass::Integer, index, 8, name)
}

const fn xmm(index: u32, name: &'static str) -> VMStorage {
    VMStorage::register(StorageClass::Vector, index, 16, name)
}

pub(super) const RAX: VMStorage = gpr(0, "rax");
pub(super) const RCX: VMStorage = gpr(1, "rcx");
pub(super) const RDX: VMStorage = gpr(2, "rdx");
const RSI: VMStorage = gpr(6, "rsi");
const RDI: VMStorage = gpr(7, "rdi");
pub(super) const R8: VMStorage = gpr(8, "r8");
pub(super) const R9: VMStorage = gpr(9, "r9");

pub(super) const XMM: [VMStorage; 8] = [
    xmm(0, "xmm0"),
    xmm(1, "xmm1"),
    xmm(2, "xmm2"),
    xmm(3, "xmm3"),
    xmm(4, "xmm4"),
    xmm(5, "xmm5"),
    xmm(6, "xmm6"),
    xmm(7, "xmm7"),
];

pub const SYSV_INTEGER_ARGS: [VMStorage; 6] = [RDI, RSI, RDX, RCX, R8, R9];
pub const SYSV_VECTOR_ARGS: [VMStorage; 8] = XMM;

pub(super) const ST0: VMStorage = VMStorage::register(StorageClass::X87, 0, 16, "st0");
pub(super) const ST1: VMStorage = VMStorage::register(StorageClass::X87, 1, 16, "st1");

pub(super) fn descriptor() -> AbiDescriptor {
    AbiDescriptor {
        abi: Abi::SysV,
        integer_args: SYSV_INTEGER_ARGS.to_vec(),
        vector_args: SYSV_VECTOR_ARGS.to_vec(),
        integer_returns: vec![RAX, RDX],
        vector_returns: vec![XMM[0].clone(), XMM[1].clone()],
        x87_returns: vec![ST0, ST1],
        return_buffer: RDI,
        return_buffer_result: Some(RAX),
        vector_count: Some(RAX),
        register_composite_limit: 16,
        stack_alignment: 16,
        shadow_space: 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EightbyteClass {
    Integer,
    Sse,
}

/// Classifies each eightbyte of a composite of at most 16 bytes.
fn classify_eightbytes(layout: &TypeLayout) -> Vec<EightbyteClass> {
    let mut classes = vec![None; layout.size().div_ceil(8) as usize];
    for field in layout.flatten() {
        let slot = &mut classes[(field.offset / 8) as usize];
        *slot = match (*slot, field.float) {
            (Some(EightbyteClass::Integer), _) | (_, None) => Some(EightbyteClass::Integer),
            (_, Some(_)) => Some(EightbyteClass::Sse),
        };
    }
    // Eightbytes made only of padding travel as INTEGER.
    classes
        .into_iter()
        .map(|c| c.unwrap_or(EightbyteClass::Integer))
        .collect()
}

fn sse_type(width: u64) -> ValueType {
    if width <= 4 { ValueType::F32 } else { ValueType::F64 }
}

pub(super) struct SysVArranger {
    desc: &'static AbiDescriptor,
    next_int: usize,
    next_vec: usize,
    stack: StackCursor,
    variadic: bool,
}

impl SysVArranger {
    pub(super) fn new(desc: &'static AbiDescriptor) -> Self {
        Self {
            desc,
            next_int: 0,
            next_vec: 0,
            stack: StackCursor::default(),
            variadic: false,
        }
    }

    fn take(&mut self, class: StorageClass) -> Option<VMStorage> {
        let (regs, next) = match class {
            StorageClass::Vector => (&self.desc.vector_args, &mut self.next_vec),
            _ => (&self.desc.integer_args, &mut self.next_int),
        };
        let reg = regs.get(*next).cloned();
        if reg.is_some() {
            *next += 1;
        }
        reg
    }

    /// Register chunks for a small composite, given the registers of each class.
    fn register_chunks(
        layout: &TypeLayout,
        mut ints: impl Iterator<Item = VMStorage>,
        mut vecs: impl Iterator<Item = VMStorage>,
    ) -> Option<Vec<Chunk>> {
        let classes = classify_eightbytes(layout);
        eightbytes(layout.size())
            .zip(classes)
            .map(|((offset, width), class)| {
                let (storage, ty) = match class {
                    EightbyteClass::Integer => (ints.next()?, ValueType::integer_for_size(width)),
                    EightbyteClass::Sse => (vecs.next()?, sse_type(width)),
                };
                Some(Chunk {
                    storage,
                    offset,
                    ty,
                    width,
                })
            })
            .collect()
    }
}

impl Arranger for SysVArranger {
    fn arrange_return(&mut self, layout: Option<&TypeLayout>) -> Result<ReturnPlacement> {
        let Some(layout) = layout else {
            return Ok(ReturnPlacement::Void);
        };
        let placement = match layout {
            TypeLayout::Address(_) => Placement::Address { storage: RAX },
            TypeLayout::Scalar(kind) => Placement::Scalar {
                storages: vec![if kind.is_float() { XMM[0].clone() } else { RAX }],
                ty: kind.carrier(),
            },
            composite if composite.size() <= self.desc.register_composite_limit => {
                let chunks = Self::register_chunks(
                    composite,
                    self.desc.integer_returns.iter().cloned(),
                    self.desc.vector_returns.iter().cloned(),
                )
                .ok_or_else(|| Error::Internal("return registers exhausted".into()))?;
                Placement::Chunks(chunks)
            }
            _ => {
                let buffer = self
                    .take(StorageClass::Integer)
                    .ok_or_else(|| Error::Internal("no register for the return buffer".into()))?;
                return Ok(ReturnPlacement::InMemory {
                    buffer,
                    result: self.desc.return_buffer_result.clone(),
                });
            }
        };
        Ok(ReturnPlacement::Value(placement))
    }

    fn arrange_param(&mut self, layout: &TypeLayout, variadic: bool) -> Result<Placement> {
        self.variadic |= variadic;
        if let TypeLayout::Address(_) = layout {
            let storage = match self.take(StorageClass::Integer) {
                Some(reg) => reg,
                None => self.stack.next(8, 8)?,
            };
            return Ok(Placement::Address { storage });
        }
        if let Some(ty) = scalar_type(layout) {
            let class = if ty.is_float() {
                StorageClass::Vector
            } else {
                StorageClass::Integer
            };
            let storage = match self.take(class) {
                Some(reg) => reg,
                None => self.stack.next(8, 8)?,
            };
            return Ok(Placement::Scalar {
                storages: vec![storage],
                ty,
            });
        }
        if layout.size() > self.desc.register_composite_limit {
            return self.stack.composite(layout);
        }
        let classes = classify_eightbytes(layout);
        let needed_int = classes.iter().filter(|c| **c == EightbyteClass::Integer).count();
        let needed_vec = classes.len() - needed_int;
        let fits = self.next_int + needed_int <= self.desc.integer_args.len()
            && self.next_vec + needed_vec <= self.desc.vector_args.len();
        if !fits {
            return self.stack.composite(layout);
        }
        let ints = self.desc.integer_args[self.next_int..self.next_int + needed_int].to_vec();
        let vecs = self.desc.vector_args[self.next_vec..self.next_vec + needed_vec].to_vec();
        self.next_int += needed_int;
        self.next_vec += needed_vec;
        let chunks = Self::register_chunks(layout, ints.into_iter(), vecs.into_iter())
            .ok_or_else(|| Error::Internal("eightbyte register count mismatch".into()))?;
        Ok(Placement::Chunks(chunks))
    }

    fn vector_count(&self) -> Option<(VMStorage, u64)> {
        if self.variadic {
            self.desc
                .vector_count
                .clone()
                .map(|reg| (reg, self.next_vec as u64))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eightbyte_classes() {
        let mixed = TypeLayout::structure([TypeLayout::F32, TypeLayout::I32, TypeLayout::F64]);
        assert_eq!(
            classify_eightbytes(&mixed),
            vec![EightbyteClass::Integer, EightbyteClass::Sse]
        );
        let floats = TypeLayout::structure([TypeLayout::F32, TypeLayout::F32]);
        assert_eq!(classify_eightbytes(&floats), vec![EightbyteClass::Sse]);
    }

    #[test]
    fn test_small_composite_all_or_nothing() {
        let mut arranger = SysVArranger::new(Abi::SysV.descriptor());
        for _ in 0..5 {
            arranger.arrange_param(&TypeLayout::I64, false).unwrap();
        }
        let pair = TypeLayout::structure([TypeLayout::I64, TypeLayout::I64]);
        let Placement::Chunks(chunks) = arranger.arrange_param(&pair, false).unwrap() else {
            panic!("expected chunks");
        };
        assert!(chunks.iter().all(|c| c.storage.class() == StorageClass::Stack));
        // r9 is still free for a following scalar.
        let Placement::Scalar { storages, .. } = arranger.arrange_param(&TypeLayout::I32, false).unwrap() else {
            panic!("expected scalar");
        };
        assert_eq!(storages, vec![R9]);
    }
}
