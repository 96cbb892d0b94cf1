//! AAPCS64, with the Apple variant.
//!
//! Apple differs in two places: scalars spilled to the stack are packed at their
//! natural size and alignment, and every variadic argument goes to the stack in
//! an 8-byte slot.

use super::{
    AbiDescriptor, Arranger, Chunk, Placement, ReturnPlacement, StackCursor, eightbytes,
    hfa_members, scalar_type,
};
use crate::abi::Abi;
use crate::layout::{TypeLayout, align_up};
use crate::storage::{StorageClass, VMStorage};
use crate::value::ValueType;
use crate::{Error, Result};

const fn x(index: u32, name: &'static str) -> VMStorage {
    VMStorage::register(StorageClass::Integer, index, 8, name)
}

const fn v(index: u32, name: &'static str) -> VMStorage {
    VMStorage::register(StorageClass::Vector, index, 16, name)
}

pub const AARCH64_INTEGER_ARGS: [VMStorage; 8] = [
    x(0, "x0"),
    x(1, "x1"),
    x(2, "x2"),
    x(3, "x3"),
    x(4, "x4"),
    x(5, "x5"),
    x(6, "x6"),
    x(7, "x7"),
];

pub const AARCH64_VECTOR_ARGS: [VMStorage; 8] = [
    v(0, "v0"),
    v(1, "v1"),
    v(2, "v2"),
    v(3, "v3"),
    v(4, "v4"),
    v(5, "v5"),
    v(6, "v6"),
    v(7, "v7"),
];

/// Indirect result location register.
const X8: VMStorage = x(8, "x8");

pub(super) fn descriptor(abi: Abi) -> AbiDescriptor {
    AbiDescriptor {
        abi,
        integer_args: AARCH64_INTEGER_ARGS.to_vec(),
        vector_args: AARCH64_VECTOR_ARGS.to_vec(),
        integer_returns: AARCH64_INTEGER_ARGS[..2].to_vec(),
        vector_returns: AARCH64_VECTOR_ARGS[..4].to_vec(),
        x87_returns: Vec::new(),
        return_buffer: X8,
        return_buffer_result: None,
        vector_count: None,
        register_composite_limit: 16,
        stack_alignment: 16,
        shadow_space: 0,
    }
}

pub(super) struct Aarch64Arranger {
    desc: &'static AbiDescriptor,
    apple: bool,
    next_int: usize,
    next_vec: usize,
    stack: StackCursor,
}

impl Aarch64Arranger {
    pub(super) fn new(desc: &'static AbiDescriptor, apple: bool) -> Self {
        Self {
            desc,
            apple,
            next_int: 0,
            next_vec: 0,
            stack: StackCursor::default(),
        }
    }

    fn scalar_stack_slot(&mut self, size: u64) -> Result<VMStorage> {
        if self.apple {
            self.stack.next(size, size)
        } else {
            self.stack.next(8, 8)
        }
    }

    fn hfa_chunks(regs: &[VMStorage], kind_size: u64, ty: ValueType) -> Vec<Chunk> {
        regs.iter()
            .enumerate()
            .map(|(i, storage)| Chunk {
                storage: storage.clone(),
                offset: i as u64 * kind_size,
                ty,
                width: kind_size,
            })
            .collect()
    }

    fn integer_chunks(regs: &[VMStorage], size: u64) -> Vec<Chunk> {
        eightbytes(size)
            .zip(regs)
            .map(|((offset, width), storage)| Chunk {
                storage: storage.clone(),
                offset,
                ty: ValueType::integer_for_size(width),
                width,
            })
            .collect()
    }

    fn variadic_stack(&mut self, layout: &TypeLayout) -> Result<Placement> {
        let storage = self.stack.next(8, 8)?;
        match layout {
            TypeLayout::Address(_) => Ok(Placement::Address { storage }),
            TypeLayout::Scalar(kind) => Ok(Placement::Scalar {
                storages: vec![storage],
                ty: kind.carrier(),
            }),
            other => Err(Error::InvalidSignature(format!(
                "composite `{other}` cannot be passed as a variadic argument"
            ))),
        }
    }
}

impl Arranger for Aarch64Arranger {
    fn arrange_return(&mut self, layout: Option<&TypeLayout>) -> Result<ReturnPlacement> {
        let Some(layout) = layout else {
            return Ok(ReturnPlacement::Void);
        };
        let placement = match layout {
            TypeLayout::Address(_) => Placement::Address {
                storage: self.desc.integer_returns[0].clone(),
            },
            TypeLayout::Scalar(kind) => {
                let regs = if kind.is_float() {
                    &self.desc.vector_returns
                } else {
                    &self.desc.integer_returns
                };
                Placement::Scalar {
                    storages: vec![regs[0].clone()],
                    ty: kind.carrier(),
                }
            }
            composite => {
                if let Some((kind, count)) = hfa_members(composite) {
                    Placement::Chunks(Self::hfa_chunks(
                        &self.desc.vector_returns[..count as usize],
                        kind.size(),
                        kind.carrier(),
                    ))
                } else if composite.size() <= self.desc.register_composite_limit {
                    Placement::Chunks(Self::integer_chunks(
                        &self.desc.integer_returns,
                        composite.size(),
                    ))
                } else {
                    return Ok(ReturnPlacement::InMemory {
                        buffer: self.desc.return_buffer.clone(),
                        result: self.desc.return_buffer_result.clone(),
                    });
                }
            }
        };
        Ok(ReturnPlacement::Value(placement))
    }

    fn arrange_param(&mut self, layout: &TypeLayout, variadic: bool) -> Result<Placement> {
        if variadic && self.apple {
            return self.variadic_stack(layout);
        }
        let int_regs = self.desc.integer_args.len();
        let vec_regs = self.desc.vector_args.len();
        if let TypeLayout::Address(_) = layout {
            let storage = if self.next_int < int_regs {
                self.next_int += 1;
                self.desc.integer_args[self.next_int - 1].clone()
            } else {
                self.scalar_stack_slot(8)?
            };
            return Ok(Placement::Address { storage });
        }
        if let Some(ty) = scalar_type(layout) {
            let (next, count) = if ty.is_float() {
                (&mut self.next_vec, vec_regs)
            } else {
                (&mut self.next_int, int_regs)
            };
            let storage = if *next < count {
                *next += 1;
                let regs = if ty.is_float() {
                    &self.desc.vector_args
                } else {
                    &self.desc.integer_args
                };
                regs[*next - 1].clone()
            } else {
                self.scalar_stack_slot(layout.size())?
            };
            return Ok(Placement::Scalar {
                storages: vec![storage],
                ty,
            });
        }
        if let Some((kind, count)) = hfa_members(layout) {
            let count = count as usize;
            if self.next_vec + count <= vec_regs {
                let regs = &self.desc.vector_args[self.next_vec..self.next_vec + count];
                self.next_vec += count;
                return Ok(Placement::Chunks(Self::hfa_chunks(
                    regs,
                    kind.size(),
                    kind.carrier(),
                )));
            }
            self.next_vec = vec_regs;
            return self.stack.composite(layout);
        }
        if layout.size() > self.desc.register_composite_limit {
            let storage = if self.next_int < int_regs {
                self.next_int += 1;
                self.desc.integer_args[self.next_int - 1].clone()
            } else {
                self.stack.next(8, 8)?
            };
            return Ok(Placement::Reference { storage });
        }
        let mut start = self.next_int;
        if layout.align() == 16 {
            start = align_up(start as u64, 2) as usize;
        }
        let needed = layout.size().div_ceil(8) as usize;
        if start + needed <= int_regs {
            self.next_int = start + needed;
            return Ok(Placement::Chunks(Self::integer_chunks(
                &self.desc.integer_args[start..start + needed],
                layout.size(),
            )));
        }
        self.next_int = int_regs;
        self.stack.composite(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hfa_uses_consecutive_vector_registers() {
        let mut arranger = Aarch64Arranger::new(Abi::Aarch64Linux.descriptor(), false);
        arranger.arrange_param(&TypeLayout::F64, false).unwrap();
        let quad = TypeLayout::structure([TypeLayout::F32; 4]);
        let Placement::Chunks(chunks) = arranger.arrange_param(&quad, false).unwrap() else {
            panic!("expected chunks");
        };
        let names: Vec<&str> = chunks.iter().map(|c| c.storage.debug_name()).collect();
        assert_eq!(names, vec!["v1", "v2", "v3", "v4"]);
        assert!(chunks.iter().all(|c| c.ty == ValueType::F32 && c.width == 4));
    }

    #[test]
    fn test_aligned_composite_starts_at_even_register() {
        let mut arranger = Aarch64Arranger::new(Abi::Aarch64Linux.descriptor(), false);
        arranger.arrange_param(&TypeLayout::I32, false).unwrap();
        let wide = TypeLayout::structure([TypeLayout::I64]).with_alignment(16);
        let Placement::Chunks(chunks) = arranger.arrange_param(&wide, false).unwrap() else {
            panic!("expected chunks");
        };
        assert_eq!(chunks[0].storage.debug_name(), "x2");
        assert_eq!(chunks[1].storage.debug_name(), "x3");
    }

    #[test]
    fn test_apple_packs_stack_scalars() {
        let mut arranger = Aarch64Arranger::new(Abi::Aarch64MacOs.descriptor(), true);
        for _ in 0..8 {
            arranger.arrange_param(&TypeLayout::I64, false).unwrap();
        }
        let first = arranger.arrange_param(&TypeLayout::I32, false).unwrap();
        let second = arranger.arrange_param(&TypeLayout::I8, false).unwrap();
        assert_eq!(
            first,
            Placement::Scalar {
                storages: vec![VMStorage::stack(0, 4)],
                ty: ValueType::I32,
            }
        );
        assert_eq!(
            second,
            Placement::Scalar {
                storages: vec![VMStorage::stack(4, 1)],
                ty: ValueType::I8,
            }
        );
    }

    #[test]
    fn test_apple_variadics_go_to_the_stack() {
        let mut arranger = Aarch64Arranger::new(Abi::Aarch64MacOs.descriptor(), true);
        arranger.arrange_param(&TypeLayout::POINTER, false).unwrap();
        let placement = arranger.arrange_param(&TypeLayout::I32, true).unwrap();
        assert_eq!(
            placement,
            Placement::Scalar {
                storages: vec![VMStorage::stack(0, 8)],
                ty: ValueType::I32,
            }
        );
    }
}
