//! Windows x64.
//!
//! Arguments consume one positional slot each: the i-th argument goes to the
//! i-th of RCX/RDX/R8/R9 or XMM0-XMM3 depending on its class, then to 8-byte
//! stack slots. Only composites of 1, 2, 4 or 8 bytes travel by value.

use super::sysv::{R8, R9, RAX, RCX, RDX, ST0, XMM};
use super::{AbiDescriptor, Arranger, Chunk, Placement, ReturnPlacement, StackCursor, scalar_type};
use crate::abi::Abi;
use crate::layout::TypeLayout;
use crate::storage::VMStorage;
use crate::value::ValueType;
use crate::Result;

pub const WIN64_INTEGER_ARGS: [VMStorage; 4] = [RCX, RDX, R8, R9];

const SHADOW_SPACE: u64 = 32;

pub(super) fn descriptor() -> AbiDescriptor {
    AbiDescriptor {
        abi: Abi::Win64,
        integer_args: WIN64_INTEGER_ARGS.to_vec(),
        vector_args: XMM[..4].to_vec(),
        integer_returns: vec![RAX],
        vector_returns: vec![XMM[0].clone()],
        x87_returns: vec![ST0],
        return_buffer: RCX,
        return_buffer_result: Some(RAX),
        vector_count: None,
        register_composite_limit: 8,
        stack_alignment: 16,
        shadow_space: SHADOW_SPACE,
    }
}

const fn passed_by_value(size: u64) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

fn integer_or_stack(
    registers: Option<(VMStorage, VMStorage)>,
    stack: &mut StackCursor,
) -> Result<VMStorage> {
    registers.map_or_else(|| stack.next(8, 8), |(int, _)| Ok(int))
}

pub(super) struct Win64Arranger {
    desc: &'static AbiDescriptor,
    position: usize,
    stack: StackCursor,
}

impl Win64Arranger {
    pub(super) fn new(desc: &'static AbiDescriptor) -> Self {
        Self {
            desc,
            position: 0,
            stack: StackCursor::default(),
        }
    }

    /// The integer and vector register of the next position, if any remain.
    fn next_position(&mut self) -> Option<(VMStorage, VMStorage)> {
        let slot = self.position;
        self.position += 1;
        Some((
            self.desc.integer_args.get(slot)?.clone(),
            self.desc.vector_args.get(slot)?.clone(),
        ))
    }
}

impl Arranger for Win64Arranger {
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
            composite if passed_by_value(composite.size()) => Placement::Chunks(vec![Chunk {
                storage: RAX,
                offset: 0,
                ty: ValueType::integer_for_size(composite.size()),
                width: composite.size(),
            }]),
            _ => {
                self.position += 1;
                return Ok(ReturnPlacement::InMemory {
                    buffer: self.desc.return_buffer.clone(),
                    result: self.desc.return_buffer_result.clone(),
                });
            }
        };
        Ok(ReturnPlacement::Value(placement))
    }

    fn arrange_param(&mut self, layout: &TypeLayout, variadic: bool) -> Result<Placement> {
        let registers = self.next_position();
        if let TypeLayout::Address(_) = layout {
            return Ok(Placement::Address {
                storage: integer_or_stack(registers, &mut self.stack)?,
            });
        }
        if let Some(ty) = scalar_type(layout) {
            let storages = match registers {
                Some((int, vec)) if ty.is_float() && variadic => vec![vec, int],
                Some((_, vec)) if ty.is_float() => vec![vec],
                Some((int, _)) => vec![int],
                None => vec![self.stack.next(8, 8)?],
            };
            return Ok(Placement::Scalar { storages, ty });
        }
        let storage = integer_or_stack(registers, &mut self.stack)?;
        if passed_by_value(layout.size()) {
            Ok(Placement::Chunks(vec![Chunk {
                storage,
                offset: 0,
                ty: ValueType::integer_for_size(layout.size()),
                width: layout.size(),
            }]))
        } else {
            Ok(Placement::Reference { storage })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_registers() {
        let mut arranger = Win64Arranger::new(Abi::Win64.descriptor());
        let a = arranger.arrange_param(&TypeLayout::I32, false).unwrap();
        let b = arranger.arrange_param(&TypeLayout::F64, false).unwrap();
        let c = arranger.arrange_param(&TypeLayout::I32, false).unwrap();
        assert_eq!(a, Placement::Scalar { storages: vec![RCX], ty: ValueType::I32 });
        assert_eq!(b, Placement::Scalar { storages: vec![XMM[1].clone()], ty: ValueType::F64 });
        assert_eq!(c, Placement::Scalar { storages: vec![R8], ty: ValueType::I32 });
    }

    #[test]
    fn test_variadic_float_is_duplicated() {
        let mut arranger = Win64Arranger::new(Abi::Win64.descriptor());
        let placement = arranger.arrange_param(&TypeLayout::F64, true).unwrap();
        assert_eq!(
            placement,
            Placement::Scalar { storages: vec![XMM[0].clone(), RCX], ty: ValueType::F64 }
        );
    }

    #[test]
    fn test_odd_sized_composite_by_reference() {
        let mut arranger = Win64Arranger::new(Abi::Win64.descriptor());
        let three = TypeLayout::structure([TypeLayout::I8, TypeLayout::I8, TypeLayout::I8]);
        assert_eq!(
            arranger.arrange_param(&three, false).unwrap(),
            Placement::Reference { storage: RCX }
        );
    }
}
