//! Signature classification and binding-program synthesis.

use std::sync::Arc;

use crate::abi::{Abi, Placement, ReturnPlacement};
use crate::binding::Binding;
use crate::calling_sequence::{ArgumentProgram, ArgumentRole, CallingSequence, Direction};
use crate::layout::{FunctionType, TypeLayout, align_up};
use crate::storage::{Argument, ArgumentBinding, Side, StorageClassification, VMStorage};
use crate::value::ValueType;
use crate::{Error, Result};

/// Turns signatures into calling sequences for one ABI and direction.
#[derive(Debug, Clone, Copy)]
pub struct CallingSequenceBuilder {
    abi: Abi,
    direction: Direction,
}

impl CallingSequenceBuilder {
    #[must_use]
    pub const fn new(abi: Abi, direction: Direction) -> Self {
        Self { abi, direction }
    }

    #[must_use]
    pub const fn downcall(abi: Abi) -> Self {
        Self::new(abi, Direction::Downcall)
    }

    #[must_use]
    pub const fn upcall(abi: Abi) -> Self {
        Self::new(abi, Direction::Upcall)
    }

    pub fn build(&self, signature: &FunctionType) -> Result<CallingSequence> {
        classify(signature, self.abi, self.direction)
    }
}

/// Checks that `signature` can be classified at all for `direction`.
pub fn validate_signature(signature: &FunctionType, direction: Direction) -> Result<()> {
    signature.validate()?;
    if direction == Direction::Upcall && signature.is_variadic() {
        return Err(Error::InvalidSignature(
            "upcall signatures cannot be variadic".into(),
        ));
    }
    for (i, param) in signature.params().iter().enumerate() {
        if signature.is_variadic_param(i) && param.is_composite() {
            return Err(Error::InvalidSignature(format!(
                "parameter {i}: composite `{param}` cannot be passed as a variadic argument"
            )));
        }
    }
    Ok(())
}

pub fn classify(signature: &FunctionType, abi: Abi, direction: Direction) -> Result<CallingSequence> {
    validate_signature(signature, direction)?;
    let mut arranger = abi.arranger();
    let mut classification = StorageClassification::default();
    let mut arguments = Vec::with_capacity(signature.params().len() + 1);

    let return_placement = arranger.arrange_return(signature.ret())?;
    let (return_program, return_carrier) = match &return_placement {
        ReturnPlacement::Void => (Vec::new(), None),
        ReturnPlacement::Value(placement) => {
            let layout = signature.ret().ok_or_else(|| {
                Error::Internal("return placement without a return layout".into())
            })?;
            let argument = Arc::new(Argument::ret(layout.clone()));
            record(&mut classification, Side::Return, &argument, placement);
            let program = match direction {
                Direction::Downcall => box_program(placement, layout),
                Direction::Upcall => unbox_program(placement, layout),
            };
            (program, Some(layout.carrier()))
        }
        ReturnPlacement::InMemory { buffer, result } => {
            let layout = signature.ret().ok_or_else(|| {
                Error::Internal("in-memory return without a return layout".into())
            })?;
            let argument = Arc::new(Argument::hidden(
                "return_buffer",
                TypeLayout::pointer_to(layout.clone()),
            ));
            push_binding(&mut classification, Side::Argument, &argument, buffer, 0);
            let size = layout.size();
            let program = match direction {
                Direction::Downcall => vec![
                    Binding::UnboxAddress,
                    Binding::vm_store(buffer.clone(), ValueType::I64),
                ],
                Direction::Upcall => vec![
                    Binding::vm_load(buffer.clone(), ValueType::I64),
                    Binding::BoxAddress { size },
                    Binding::ToSegment { size },
                ],
            };
            arguments.push(ArgumentProgram {
                role: ArgumentRole::ReturnBuffer,
                argument,
                carrier: ValueType::Segment,
                program,
            });
            match (direction, result) {
                (Direction::Upcall, Some(result)) => {
                    let ret = Arc::new(Argument::ret(layout.clone()));
                    push_binding(&mut classification, Side::Return, &ret, result, 0);
                    (
                        vec![
                            Binding::UnboxAddress,
                            Binding::vm_store(result.clone(), ValueType::I64),
                        ],
                        Some(ValueType::Segment),
                    )
                }
                _ => (Vec::new(), None),
            }
        }
    };

    for (i, layout) in signature.params().iter().enumerate() {
        let placement = arranger.arrange_param(layout, signature.is_variadic_param(i))?;
        let argument = Arc::new(Argument::param(i, layout.clone()));
        record(&mut classification, Side::Argument, &argument, &placement);
        let program = match direction {
            Direction::Downcall => unbox_program(&placement, layout),
            Direction::Upcall => box_program(&placement, layout),
        };
        arguments.push(ArgumentProgram {
            role: ArgumentRole::Parameter(i),
            argument,
            carrier: layout.carrier(),
            program,
        });
    }

    if direction == Direction::Downcall {
        if let Some((storage, count)) = arranger.vector_count() {
            let argument = Arc::new(Argument::hidden("vector_count", TypeLayout::I64));
            push_binding(&mut classification, Side::Argument, &argument, &storage, 0);
            arguments.push(ArgumentProgram {
                role: ArgumentRole::VectorRegisterCount(count),
                argument,
                carrier: ValueType::I64,
                program: vec![Binding::vm_store(storage, ValueType::I64)],
            });
        }
    }

    let (scratch_size, scratch_align) = scratch_requirements(&arguments);
    let (needs_return_buffer, return_buffer_size, return_buffer_align) = match &return_placement {
        ReturnPlacement::InMemory { .. } => signature
            .ret()
            .map_or((false, 0, 1), |l| (true, l.size(), l.align())),
        _ => (false, 0, 1),
    };
    let sequence = CallingSequence {
        abi,
        direction,
        signature: signature.clone(),
        arguments,
        return_program,
        return_carrier,
        needs_return_buffer,
        return_buffer_size,
        return_buffer_align,
        scratch_size,
        scratch_align,
        classification,
    };
    sequence.verify()?;
    for arg in sequence.arguments() {
        tracing::trace!(role = ?arg.role, program = %crate::binding::ProgramDisplay(&arg.program));
    }
    tracing::debug!(
        %abi,
        %direction,
        signature = %signature,
        scratch = sequence.scratch_size,
        return_buffer = sequence.needs_return_buffer,
        "classified signature"
    );
    Ok(sequence)
}

/// Program moving a high-level value into its storage.
fn unbox_program(placement: &Placement, layout: &TypeLayout) -> Vec<Binding> {
    match placement {
        Placement::Scalar { storages, ty } => {
            let mut program = Vec::with_capacity(storages.len() * 2);
            for (i, storage) in storages.iter().enumerate() {
                if i + 1 < storages.len() {
                    program.push(Binding::Dup);
                }
                program.push(Binding::vm_store(storage.clone(), *ty));
            }
            program
        }
        Placement::Address { storage } => vec![
            Binding::UnboxAddress,
            Binding::vm_store(storage.clone(), ValueType::I64),
        ],
        Placement::Chunks(chunks) => {
            let mut program = Vec::with_capacity(chunks.len() * 3);
            for (i, chunk) in chunks.iter().enumerate() {
                if i + 1 < chunks.len() {
                    program.push(Binding::Dup);
                }
                program.push(Binding::buffer_load(chunk.offset, chunk.ty, chunk.width));
                program.push(Binding::vm_store(chunk.storage.clone(), chunk.ty));
            }
            program
        }
        Placement::Reference { storage } => vec![
            Binding::Copy {
                size: layout.size(),
                align: layout.align(),
            },
            Binding::UnboxAddress,
            Binding::vm_store(storage.clone(), ValueType::I64),
        ],
    }
}

/// Program rebuilding a high-level value from its storage.
fn box_program(placement: &Placement, layout: &TypeLayout) -> Vec<Binding> {
    match placement {
        Placement::Scalar { storages, ty } => storages
            .first()
            .map(|s| vec![Binding::vm_load(s.clone(), *ty)])
            .unwrap_or_default(),
        Placement::Address { storage } => vec![
            Binding::vm_load(storage.clone(), ValueType::I64),
            Binding::BoxAddress {
                size: layout.pointee_size(),
            },
        ],
        Placement::Chunks(chunks) => {
            let mut program = Vec::with_capacity(chunks.len() * 3 + 1);
            program.push(Binding::Allocate {
                size: layout.size(),
                align: layout.align(),
            });
            for chunk in chunks {
                program.push(Binding::Dup);
                program.push(Binding::vm_load(chunk.storage.clone(), chunk.ty));
                program.push(Binding::buffer_store(chunk.offset, chunk.ty, chunk.width));
            }
            program
        }
        Placement::Reference { storage } => vec![
            Binding::vm_load(storage.clone(), ValueType::I64),
            Binding::BoxAddress {
                size: layout.size(),
            },
            Binding::ToSegment {
                size: layout.size(),
            },
        ],
    }
}

fn record(
    classification: &mut StorageClassification,
    side: Side,
    argument: &Arc<Argument>,
    placement: &Placement,
) {
    match placement {
        Placement::Scalar { storages, .. } => {
            for storage in storages {
                push_binding(classification, side, argument, storage, 0);
            }
        }
        Placement::Address { storage } | Placement::Reference { storage } => {
            push_binding(classification, side, argument, storage, 0);
        }
        Placement::Chunks(chunks) => {
            for chunk in chunks {
                push_binding(classification, side, argument, &chunk.storage, chunk.offset);
            }
        }
    }
}

fn push_binding(
    classification: &mut StorageClassification,
    side: Side,
    argument: &Arc<Argument>,
    storage: &VMStorage,
    offset: u64,
) {
    classification.push(
        side,
        ArgumentBinding {
            storage: storage.clone(),
            argument: Arc::clone(argument),
            offset,
        },
    );
}

/// Bytes (and alignment) of call-scoped memory the argument programs allocate.
fn scratch_requirements(arguments: &[ArgumentProgram]) -> (u64, u64) {
    let mut size = 0;
    let mut align = 1;
    for binding in arguments.iter().flat_map(|a| &a.program) {
        if let Binding::Copy { size: s, align: a } | Binding::Allocate { size: s, align: a } =
            binding
        {
            size = align_up(size, *a).saturating_add(*s);
            align = align.max(*a);
        }
    }
    (size, align)
}
