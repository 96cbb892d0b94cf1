use super::{Binding, Mode, ProgramDisplay};
use crate::value::ValueType;
use crate::{Error, Result};

/// Operand types during symbolic execution of a program.
#[derive(Debug)]
struct TypeStack {
    types: Vec<ValueType>,
}

impl TypeStack {
    fn pop(&mut self, expected: ValueType, op: &Binding) -> Result<ValueType> {
        let actual = self
            .types
            .pop()
            .ok_or_else(|| failure(format!("`{op}` pops from an empty stack")))?;
        if actual.is_assignable_to(expected) {
            Ok(actual)
        } else {
            Err(failure(format!("`{op}` expects {expected}, found {actual}")))
        }
    }

    fn pop_addressable(&mut self, op: &Binding) -> Result<()> {
        self.pop(ValueType::Address, op).map(|_| ())
    }

    fn push(&mut self, ty: ValueType) {
        self.types.push(ty);
    }

    fn peek(&self, op: &Binding) -> Result<ValueType> {
        self.types
            .last()
            .copied()
            .ok_or_else(|| failure(format!("`{op}` peeks into an empty stack")))
    }
}

fn failure(msg: String) -> Error {
    Error::BindingVerification(msg)
}

fn primitive(ty: ValueType, op: &Binding) -> Result<u64> {
    ty.byte_size()
        .ok_or_else(|| failure(format!("`{op}` requires a primitive type")))
}

/// Symbolically executes `program`.
///
/// In [`Mode::Unbox`] the stack starts with `carrier` (if any) and must end
/// empty. In [`Mode::Box`] it starts empty and must end holding exactly a
/// value assignable to `carrier`, or nothing when `carrier` is `None`.
pub fn verify(program: &[Binding], mode: Mode, carrier: Option<ValueType>) -> Result<()> {
    let mut stack = TypeStack { types: Vec::new() };
    if mode == Mode::Unbox {
        stack.types.extend(carrier);
    }
    for op in program {
        if !op.allowed_in(mode) {
            return Err(failure(format!("`{op}` is not allowed in a {mode} program")));
        }
        match op {
            Binding::VmStore { ty, .. } => {
                primitive(*ty, op)?;
                stack.pop(*ty, op)?;
            }
            Binding::VmLoad { ty, .. } => {
                primitive(*ty, op)?;
                stack.push(*ty);
            }
            Binding::BufferStore { ty, size, .. } => {
                check_width(*ty, *size, op)?;
                stack.pop(*ty, op)?;
                stack.pop(ValueType::Segment, op)?;
            }
            Binding::BufferLoad { ty, size, .. } => {
                check_width(*ty, *size, op)?;
                stack.pop(ValueType::Segment, op)?;
                stack.push(*ty);
            }
            Binding::Copy { align, .. } => {
                check_align(*align, op)?;
                stack.pop(ValueType::Segment, op)?;
                stack.push(ValueType::Segment);
            }
            Binding::Allocate { align, .. } => {
                check_align(*align, op)?;
                stack.push(ValueType::Segment);
            }
            Binding::BoxAddress { .. } => {
                stack.pop(ValueType::I64, op)?;
                stack.push(ValueType::Address);
            }
            Binding::UnboxAddress => {
                stack.pop_addressable(op)?;
                stack.push(ValueType::I64);
            }
            Binding::ToSegment { .. } => {
                stack.pop_addressable(op)?;
                stack.push(ValueType::Segment);
            }
            Binding::Dup => {
                let top = stack.peek(op)?;
                stack.push(top);
            }
        }
    }
    let ok = match (mode, carrier) {
        (Mode::Unbox, _) | (Mode::Box, None) => stack.types.is_empty(),
        (Mode::Box, Some(expected)) => {
            stack.types.len() == 1 && stack.types[0].is_assignable_to(expected)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(failure(format!(
            "{mode} program {} ends with stack {:?}, expected {}",
            ProgramDisplay(program),
            stack.types,
            match (mode, carrier) {
                (Mode::Box, Some(ty)) => format!("[{ty}]"),
                _ => "[]".to_owned(),
            }
        )))
    }
}

pub fn verify_unbox(program: &[Binding], input: Option<ValueType>) -> Result<()> {
    verify(program, Mode::Unbox, input)
}

pub fn verify_box(program: &[Binding], output: Option<ValueType>) -> Result<()> {
    verify(program, Mode::Box, output)
}

fn check_width(ty: ValueType, size: u64, op: &Binding) -> Result<()> {
    let max = primitive(ty, op)?;
    if size == 0 || size > max {
        return Err(failure(format!("`{op}` moves {size} bytes through a {ty}")));
    }
    Ok(())
}

fn check_align(align: u64, op: &Binding) -> Result<()> {
    if align.is_power_of_two() {
        Ok(())
    } else {
        Err(failure(format!("`{op}` has a non power-of-two alignment")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageClass, VMStorage};

    fn rdi() -> VMStorage {
        VMStorage::register(StorageClass::Integer, 7, 8, "rdi")
    }

    #[test]
    fn test_chunked_unbox_program() {
        let program = [
            Binding::Dup,
            Binding::buffer_load(0, ValueType::I64, 8),
            Binding::vm_store(rdi(), ValueType::I64),
            Binding::buffer_load(8, ValueType::I32, 3),
            Binding::vm_store(rdi(), ValueType::I32),
        ];
        verify_unbox(&program, Some(ValueType::Segment)).unwrap();
    }

    #[test]
    fn test_segment_satisfies_address() {
        let program = [Binding::UnboxAddress, Binding::vm_store(rdi(), ValueType::I64)];
        verify_unbox(&program, Some(ValueType::Segment)).unwrap();
        verify_unbox(&program, Some(ValueType::Address)).unwrap();
    }

    #[test]
    fn test_box_program_must_leave_one_value() {
        let program = [
            Binding::vm_load(rdi(), ValueType::I64),
            Binding::BoxAddress { size: 4 },
        ];
        verify_box(&program, Some(ValueType::Address)).unwrap();
        let err = verify_box(&program, Some(ValueType::I64)).unwrap_err();
        assert!(matches!(err, Error::BindingVerification(_)), "{err}");
        let err = verify_box(&program, None).unwrap_err();
        assert!(matches!(err, Error::BindingVerification(_)), "{err}");
    }

    #[test]
    fn test_mode_violation() {
        let program = [Binding::vm_load(rdi(), ValueType::I32)];
        let err = verify_unbox(&program, Some(ValueType::I32)).unwrap_err();
        assert!(err.to_string().contains("not allowed"), "{err}");
    }

    #[test]
    fn test_type_mismatch_and_underflow() {
        let mismatch = [Binding::vm_store(rdi(), ValueType::I64)];
        assert!(verify_unbox(&mismatch, Some(ValueType::I32)).is_err());
        let underflow = [Binding::UnboxAddress];
        assert!(verify_unbox(&underflow, None).is_err());
        let too_wide = [
            Binding::buffer_load(0, ValueType::I16, 4),
            Binding::vm_store(rdi(), ValueType::I16),
        ];
        assert!(verify_unbox(&too_wide, Some(ValueType::Segment)).is_err());
    }
}
