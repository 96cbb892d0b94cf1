//! Classification scenarios and exact ABI threshold behavior.

use foreign_linker::test_harness::*;
use foreign_linker::value::ValueType;
use foreign_linker::{
    Abi, CallingSequenceBuilder, Error, FunctionType, Linker, LinkerConfig, UpcallTarget,
};

#[test]
fn test_single_int_goes_to_first_integer_register() {
    let seq = downcall_sequence("(i32) -> void", "sysv").unwrap();
    assert_eq!(seq.arguments().len(), 1);
    assert_matches(
        &seq.arguments()[0].program,
        &[BindingPattern::store("rdi", ValueType::I32)],
    );
    assert!(seq.return_program().is_empty());
    assert!(!seq.needs_return_buffer());
}

#[test]
fn test_pointer_return_is_boxed_with_pointee_size() {
    let seq = downcall_sequence("() -> ptr<i32>", "sysv").unwrap();
    assert!(seq.arguments().is_empty());
    assert_matches(
        seq.return_program(),
        &[
            BindingPattern::load("rax", ValueType::I64),
            BindingPattern::BoxAddress {
                size: Pat::Exact(4),
            },
        ],
    );
}

#[test]
fn test_two_int_composite_in_one_register() {
    let seq = downcall_sequence("({i32, i32}) -> void", "sysv").unwrap();
    assert_matches(
        &seq.arguments()[0].program,
        &[
            BindingPattern::BufferLoad {
                offset: Pat::Exact(0),
                ty: Pat::Exact(ValueType::I64),
                size: Pat::Exact(8),
            },
            BindingPattern::store("rdi", ValueType::I64),
        ],
    );
    assert_eq!(seq.scratch_allocation_size(), 0);
}

#[test]
fn test_composite_by_reference_is_copied() {
    // Windows x64 passes anything that is not 1, 2, 4 or 8 bytes by reference.
    let seq = downcall_sequence("({i32, i32, i32}) -> void", "win64").unwrap();
    assert_matches(
        &seq.arguments()[0].program,
        &[
            BindingPattern::Copy {
                size: Pat::Exact(12),
            },
            BindingPattern::UnboxAddress,
            BindingPattern::store("rcx", ValueType::I64),
        ],
    );
    assert!(seq.scratch_allocation_size() >= 12);
}

#[test]
fn test_unaligned_composite_failure_is_cached() {
    let linker = Linker::new(Abi::SysV, LinkerConfig::default());
    let sig: FunctionType = "(packed{i8, i32}) -> void".parse().unwrap();
    let first = linker.downcall_handle(&sig).unwrap_err();
    assert!(matches!(first, Error::InvalidSignature(_)), "{first}");
    let second = linker.downcall_handle(&sig).unwrap_err();
    assert_eq!(first, second);
    let stats = linker.downcall_stats();
    assert_eq!((stats.misses, stats.hits), (1, 1));

    let target = UpcallTarget::new("packed", sig.carrier_type(), |_| Ok(None));
    let first = linker.upcall_stub(target.clone(), &sig).unwrap_err();
    let second = linker.upcall_stub(target, &sig).unwrap_err();
    assert!(matches!(first, Error::InvalidSignature(_)), "{first}");
    assert_eq!(first, second);
    let stats = linker.upcall_stats();
    assert_eq!((stats.misses, stats.hits), (1, 1));
}

#[test]
fn test_oversized_layouts_fail_to_link() {
    let linker = Linker::new(Abi::SysV, LinkerConfig::default());
    for text in [
        "({[4294967296 x [4294967296 x i64]]}) -> void",
        "({pad(18446744073709551615), i64}) -> void",
    ] {
        let sig: FunctionType = text.parse().unwrap();
        let err = linker.downcall_handle(&sig).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)), "{text}: {err}");
        assert!(err.to_string().contains("layout size overflows"), "{text}: {err}");
    }
    assert_eq!(linker.downcall_stats().misses, 2);
}

#[test]
fn test_sysv_sixteen_bytes_in_registers_seventeen_on_stack() {
    let at = downcall_sequence("({[16 x i8]}) -> void", "sysv").unwrap();
    assert_eq!(stored_storages(&at.arguments()[0].program), ["rdi", "rsi"]);

    let over = downcall_sequence("({[17 x i8]}) -> void", "sysv").unwrap();
    let storages = stored_storages(&over.arguments()[0].program);
    assert_eq!(storages.len(), 3);
    assert!(storages.iter().all(|s| s.starts_with("stack[")), "{storages:?}");
}

#[test]
fn test_sysv_return_threshold() {
    let at = downcall_sequence("() -> {i64, i64}", "sysv").unwrap();
    assert!(!at.needs_return_buffer());
    assert_eq!(count_binding(at.return_program(), "vm_load"), 2);

    let over = downcall_sequence("() -> {i64, i64, i8}", "sysv").unwrap();
    assert!(over.needs_return_buffer());
    assert_eq!(over.return_buffer_size(), 24);
    assert_matches(
        &over.arguments()[0].program,
        &[BindingPattern::UnboxAddress, BindingPattern::store("rdi", ValueType::I64)],
    );
}

#[test]
fn test_win64_eight_bytes_by_value_nine_by_reference() {
    let at = downcall_sequence("({[8 x i8]}) -> void", "win64").unwrap();
    assert_eq!(count_binding(&at.arguments()[0].program, "copy"), 0);
    assert_eq!(stored_storages(&at.arguments()[0].program), ["rcx"]);

    let over = downcall_sequence("({[9 x i8]}) -> void", "win64").unwrap();
    assert_eq!(count_binding(&over.arguments()[0].program, "copy"), 1);
}

#[test]
fn test_aarch64_sixteen_bytes_by_value_seventeen_by_reference() {
    let at = downcall_sequence("({i64, i64}) -> void", "aarch64-linux").unwrap();
    assert_eq!(stored_storages(&at.arguments()[0].program), ["x0", "x1"]);

    let over = downcall_sequence("({[17 x i8]}) -> void", "aarch64-linux").unwrap();
    assert_eq!(count_binding(&over.arguments()[0].program, "copy"), 1);
    assert_eq!(stored_storages(&over.arguments()[0].program), ["x0"]);
}

#[test]
fn test_upcall_boxes_what_downcall_unboxes() {
    let seq = upcall_sequence("({f32, f32}, i32) -> f64", "sysv").unwrap();
    assert_matches(
        &seq.arguments()[0].program,
        &[
            BindingPattern::Allocate {
                size: Pat::Exact(8),
            },
            BindingPattern::Dup,
            BindingPattern::load("xmm0", ValueType::F64),
            BindingPattern::BufferStore {
                offset: Pat::Exact(0),
                ty: Pat::Any,
                size: Pat::Exact(8),
            },
        ],
    );
    assert_matches(
        &seq.arguments()[1].program,
        &[BindingPattern::load("rdi", ValueType::I32)],
    );
    assert_matches(
        seq.return_program(),
        &[BindingPattern::store("xmm0", ValueType::F64)],
    );
}

#[test]
fn test_classification_is_deterministic_and_verified() {
    let signatures = [
        "(i8, i16, i32, i64, f32, f64, ptr) -> void",
        "({f32, f32, f32, f32}, {i8, f64}) -> {f64, f64}",
        "(union{i32, f32}, {[3 x i32]}) -> {[5 x i64]}",
        "(ptr, ...) -> i32",
    ];
    for abi in Abi::ALL {
        for text in signatures {
            let sig: FunctionType = text.parse().unwrap();
            let builder = CallingSequenceBuilder::downcall(abi);
            let first = builder.build(&sig).unwrap();
            let second = builder.build(&sig).unwrap();
            assert_eq!(first, second, "{abi}: {text}");
            first.verify().unwrap();
        }
    }
}
