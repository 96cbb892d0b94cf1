//! Downcalls into upcall entry points: every value must come back bit for bit.

use std::sync::{Arc, Mutex};

use foreign_linker::memory::is_mapped;
use foreign_linker::test_harness::*;
use foreign_linker::{
    Abi, Error, FunctionType, Linker, LinkerConfig, NativeSymbol, Segment, StubStrategy,
    UpcallTarget, Value,
};

fn linker(abi: Abi, strategy: StubStrategy) -> Linker {
    Linker::new(
        abi,
        LinkerConfig {
            strategy,
            ..LinkerConfig::default()
        },
    )
}

/// Calls an identity upcall for `sig` through a downcall handle and returns the result.
fn echo(linker: &Linker, sig: &FunctionType, args: &[Value], pick: usize) -> Option<Value> {
    let target = UpcallTarget::new("echo", sig.carrier_type(), move |params| {
        Ok(Some(params[pick].clone()))
    });
    let stub = linker.upcall_stub(target, sig).unwrap();
    let native = NativeSymbol::at_address(stub.entry_point());
    let handle = linker.downcall_handle(sig).unwrap();
    handle.invoke(&native, args).unwrap()
}

fn bytes(len: usize, seed: u8) -> Segment {
    let data: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed))
        .collect();
    Segment::from_bytes(&data).unwrap()
}

#[test]
fn test_scalars_round_trip_on_every_abi_and_strategy() {
    let cases: [(&str, Value); 6] = [
        ("(i8) -> i8", Value::I8(-7)),
        ("(i16) -> i16", Value::I16(-30_000)),
        ("(i32) -> i32", Value::I32(i32::MIN)),
        ("(i64) -> i64", Value::I64(0x0123_4567_89ab_cdef)),
        ("(f32) -> f32", Value::F32(f32::from_bits(0x7fc0_1234))),
        ("(f64) -> f64", Value::F64(-0.0)),
    ];
    for abi in Abi::ALL {
        for strategy in StubStrategy::ALL {
            let linker = linker(abi, strategy);
            for (text, value) in &cases {
                let sig: FunctionType = text.parse().unwrap();
                let result = echo(&linker, &sig, std::slice::from_ref(value), 0).unwrap();
                assert!(result.bit_eq(value), "{abi}/{strategy} {text}: {result}");
            }
        }
    }
}

#[test]
fn test_mixed_arguments_reach_the_target() {
    let sig: FunctionType = "(f64, i32, ptr, f32, i64, i8, f64, i16) -> f64".parse().unwrap();
    let args = [
        Value::F64(1.25),
        Value::I32(2),
        Value::Address(foreign_linker::Address::new(0x1000, 0)),
        Value::F32(3.5),
        Value::I64(-4),
        Value::I8(5),
        Value::F64(6.75),
        Value::I16(7),
    ];
    for abi in Abi::ALL {
        let linker = linker(abi, StubStrategy::Auto);
        for pick in [0, 6] {
            let result = echo(&linker, &sig, &args, pick).unwrap();
            assert!(result.bit_eq(&args[pick]), "{abi}: arg {pick} came back as {result}");
        }
    }
}

#[test]
fn test_composites_round_trip_around_thresholds() {
    let layouts = [
        "{i32, i32}",
        "{f32, f32}",
        "{i64, f64}",
        "{f64, f64, f64}",
        "{[12 x i8]}",
        "{[16 x i8]}",
        "{[17 x i8]}",
        "{i64, i64, i64, i64}",
        "{f32, f32, f32, f32}",
    ];
    for abi in Abi::ALL {
        for strategy in [StubStrategy::Interpreted, StubStrategy::Specialized] {
            let linker = linker(abi, strategy);
            for (i, layout) in layouts.iter().enumerate() {
                let sig: FunctionType = format!("(i32, {layout}) -> {layout}").parse().unwrap();
                let size = sig.params()[1].size() as usize;
                let input = Value::Segment(bytes(size, i as u8));
                let args = [Value::I32(9), input.clone()];
                let result = echo(&linker, &sig, &args, 1).unwrap();
                assert!(result.bit_eq(&input), "{abi}/{strategy} {layout}");
            }
        }
    }
}

#[test]
fn test_in_memory_return_comes_back_as_fresh_segment() {
    let sig: FunctionType = "() -> {[5 x i64]}".parse().unwrap();
    for abi in Abi::ALL {
        let linker = linker(abi, StubStrategy::Auto);
        let source = bytes(40, 3);
        let expected = Value::Segment(source.clone());
        let target = UpcallTarget::new("make", sig.carrier_type(), move |_| {
            Ok(Some(Value::Segment(source.clone())))
        });
        let stub = linker.upcall_stub(target, &sig).unwrap();
        let handle = linker.downcall_handle(&sig).unwrap();
        assert!(handle.sequence().needs_return_buffer());
        let result = handle
            .invoke(&NativeSymbol::at_address(stub.entry_point()), &[])
            .unwrap()
            .unwrap();
        assert!(result.bit_eq(&expected), "{abi}");
        assert_ne!(result, expected, "{abi}: result must not alias the source");
    }
}

#[test]
fn test_failing_upcall_returns_zero_and_reports() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let linker = Linker::new(
        Abi::SysV,
        LinkerConfig::default()
            .with_uncaught_handler(Arc::new(move |e: &Error| sink.lock().unwrap().push(e.to_string()))),
    );
    for text in ["(i32) -> i64", "(i32) -> {f64, f64}", "(i32) -> {[5 x i64]}"] {
        let sig: FunctionType = text.parse().unwrap();
        let target = UpcallTarget::new("broken", sig.carrier_type(), |_| {
            Err(Error::InvalidArgument("refused".into()))
        });
        let stub = linker.upcall_stub(target, &sig).unwrap();
        let handle = linker.downcall_handle(&sig).unwrap();
        let result = handle
            .invoke(&NativeSymbol::at_address(stub.entry_point()), &[Value::I32(1)])
            .unwrap()
            .unwrap();
        match result {
            Value::I64(v) => assert_eq!(v, 0),
            Value::Segment(s) => assert!(s.to_vec().unwrap().iter().all(|b| *b == 0), "{text}"),
            other => panic!("{text}: unexpected {other}"),
        }
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|m| m.contains("refused")));
}

#[test]
fn test_arena_is_released_when_native_code_fails() {
    let sig: FunctionType = "({i32, i32, i32}) -> void".parse().unwrap();
    for strategy in [StubStrategy::Interpreted, StubStrategy::Specialized] {
        let linker = linker(Abi::Win64, strategy);
        let handle = linker.downcall_handle(&sig).unwrap();
        let copies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&copies);
        let native = NativeSymbol::new("fails_after_peek", move |frame| {
            let address = frame.integer(1);
            assert!(is_mapped(address));
            sink.lock().unwrap().push(address);
            Err(foreign_linker::NativeFault::new(13, "EACCES"))
        });
        let err = handle.invoke(&native, &[Value::Segment(bytes(12, 1))]).unwrap_err();
        assert!(matches!(err, Error::NativeCallFailure { code: 13, .. }), "{err}");
        let copies = copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert!(!is_mapped(copies[0]), "{strategy}: scratch copy still mapped");
    }
}

#[test]
fn test_released_stub_faults_the_native_caller() {
    let linker = linker(Abi::SysV, StubStrategy::Auto);
    let sig: FunctionType = "() -> void".parse().unwrap();
    let target = UpcallTarget::new("noop", sig.carrier_type(), |_| Ok(None));
    let mut stub = linker.upcall_stub(target, &sig).unwrap();
    let native = NativeSymbol::at_address(stub.entry_point());
    let handle = linker.downcall_handle(&sig).unwrap();
    assert_eq!(handle.invoke(&native, &[]).unwrap(), None);
    stub.release();
    let err = handle.invoke(&native, &[]).unwrap_err();
    assert!(matches!(err, Error::NativeCallFailure { code: -1, .. }), "{err}");
    handle.invoke(&noop_native(), &[]).unwrap();
}
