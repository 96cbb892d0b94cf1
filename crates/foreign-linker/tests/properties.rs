//! Property-based tests for classification and marshalling.
//!
//! Uses `proptest` to generate random signatures and values and checks that:
//! - classification is deterministic and always passes verification
//! - composites of scalar fields survive a downcall into an upcall unchanged
//! - float bit patterns, NaN payloads included, are never altered

use proptest::prelude::*;

use foreign_linker::layout::TypeLayout as L;
use foreign_linker::{
    Abi, CallingSequenceBuilder, FunctionType, Linker, LinkerConfig, NativeSymbol, Segment,
    StubStrategy, TypeLayout, UpcallTarget, Value,
};

fn scalar_layout() -> impl Strategy<Value = TypeLayout> {
    prop_oneof![
        Just(L::I8),
        Just(L::I16),
        Just(L::I32),
        Just(L::I64),
        Just(L::F32),
        Just(L::F64),
        Just(L::POINTER),
    ]
}

fn struct_layout() -> impl Strategy<Value = TypeLayout> {
    prop::collection::vec(scalar_layout(), 1..7).prop_map(L::structure)
}

fn param_layout() -> impl Strategy<Value = TypeLayout> {
    prop_oneof![3 => scalar_layout(), 1 => struct_layout()]
}

fn signature() -> impl Strategy<Value = FunctionType> {
    (
        prop::collection::vec(param_layout(), 0..12),
        prop::option::of(param_layout()),
    )
        .prop_map(|(params, ret)| FunctionType::new(params, ret))
}

fn abi() -> impl Strategy<Value = Abi> {
    prop::sample::select(Abi::ALL.to_vec())
}

/// Compares only the bytes covered by members, ignoring padding.
fn members_equal(layout: &TypeLayout, a: &[u8], b: &[u8]) -> bool {
    match layout {
        L::Struct(group) => group.members().iter().all(|m| {
            let range = m.offset as usize..(m.offset + m.layout.size()) as usize;
            a[range.clone()] == b[range]
        }),
        _ => a == b,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn classification_is_deterministic_and_verified(sig in signature(), abi in abi()) {
        for builder in [CallingSequenceBuilder::downcall(abi), CallingSequenceBuilder::upcall(abi)] {
            let first = builder.build(&sig);
            let second = builder.build(&sig);
            prop_assert_eq!(&first, &second);
            if let Ok(sequence) = first {
                prop_assert!(sequence.verify().is_ok(), "{} on {}", sig, abi);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(60))]

    #[test]
    fn composites_survive_a_round_trip(
        layout in struct_layout(),
        abi in abi(),
        seed in any::<[u8; 32]>(),
    ) {
        let size = layout.size() as usize;
        let data: Vec<u8> = (0..size).map(|i| seed[i % 32] ^ (i / 32) as u8).collect();
        let input = Segment::from_bytes(&data).unwrap();
        let sig = FunctionType::returning([L::I32, layout.clone()], layout.clone());

        let linker = Linker::new(abi, LinkerConfig::default());
        let target = UpcallTarget::new("echo", sig.carrier_type(), |params| Ok(Some(params[1].clone())));
        let stub = linker.upcall_stub(target, &sig).unwrap();
        let handle = linker.downcall_handle(&sig).unwrap();
        let result = handle
            .invoke(
                &NativeSymbol::at_address(stub.entry_point()),
                &[Value::I32(1), Value::Segment(input)],
            )
            .unwrap()
            .unwrap();
        let output = result.as_segment().unwrap().to_vec().unwrap();
        prop_assert_eq!(output.len(), size);
        prop_assert!(members_equal(&layout, &data, &output), "{} on {}", layout, abi);
    }

    #[test]
    fn float_bits_are_preserved(
        f in any::<u32>(),
        d in any::<u64>(),
        abi in abi(),
        strategy in prop::sample::select(StubStrategy::ALL.to_vec()),
    ) {
        let sig = FunctionType::returning([L::F32, L::F64], L::F64);
        let linker = Linker::new(abi, LinkerConfig { strategy, ..LinkerConfig::default() });
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let sink = std::sync::Arc::clone(&seen);
        let target = UpcallTarget::new("floats", sig.carrier_type(), move |params| {
            *sink.lock().unwrap() = Some(params[0].clone());
            Ok(Some(params[1].clone()))
        });
        let stub = linker.upcall_stub(target, &sig).unwrap();
        let handle = linker.downcall_handle(&sig).unwrap();
        let args = [Value::F32(f32::from_bits(f)), Value::F64(f64::from_bits(d))];
        let result = handle
            .invoke(&NativeSymbol::at_address(stub.entry_point()), &args)
            .unwrap()
            .unwrap();
        prop_assert!(result.bit_eq(&args[1]));
        let first = seen.lock().unwrap().clone().unwrap();
        prop_assert!(first.bit_eq(&args[0]));
    }
}
