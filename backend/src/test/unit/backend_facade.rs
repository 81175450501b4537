//! The facade's registry contract and descriptor arithmetic.

use fusor_dtype::{DType, EngineKind};
use fusor_graph::{Backend, LogicalTensor};

use crate::backend::FusorBackend;
use crate::test::helpers::*;

#[test]
fn backend_registers_once_under_its_name() {
    let _guard = global_guard();
    let found = fusor_graph::registry().find("fusor").expect("backend registered");
    assert_eq!(found.priority(), 10.0);
    // Registering again must not duplicate the entry.
    crate::backend::register_fusor_backend();
    let names: Vec<String> = fusor_graph::registry().backends().iter().map(|b| b.name().to_string()).collect();
    assert_eq!(names.iter().filter(|n| n.as_str() == "fusor").count(), 1);
}

#[test]
fn cpu_is_supported() {
    let backend = FusorBackend::get();
    assert!(backend.support_engine_kind(EngineKind::Cpu));
    #[cfg(not(feature = "gpu"))]
    assert!(!backend.support_engine_kind(EngineKind::Gpu));
}

#[test]
fn mem_size_follows_the_descriptor() {
    let backend = FusorBackend::get();
    let lt = f32_lt(0, &[2, 3, 4]);
    assert_eq!(backend.get_mem_size(&lt).unwrap(), 2 * 3 * 4 * 4);

    // Padded strides span more memory than the dense element count.
    let padded = LogicalTensor::new(1, DType::F32).with_dims(&[2, 2]).with_strides(&[8, 1]);
    assert_eq!(backend.get_mem_size(&padded).unwrap(), 40);
}

#[test]
fn logical_tensor_equality_is_descriptor_equality() {
    let backend = FusorBackend::get();

    // Same shape and dtype, same implied layout: equal.
    let a = f32_lt(0, &[4, 4]);
    let b = f32_lt(1, &[4, 4]);
    assert!(backend.compare_logical_tensor(&a, &b).unwrap());

    // Dense strides spelled out equal the implied dense layout.
    let c = LogicalTensor::new(2, DType::F32).with_dims(&[4, 4]).with_strides(&[4, 1]);
    assert!(backend.compare_logical_tensor(&a, &c).unwrap());

    // Transposed strides describe different memory.
    let d = LogicalTensor::new(3, DType::F32).with_dims(&[4, 4]).with_strides(&[1, 4]);
    assert!(!backend.compare_logical_tensor(&a, &d).unwrap());

    // Same layout, different element type.
    let e = LogicalTensor::new(4, DType::BF16).with_dims(&[4, 4]);
    assert!(!backend.compare_logical_tensor(&a, &e).unwrap());
}

#[test]
fn unknown_dims_cannot_be_sized() {
    let backend = FusorBackend::get();
    let lt = unknown_lt(0, 3);
    assert!(backend.get_mem_size(&lt).is_err());
}
