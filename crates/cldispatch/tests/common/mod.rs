//! Shared kernels and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use cldispatch::reference::KernelArgView;
use cldispatch::{
    ArgFlags, ArgSpec, DeviceStatus, DispatchConfig, Dispatcher, KernelArgument, NdRange,
    ReferenceBackend, SessionRegistry,
};

pub const ADD_SRC: &str = r#"
// c = a + b, one element per work item
__kernel void add(__global const int* a, __global const int* b, __global int* c) {
    size_t i = get_global_id(0);
    c[i] = a[i] + b[i];
}
"#;

pub const INC_SRC: &str = "__kernel void inc(__global int* v) { v[get_global_id(0)] += 1; }";

pub const SCALE_SRC: &str = r#"
__kernel void scale(__global float* v, float factor) {
    v[get_global_id(0)] *= factor;
}
"#;

pub const SUM_SRC: &str = r#"
__kernel void sum(__global const int* v, __local int* scratch, __global int* out) {
    scratch[get_local_id(0)] = v[get_global_id(0)];
    barrier(CLK_LOCAL_MEM_FENCE);
    if (get_global_id(0) == 0) { out[0] = 0; }
}
"#;

fn ints(view: &KernelArgView<'_>) -> Result<Vec<i32>, DeviceStatus> {
    Ok(bytemuck::pod_collect_to_vec(view.bytes()?))
}

fn store_ints(view: &mut KernelArgView<'_>, values: &[i32]) -> Result<(), DeviceStatus> {
    let dst = view.bytes_mut()?;
    dst[..values.len() * 4].copy_from_slice(bytemuck::cast_slice(values));
    Ok(())
}

/// A reference backend with `add`, `inc`, `scale` and `sum` registered.
pub fn backend() -> ReferenceBackend {
    ReferenceBackend::new()
        .with_kernel("add", |global, args| {
            let [a, b, c] = args else { return Err(DeviceStatus::INVALID_KERNEL_ARGS) };
            let (a, b) = (ints(a)?, ints(b)?);
            let out: Vec<i32> = (0..global.len()).map(|i| a[i] + b[i]).collect();
            store_ints(c, &out)
        })
        .with_kernel("inc", |global, args| {
            let [v] = args else { return Err(DeviceStatus::INVALID_KERNEL_ARGS) };
            let out: Vec<i32> = ints(v)?.iter().take(global.len()).map(|x| x + 1).collect();
            store_ints(v, &out)
        })
        .with_kernel("scale", |global, args| {
            let [v, factor] = args else { return Err(DeviceStatus::INVALID_KERNEL_ARGS) };
            let factor: f32 = bytemuck::pod_read_unaligned(factor.bytes()?);
            let data = v.bytes_mut()?;
            let mut values = bytemuck::pod_collect_to_vec::<u8, f32>(data);
            for x in values.iter_mut().take(global.len()) {
                *x *= factor;
            }
            data.copy_from_slice(bytemuck::cast_slice(&values));
            Ok(())
        })
        .with_kernel("sum", |_, args| {
            let [v, KernelArgView::Local(_), out] = args else {
                return Err(DeviceStatus::INVALID_KERNEL_ARGS);
            };
            let total: i32 = ints(v)?.iter().sum();
            store_ints(out, &[total])
        })
}

pub fn dispatcher_with(
    backend: ReferenceBackend,
    config: DispatchConfig,
) -> Dispatcher<ReferenceBackend> {
    Dispatcher::new(Arc::new(SessionRegistry::new(backend)), config)
}

pub fn dispatcher() -> Dispatcher<ReferenceBackend> {
    dispatcher_with(backend(), DispatchConfig::default())
}

pub fn range(n: usize) -> NdRange {
    NdRange::d1(n).expect("non-zero range")
}

/// Bind a typed host slice as a buffer argument.
pub fn buf<T: bytemuck::Pod>(data: &mut [T], spec: ArgSpec) -> KernelArgument<'_> {
    KernelArgument::buffer(bytemuck::cast_slice_mut(data), spec).expect("valid buffer spec")
}

/// Bind a typed host slice from raw argument flags.
pub fn flagged<T: bytemuck::Pod>(data: &mut [T], flags: ArgFlags) -> KernelArgument<'_> {
    KernelArgument::from_flags(bytemuck::cast_slice_mut(data), flags).expect("valid flags")
}

