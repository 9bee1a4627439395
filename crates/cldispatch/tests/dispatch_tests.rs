//! End-to-end dispatch through the reference backend.

mod common;

use cldispatch::reference::{FaultPoint, Operation, read_f32, write_f32};
use cldispatch::{
    Access, ArgFlags, ArgSpec, ConfigurationError, DeviceStatus, DispatchConfig, DispatchError,
    DispatchRequest, KernelArgument, MemoryPolicy, NdRange, ReferenceBackend, Stage,
};
use common::{
    ADD_SRC, INC_SRC, SCALE_SRC, SUM_SRC, backend, buf, dispatcher, dispatcher_with, flagged, range,
};

fn transfers(journal: &[Operation]) -> Vec<Operation> {
    journal
        .iter()
        .filter(|op| matches!(op, Operation::Write { .. } | Operation::Read { .. }))
        .cloned()
        .collect()
}

fn created_buffers(dispatcher: &cldispatch::Dispatcher<ReferenceBackend>) -> usize {
    let journal = dispatcher.registry().backend().journal();
    journal.iter().filter(|op| matches!(op, Operation::CreateBuffer { .. })).count()
}

#[test]
fn add_kernel_end_to_end() {
    let dispatcher = dispatcher();
    let mut a = [1i32, 2, 3, 4];
    let mut b = [10i32, 20, 30, 40];
    let mut c = [0i32; 4];

    let mut request = DispatchRequest::builder("add")
        .device(0, 0)
        .global(range(4))
        .source_text(ADD_SRC)
        .arg(buf(&mut a, ArgSpec::read_only()))
        .arg(buf(&mut b, ArgSpec::read_only()))
        .arg(buf(&mut c, ArgSpec::write_only()))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(c, [11, 22, 33, 44]);
    assert_eq!(a, [1, 2, 3, 4], "read-only inputs are never written back");
}

#[test]
fn direction_decides_transfers() {
    let dispatcher = dispatcher();
    let mut a = [1i32, 2, 3, 4];
    let mut b = [10i32, 20, 30, 40];
    let mut c = [-1i32; 4];

    let mut request = DispatchRequest::builder("add")
        .global(range(4))
        .source_text(ADD_SRC)
        .arg(flagged(&mut a, ArgFlags::READ_ONLY))
        .arg(flagged(&mut b, ArgFlags::READ_WRITE))
        .arg(flagged(&mut c, ArgFlags::WRITE_ONLY))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();

    let journal = dispatcher.registry().backend().journal();
    assert_eq!(
        transfers(&journal),
        vec![
            Operation::Write { buffer: 0, len: 16, pinned: false },
            Operation::Write { buffer: 1, len: 16, pinned: false },
            Operation::Read { buffer: 1, len: 16, pinned: false },
            Operation::Read { buffer: 2, len: 16, pinned: false },
        ]
    );
    assert!(journal.contains(&Operation::CreateBuffer {
        buffer: 2,
        len: 16,
        policy: MemoryPolicy { access: Access::WriteOnly, alias_host: false },
    }));
    assert_eq!(journal.last(), Some(&Operation::Finish));
}

#[test]
fn write_only_output_is_not_uploaded() {
    let dispatcher = dispatcher();
    let mut a = [1i32; 4];
    let mut b = [2i32; 4];
    // Stale contents would leak into the result if they were uploaded.
    let mut c = [99i32; 4];

    let mut request = DispatchRequest::builder("add")
        .global(range(4))
        .source_text(ADD_SRC)
        .arg(buf(&mut a, ArgSpec::read_only()))
        .arg(buf(&mut b, ArgSpec::read_only()))
        .arg(buf(&mut c, ArgSpec::write_only()))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(c, [3; 4]);
    let journal = dispatcher.registry().backend().journal();
    assert!(!journal.iter().any(|op| matches!(op, Operation::Write { buffer: 2, .. })));
}

#[test]
fn host_alias_has_no_transfers() {
    let dispatcher = dispatcher();
    let mut v = [5i32, 6, 7];

    let mut request = DispatchRequest::builder("inc")
        .global(range(3))
        .source_text(INC_SRC)
        .arg(buf(&mut v, ArgSpec::read_write().host_alias()))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(v, [6, 7, 8], "the device works on the caller's memory");
    let journal = dispatcher.registry().backend().journal();
    assert!(transfers(&journal).is_empty());
    assert!(journal.contains(&Operation::CreateBuffer {
        buffer: 0,
        len: 12,
        policy: MemoryPolicy { access: Access::ReadWrite, alias_host: true },
    }));
}

#[test]
fn local_memory_gets_no_buffer() {
    let dispatcher = dispatcher();
    let mut v = [1i32, 2, 3, 4];
    let mut out = [0i32; 1];

    let mut request = DispatchRequest::builder("sum")
        .global(range(4))
        .local(range(4))
        .source_text(SUM_SRC)
        .arg(buf(&mut v, ArgSpec::read_only()))
        .arg(KernelArgument::local(4 * std::mem::size_of::<i32>()))
        .arg(buf(&mut out, ArgSpec::write_only()))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(out, [10]);
    let journal = dispatcher.registry().backend().journal();
    let created = journal.iter().filter(|op| matches!(op, Operation::CreateBuffer { .. })).count();
    assert_eq!(created, 2);
    assert!(journal.contains(&Operation::BindLocal { index: 1, size: 16 }));
    assert!(journal.contains(&Operation::Launch {
        kernel: "sum".into(),
        global: range(4),
        local: Some(range(4)),
    }));
}

#[test]
fn local_flag_takes_size_from_span() {
    let dispatcher = dispatcher();
    let mut v = [3i32, 4];
    let mut scratch = [0u8; 32];
    let mut out = [0i32; 1];

    let mut request = DispatchRequest::builder("sum")
        .global(range(2))
        .source_text(SUM_SRC)
        .arg(flagged(&mut v, ArgFlags::READ_ONLY))
        .arg(KernelArgument::from_flags(&mut scratch, ArgFlags::LOCAL_MEMORY).unwrap())
        .arg(flagged(&mut out, ArgFlags::WRITE_ONLY))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(out, [7]);
    let journal = dispatcher.registry().backend().journal();
    assert!(journal.contains(&Operation::BindLocal { index: 1, size: 32 }));
}

#[test]
fn scalar_is_passed_by_value() {
    let dispatcher = dispatcher();
    let mut v = [1.0f32, -2.0, 0.5];
    let factor = 4.0f32.to_ne_bytes();

    let mut request = DispatchRequest::builder("scale")
        .global(range(3))
        .source_text(SCALE_SRC)
        .arg(buf(&mut v, ArgSpec::read_write()))
        .arg(KernelArgument::scalar(&factor))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(v, [4.0, -8.0, 2.0]);
    let journal = dispatcher.registry().backend().journal();
    assert!(journal.contains(&Operation::BindScalar { index: 1, len: 4 }));
    assert_eq!(journal.iter().filter(|op| matches!(op, Operation::CreateBuffer { .. })).count(), 1);
}

#[test]
fn pinned_staging_routes_every_transfer() {
    let config = DispatchConfig { pinned_staging: true, ..DispatchConfig::default() };
    let dispatcher = dispatcher_with(backend(), config);
    let mut a = [1i32, 1];
    let mut b = [2i32, 2];
    let mut c = [0i32; 2];

    let mut request = DispatchRequest::builder("add")
        .global(range(2))
        .source_text(ADD_SRC)
        .arg(buf(&mut a, ArgSpec::read_only()))
        .arg(buf(&mut b, ArgSpec::read_only()))
        .arg(buf(&mut c, ArgSpec::write_only()))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(c, [3, 3]);
    let moved = transfers(&dispatcher.registry().backend().journal());
    assert_eq!(moved.len(), 3);
    assert!(moved.iter().all(|op| matches!(
        op,
        Operation::Write { pinned: true, .. } | Operation::Read { pinned: true, .. }
    )));
}

#[test]
fn per_argument_pinned_flag() {
    let dispatcher = dispatcher();
    let mut v = [1i32, 2];

    let mut request = DispatchRequest::builder("inc")
        .global(range(2))
        .source_text(INC_SRC)
        .arg(flagged(&mut v, ArgFlags::READ_WRITE | ArgFlags::PINNED_STAGING))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(v, [2, 3]);
    assert_eq!(
        transfers(&dispatcher.registry().backend().journal()),
        vec![
            Operation::Write { buffer: 0, len: 8, pinned: true },
            Operation::Read { buffer: 0, len: 8, pinned: true }
        ]
    );
}

#[test]
fn unknown_kernel_is_a_configuration_error() {
    let dispatcher = dispatcher();
    let mut v = [0i32; 2];
    let mut request = DispatchRequest::builder("missing")
        .global(range(2))
        .source_text(INC_SRC)
        .arg(buf(&mut v, ArgSpec::read_write()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::UnknownKernel { ref name })
            if name == "missing"
    ));
    assert_eq!(created_buffers(&dispatcher), 0);
}

#[test]
fn build_failure_stops_before_allocation() {
    let dispatcher = dispatcher();
    let mut v = [0i32; 2];
    let mut request = DispatchRequest::builder("inc")
        .global(range(2))
        .source_text("__kernel void inc(__global int* v) {\n  v[0] = (1;\n}")
        .arg(buf(&mut v, ArgSpec::read_write()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Build { status: DeviceStatus::BUILD_PROGRAM_FAILURE, .. }
    ));
    assert!(!err.build_log().unwrap_or_default().is_empty());
    assert_eq!(created_buffers(&dispatcher), 0);
}

#[test]
fn empty_argument_rejected_before_device_work() {
    let dispatcher = dispatcher();
    let mut empty: [u8; 0] = [];
    let mut request = DispatchRequest::builder("inc")
        .global(range(1))
        .source_text(INC_SRC)
        .arg(KernelArgument::buffer(&mut empty, ArgSpec::read_write()).unwrap())
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::EmptyArgument { index: 0 })
    ));
    assert!(dispatcher.registry().is_empty(), "no session is opened for a rejected request");
}

#[test]
fn launch_failure_still_drains_queue() {
    let backend = backend().with_fault(FaultPoint::Launch, DeviceStatus::OUT_OF_RESOURCES);
    let dispatcher = dispatcher_with(backend, DispatchConfig::default());
    let mut v = [1i32, 2];
    let mut request = DispatchRequest::builder("inc")
        .global(range(2))
        .source_text(INC_SRC)
        .arg(buf(&mut v, ArgSpec::read_write()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Runtime { stage: Stage::Launch, status: DeviceStatus::OUT_OF_RESOURCES }
    ));
    let journal = dispatcher.registry().backend().journal();
    assert_eq!(journal.last(), Some(&Operation::Finish));
    assert!(!journal.iter().any(|op| matches!(op, Operation::Read { .. })));
}

#[test]
fn upload_failure_reports_argument_index() {
    let backend = backend().with_fault(FaultPoint::Write, DeviceStatus::INVALID_VALUE);
    let dispatcher = dispatcher_with(backend, DispatchConfig::default());
    let mut v = [1i32, 2];
    let mut request = DispatchRequest::builder("inc")
        .global(range(2))
        .source_text(INC_SRC)
        .arg(buf(&mut v, ArgSpec::read_write()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::KernelArgument { index: 0, status: DeviceStatus::INVALID_VALUE }
    ));
    assert_eq!(err.status_code(), DeviceStatus::INVALID_VALUE.0);
}

#[test]
fn pinned_host_exhaustion_is_an_allocation_error() {
    let backend = backend().with_fault(FaultPoint::Write, DeviceStatus::OUT_OF_HOST_MEMORY);
    let config = DispatchConfig { pinned_staging: true, ..DispatchConfig::default() };
    let dispatcher = dispatcher_with(backend, config);
    let mut v = [1i32, 2];
    let mut request = DispatchRequest::builder("inc")
        .global(range(2))
        .source_text(INC_SRC)
        .arg(buf(&mut v, ArgSpec::read_write()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(err, DispatchError::Allocation { bytes: 8 }));
}

#[test]
fn oversized_local_reservation_fails_binding() {
    let dispatcher = dispatcher();
    let mut v = [1i32; 2];
    let mut out = [0i32; 1];
    let mut request = DispatchRequest::builder("sum")
        .global(range(2))
        .source_text(SUM_SRC)
        .arg(buf(&mut v, ArgSpec::read_only()))
        .arg(KernelArgument::local(1 << 20))
        .arg(buf(&mut out, ArgSpec::write_only()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::KernelArgument { index: 1, status: DeviceStatus::INVALID_ARG_SIZE }
    ));
}

#[test]
fn indivisible_workgroup_is_a_launch_failure() {
    let dispatcher = dispatcher();
    let mut v = [0i32; 6];
    let mut request = DispatchRequest::builder("inc")
        .global(range(6))
        .local(range(4))
        .source_text(INC_SRC)
        .arg(buf(&mut v, ArgSpec::read_write()))
        .build()
        .unwrap();

    let err = dispatcher.run(&mut request).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Runtime {
            stage: Stage::Launch,
            status: DeviceStatus::INVALID_WORK_GROUP_SIZE
        }

    ));
}

#[test]
fn request_builder_contract() {
    let missing = DispatchRequest::builder("k").global(range(1)).build().unwrap_err();
    assert_eq!(missing, ConfigurationError::MissingSource);

    let both = DispatchRequest::builder("k")
        .global(range(1))
        .source_text(INC_SRC)
        .source_binary(b"bin")
        .build()
        .unwrap_err();
    assert_eq!(both, ConfigurationError::ConflictingSource);

    let unnamed =
        DispatchRequest::builder("  ").global(range(1)).source_text(INC_SRC).build().unwrap_err();
    assert_eq!(unnamed, ConfigurationError::EmptyKernelName);

    let no_range = DispatchRequest::builder("k").source_text(INC_SRC).build().unwrap_err();
    assert!(matches!(no_range, ConfigurationError::InvalidRange { .. }));

    let mismatched = DispatchRequest::builder("k")
        .global(NdRange::d2(4, 4).unwrap())
        .local(range(4))
        .source_text(INC_SRC)
        .build()
        .unwrap_err();
    assert!(matches!(mismatched, ConfigurationError::InvalidRange { .. }));
}

#[test]
fn request_defaults_come_from_config() {
    let config = DispatchConfig { platform_index: 1, device_index: 2, ..DispatchConfig::default() };
    let request = DispatchRequest::builder("k")
        .global(range(1))
        .source_text(INC_SRC)
        .build_with(&config)
        .unwrap();
    assert_eq!((request.platform, request.device), (1, 2));

    let explicit = DispatchRequest::builder("k")
        .device(0, 0)
        .global(range(1))
        .source_text(INC_SRC)
        .build_with(&config)
        .unwrap();
    assert_eq!((explicit.platform, explicit.device), (0, 0));
}

#[test]
fn kernel_without_arguments() {
    let backend = backend().with_kernel("noop", |_, args| {
        if args.is_empty() { Ok(()) } else { Err(DeviceStatus::INVALID_KERNEL_ARGS) }
    });
    let dispatcher = dispatcher_with(backend, DispatchConfig::default());
    let mut request = DispatchRequest::builder("noop")
        .global(range(8))
        .source_text("__kernel void noop() {}")
        .build()
        .unwrap();

    dispatcher.run(&mut request).unwrap();
}

const FLOAT_ADD_SRC: &str = "__kernel void add(__global const float* a, __global const float* b, \
                             __global float* c){int i=get_global_id(0); c[i]=a[i]+b[i];}";

fn float_add_backend() -> ReferenceBackend {
    ReferenceBackend::new().with_kernel("add", |global, args| {
        let [a, b, c] = args else { return Err(DeviceStatus::INVALID_KERNEL_ARGS) };
        let (a, b) = (read_f32(a.bytes()?), read_f32(b.bytes()?));
        let sum: Vec<f32> = (0..global.len()).map(|i| a[i] + b[i]).collect();
        write_f32(c.bytes_mut()?, &sum);
        Ok(())
    })
}

#[test]
fn float_add_over_three_dimensional_range() {
    let dispatcher = dispatcher_with(float_add_backend(), DispatchConfig::default());
    let global = NdRange::d3(4, 1, 1).unwrap();
    let mut a = [1.0f32, 2.0, 3.0, 4.0];
    let mut b = [10.0f32, 20.0, 30.0, 40.0];
    let mut c = [0.0f32; 4];

    let mut request = DispatchRequest::builder("add")
        .device(0, 0)
        .global(global)
        .source_text(FLOAT_ADD_SRC)
        .arg(flagged(&mut a, ArgFlags::READ_ONLY))
        .arg(flagged(&mut b, ArgFlags::READ_ONLY))
        .arg(flagged(&mut c, ArgFlags::WRITE_ONLY))
        .build()
        .unwrap();
    dispatcher.run(&mut request).unwrap();
    drop(request);

    assert_eq!(c, [11.0, 22.0, 33.0, 44.0]);
    assert_eq!(a, [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(b, [10.0, 20.0, 30.0, 40.0]);
    let journal = dispatcher.registry().backend().journal();
    assert!(journal.contains(&Operation::Launch { kernel: "add".into(), global, local: None }));
}

#[test]
fn consecutive_dispatches_share_one_session() {
    let dispatcher = dispatcher();
    let mut values = [1i32, 2, 3];

    for _ in 0..2 {
        let mut request = DispatchRequest::builder("inc")
            .global(range(3))
            .source_text(INC_SRC)
            .arg(buf(&mut values, ArgSpec::read_write()))
            .build()
            .unwrap();
        dispatcher.run(&mut request).unwrap();
    }
    assert_eq!(values, [3, 4, 5]);

    let journal = dispatcher.registry().backend().take_journal();
    let opened = journal.iter().filter(|op| matches!(op, Operation::OpenSession(_))).count();
    let launched = journal.iter().filter(|op| matches!(op, Operation::Launch { .. })).count();
    assert_eq!((opened, launched), (1, 2));
    assert!(dispatcher.registry().backend().journal().is_empty());
    assert_eq!(dispatcher.registry().len(), 1);
}
