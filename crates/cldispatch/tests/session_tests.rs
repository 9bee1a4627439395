//! Session cache and device catalog behaviour.

use std::sync::Arc;

use cldispatch::reference::{FaultPoint, Operation};
use cldispatch::{
    ConfigurationError, DeviceAddress, DeviceCatalog, DeviceStatus, DeviceType, DispatchError,
    ReferenceBackend, SessionRegistry, Stage,
};

fn opened(registry: &SessionRegistry<ReferenceBackend>) -> usize {
    registry.backend().journal().iter().filter(|op| matches!(op, Operation::OpenSession(_))).count()
}

#[test]
fn same_pair_returns_same_session() {
    let registry = SessionRegistry::new(ReferenceBackend::with_topology(vec![2]));
    let first = registry.get(0, 0).unwrap();
    let again = registry.get(0, 0).unwrap();
    let other = registry.get(0, 1).unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(other.address(), DeviceAddress::new(0, 1));
    assert_eq!(registry.len(), 2);
    assert_eq!(opened(&registry), 2);
}

#[test]
fn out_of_range_device_creates_nothing() {
    let registry = SessionRegistry::new(ReferenceBackend::new());
    let err = registry.get(0, 99).unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::InvalidDeviceIndex {
            platform: 0,
            device: 99,
            ..
        })
    ));
    assert!(err.is_caller_error());
    assert!(registry.is_empty());
    assert_eq!(opened(&registry), 0);
}

#[test]
fn out_of_range_platform_creates_nothing() {
    let registry = SessionRegistry::new(ReferenceBackend::with_topology(vec![1, 1]));
    let err = registry.get(2, 0).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::InvalidDeviceIndex { platform: 2, .. })
    ));
    assert_eq!(opened(&registry), 0);
}

#[test]
fn reset_drops_cached_sessions() {
    let registry = SessionRegistry::new(ReferenceBackend::new());
    let before = registry.get(0, 0).unwrap();
    registry.reset();
    assert!(registry.is_empty());

    let after = registry.get(0, 0).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(opened(&registry), 2);
}

#[test]
fn session_open_failure_is_not_cached() {
    let registry = SessionRegistry::new(
        ReferenceBackend::new().with_fault(FaultPoint::OpenSession, DeviceStatus::OUT_OF_RESOURCES),
    );
    let err = registry.get(0, 0).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Runtime { stage: Stage::OpenSession, status: DeviceStatus::OUT_OF_RESOURCES }
    ));
    assert!(!registry.contains(DeviceAddress::new(0, 0)));
}

#[test]
fn enumeration_failure_surfaces() {
    let backend =
        ReferenceBackend::new().with_fault(FaultPoint::Enumerate, DeviceStatus::OUT_OF_HOST_MEMORY);

    let registry = SessionRegistry::new(backend);
    assert!(matches!(registry.get(0, 0).unwrap_err(), DispatchError::PlatformEnumeration { .. }));
    assert!(matches!(
        DeviceCatalog::new(registry.backend()).list().unwrap_err(),
        DispatchError::PlatformEnumeration { status: DeviceStatus::OUT_OF_HOST_MEMORY }
    ));
}

#[test]
fn concurrent_lookups_share_one_session() {
    let registry = SessionRegistry::new(ReferenceBackend::new());
    let sessions: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4).map(|_| s.spawn(|| registry.get(0, 0).unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(opened(&registry), 1);
}

#[test]
fn catalog_lists_every_platform_in_order() {
    let backend = ReferenceBackend::with_topology(vec![2, 0, 1]);
    let catalog = DeviceCatalog::new(&backend);
    let platforms = catalog.list().unwrap();

    assert_eq!(platforms.iter().map(|p| p.devices.len()).collect::<Vec<_>>(), vec![2, 0, 1]);
    assert_eq!(platforms[2].index, 2);
    let device = &platforms[0].devices[1];
    assert_eq!(device.address, DeviceAddress::new(0, 1));
    assert_eq!(device.device_type, DeviceType::Cpu);
    assert!(device.has_extension("cl_khr_fp64"));

    let row = device.table_row();
    assert_eq!(row[3], "device is available");
    assert_eq!(row[4], row[5]);
    assert_eq!(row[4], device.global_mem_bytes.to_string());
}

#[test]
fn catalog_resolve_validates_indices() {
    let backend = ReferenceBackend::with_topology(vec![1, 3]);
    let catalog = DeviceCatalog::new(&backend);
    assert_eq!(catalog.resolve(1, 2).unwrap(), DeviceAddress::new(1, 2));
    assert!(catalog.resolve(1, 3).unwrap_err().is_caller_error());
    assert!(catalog.resolve(0, 1).unwrap_err().is_caller_error());
}
