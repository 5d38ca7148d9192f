// Integration tests for ZramManager
// Most tests run against the in-memory FakeSystem.
// Tests touching a real kernel are #[ignore]d: they need root and the zram module.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use zramkit_core::testing::FakeSystem;
use zramkit_core::{
    CommandRunner, DestroyTarget, ManagerConfig, ZramError, ZramKernel, ZramManager,
};

const MIB: u64 = 1024 * 1024;

fn fake_manager() -> (Arc<FakeSystem>, ZramManager) {
    let system = FakeSystem::new();
    let manager = ZramManager::new(system.clone(), system.clone(), &ManagerConfig::default());
    (system, manager)
}

#[test]
fn test_create_two_devices_and_destroy_all() {
    let (system, manager) = fake_manager();

    let ids = manager
        .create_devices(&[10 * MIB, 10 * MIB], &[1, 2])
        .unwrap();
    assert_eq!(ids.len(), 2);

    let first = manager.device(ids[0]).unwrap();
    let second = manager.device(ids[1]).unwrap();
    assert_eq!(first.disk_size(), 10 * MIB);
    assert_eq!(second.disk_size(), 10 * MIB);
    assert_eq!(first.max_comp_streams(), 1);
    assert_eq!(second.max_comp_streams(), 2);

    let failures = manager.destroy_devices(DestroyTarget::All).unwrap();
    assert!(failures.is_empty());
    assert!(manager.device_ids().is_empty());
    assert!(system.kernel_devices().is_empty());
    assert_eq!(manager.module_ref_count(), 0);
    assert!(!system.module_loaded());
}

#[test]
fn test_activate_and_deactivate_by_path() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];
    let node = system.device_node(id);

    manager.activate(id, 1).unwrap();
    assert!(system.swap_paths().contains(&node));
    assert_eq!(system.swap_priority(&node), Some(1));
    assert!(manager.device(id).unwrap().is_active());

    manager.deactivate(id).unwrap();
    assert!(!system.swap_paths().contains(&node));
    assert!(!manager.device(id).unwrap().is_active());

    // Repeated deactivation is a no-op
    let commands_before = system.commands().len();
    manager.deactivate(id).unwrap();
    assert_eq!(system.commands().len(), commands_before);

    manager.destroy_devices(DestroyTarget::All).unwrap();
}

#[test]
fn test_double_activation_fails() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];

    manager.activate(id, 1).unwrap();
    let err = manager.activate(id, 1).unwrap_err();

    assert!(matches!(err, ZramError::Swap { .. }));
    assert!(err.to_string().contains("already active"));
    assert_eq!(system.swap_paths().len(), 1);
}

#[test]
fn test_labeled_activation_allows_swapoff_by_label() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];

    manager.activate_labeled(id, 1, "zram").unwrap();
    assert_eq!(manager.device(id).unwrap().label(), Some("zram"));

    // An operator running `swapoff -L zram` by hand
    let output = system
        .run("swapoff", &["-L".to_string(), "zram".to_string()], None)
        .unwrap();
    assert!(output.success);
    assert!(system.swap_paths().is_empty());

    let device = manager.refresh(id).unwrap();
    assert!(!device.is_active());
    assert_eq!(device.label(), None);
}

#[test]
fn test_labeled_deactivation_uses_label() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];

    manager.activate_labeled(id, 1, "zram").unwrap();
    manager.deactivate(id).unwrap();

    assert!(system.commands().contains(&"swapoff -L zram".to_string()));
    assert_eq!(manager.device(id).unwrap().label(), None);
}

#[test]
fn test_refresh_without_io_is_stable() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];
    system.simulate_io(id, 10, 20, 4096, 1024);

    let first = manager.refresh(id).unwrap();
    let second = manager.refresh(id).unwrap();

    assert_eq!(first.stats(), second.stats());
    assert_eq!(second.num_reads(), 10);
    assert_eq!(second.num_writes(), 20);
    assert_eq!(second.orig_data_size(), 4096);
    assert_eq!(second.compr_data_size(), 1024);
}

#[test]
fn test_counters_monotonic_across_io() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];
    manager.activate(id, 1).unwrap();

    let mut previous = manager.refresh(id).unwrap();
    for round in 1..=5u64 {
        system.simulate_io(id, round, 2 * round, 8192 * round, 2048 * round);
        let current = manager.refresh(id).unwrap();

        assert!(current.num_reads() >= previous.num_reads());
        assert!(current.num_writes() >= previous.num_writes());
        assert!(!current.stats().counters_regressed(previous.stats()));
        previous = current;
    }
}

#[test]
fn test_refresh_before_configuration_reads_zero() {
    let (_system, manager) = fake_manager();
    let id = manager.create_devices(&[MIB], &[1]).unwrap()[0];

    let device = manager.refresh(id).unwrap();
    assert_eq!(device.num_reads(), 0);
    assert_eq!(device.compr_data_size(), 0);
}

#[test]
fn test_refresh_rejects_unexpected_stat_layout() {
    let (system, manager) = fake_manager();
    let id = manager.create_devices(&[MIB], &[1]).unwrap()[0];
    system.set_mm_stat_override(id, "1 2 3 4 5 6 7 8\n");

    let err = manager.refresh(id).unwrap_err();
    assert!(matches!(err, ZramError::Stats { .. }));
    assert!(err.to_string().contains("unexpected field count"));
}

#[test]
fn test_failed_creation_leaves_registry_unchanged() {
    let (system, manager) = fake_manager();
    let existing = manager.create_devices(&[MIB], &[1]).unwrap();

    system.fail_hot_add_after(2);
    let err = manager
        .create_devices(&[MIB, MIB, MIB], &[1, 1, 1])
        .unwrap_err();

    match err {
        ZramError::Allocation { failed_at, .. } => assert_eq!(failed_at, 2),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(manager.device_ids(), existing);
    assert_eq!(system.kernel_devices(), existing);
    assert_eq!(manager.module_ref_count(), 1);
}

#[test]
fn test_unsupported_algorithm_rolls_back() {
    let system = FakeSystem::new();
    let config = ManagerConfig {
        default_algorithm: Some("brotli".to_string()),
        ..ManagerConfig::default()
    };
    let manager = ZramManager::new(system.clone(), system.clone(), &config);

    let err = manager.create_devices(&[MIB], &[1]).unwrap_err();

    assert!(err.to_string().contains("unsupported algorithm"));
    assert!(system.kernel_devices().is_empty());
    assert_eq!(manager.module_ref_count(), 0);
}

#[test]
fn test_missing_zram_support() {
    let (system, manager) = fake_manager();
    system.set_zram_supported(false);

    let err = manager.create_devices(&[MIB], &[1]).unwrap_err();
    assert!(matches!(err, ZramError::Module(_)));
    assert_eq!(manager.module_ref_count(), 0);
}

#[test]
fn test_activation_timeout_reconciles_from_swap_listing() {
    let (system, manager) = fake_manager();
    let ids = manager.create_devices(&[10 * MIB, 10 * MIB], &[1, 1]).unwrap();

    // swapon finishes its work even though we stop waiting
    system.time_out_command("swapon", true);
    let err = manager
        .activate_with_timeout(ids[0], 1, None, Some(Duration::from_secs(1)))
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert!(manager.device(ids[0]).unwrap().is_active());

    // swapon never gets there
    system.clear_failures();
    system.time_out_command("swapon", false);
    assert!(manager
        .activate_with_timeout(ids[1], 1, None, Some(Duration::from_secs(1)))
        .is_err());
    assert!(!manager.device(ids[1]).unwrap().is_active());
}

#[test]
fn test_destroy_reports_failures_and_continues() {
    let (system, manager) = fake_manager();
    let ids = manager.create_devices(&[MIB, MIB], &[1, 1]).unwrap();
    system.set_busy(ids[0]);

    let failures = manager
        .destroy_devices(DestroyTarget::Devices(vec![ids[0], ids[1], 42]))
        .unwrap();

    let failed: Vec<u32> = failures.iter().map(|(id, _)| *id).collect();
    assert!(failed.contains(&ids[0]));
    assert!(failed.contains(&42));
    assert_eq!(manager.device_ids(), vec![ids[0]]);
    assert_eq!(manager.module_ref_count(), 1);

    system.clear_failures();
    assert!(manager
        .destroy_devices(DestroyTarget::All)
        .unwrap()
        .is_empty());
    assert_eq!(manager.module_ref_count(), 0);
}

#[test]
fn test_destroy_active_devices() {
    let (system, manager) = fake_manager();
    let ids = manager.create_devices(&[10 * MIB, 10 * MIB], &[1, 2]).unwrap();
    manager.activate(ids[0], 5).unwrap();
    manager.activate_labeled(ids[1], 5, "zfast").unwrap();

    let failures = manager.destroy_devices(DestroyTarget::All).unwrap();

    assert!(failures.is_empty());
    assert!(system.swap_paths().is_empty());
    assert!(system.kernel_devices().is_empty());
}

#[test]
fn test_empty_destroy_succeeds() {
    let (_system, manager) = fake_manager();
    assert!(manager
        .destroy_devices(DestroyTarget::Devices(Vec::new()))
        .unwrap()
        .is_empty());
    assert!(manager
        .destroy_devices(DestroyTarget::All)
        .unwrap()
        .is_empty());
}

#[test]
fn test_concurrent_operations_on_independent_devices() {
    let (system, manager) = fake_manager();
    let manager = Arc::new(manager);
    let ids = manager
        .create_devices(&[10 * MIB; 4], &[1, 2, 3, 4])
        .unwrap();

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let manager = manager.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    manager.activate(id, 1).unwrap();
                    manager.refresh(id).unwrap();
                    manager.deactivate(id).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(system.swap_paths().is_empty());
    assert!(manager.devices().iter().all(|d| !d.is_active()));
    assert!(manager
        .destroy_devices(DestroyTarget::All)
        .unwrap()
        .is_empty());
}

#[test]
fn test_concurrent_creation() {
    let (system, manager) = fake_manager();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || manager.create_devices(&[MIB, MIB], &[1, 1]).unwrap())
        })
        .collect();

    let mut all_ids: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all_ids.sort_unstable();
    all_ids.dedup();

    assert_eq!(all_ids.len(), 8);
    assert_eq!(manager.module_ref_count(), 4);
    assert_eq!(system.module_loads(), 1);

    manager.destroy_devices(DestroyTarget::All).unwrap();
    assert_eq!(manager.module_ref_count(), 0);
}

#[test]
#[ignore = "requires root and zram module"]
fn test_real_kernel_lifecycle() {
    let manager = ZramManager::from_config(&ManagerConfig::default());

    let ids = manager
        .create_devices(&[10 * MIB, 10 * MIB], &[1, 2])
        .unwrap();
    assert_eq!(ids.len(), 2);

    manager.activate(ids[0], 1).unwrap();
    let listed = manager.swaps().unwrap();
    assert!(listed
        .iter()
        .any(|e| e.filename == Path::new(&format!("/dev/zram{}", ids[0]))));

    manager.deactivate(ids[0]).unwrap();
    manager.refresh(ids[1]).unwrap();

    let failures = manager.destroy_devices(DestroyTarget::All).unwrap();
    assert!(failures.is_empty());
}

#[test]
#[ignore = "requires root and zram module"]
fn test_real_kernel_labeled_swap() {
    let manager = ZramManager::from_config(&ManagerConfig::default());
    let id = manager.create_devices(&[10 * MIB], &[1]).unwrap()[0];

    manager.activate_labeled(id, 1, "zram").unwrap();
    manager.deactivate(id).unwrap();

    manager.destroy_devices(DestroyTarget::All).unwrap();
}
