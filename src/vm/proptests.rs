//! Property-Based Tests for the VM configuration store
//!
//! - **Config round-trip**: any valid configuration saved to a VM directory
//!   loads back identical
//! - **Size strings**: formatting a whole-unit size and parsing it back is lossless
//! - **Updates**: applying an update never shrinks the disk
//!
//! ```bash
//! cargo test --lib vm::proptests
//! ```

use proptest::prelude::*;
use tempfile::TempDir;

use crate::units::{format_size, parse_size, GB, KB, MB, TB};
use crate::vm::config::{OsKind, Resolution, VmConfig, VmConfigUpdate, MIN_MEMORY};
use crate::vm::error::VmError;
use crate::vm::storage::StorageLayout;

fn arb_os() -> impl Strategy<Value = OsKind> {
    prop_oneof![Just(OsKind::Linux), Just(OsKind::MacOs)]
}

fn arb_identity() -> impl Strategy<Value = Option<Vec<u8>>> {
    proptest::option::of(prop::collection::vec(any::<u8>(), 1..64))
}

fn arb_config() -> impl Strategy<Value = VmConfig> {
    (
        arb_os(),
        1u32..=64,
        (MIN_MEMORY / MB)..=(64 * GB / MB),
        1u64..=(4 * TB / MB),
        (1u32..=8192, 1u32..=8192),
        arb_identity(),
        arb_identity(),
    )
        .prop_map(|(os, cpu, memory_mb, disk_mb, (width, height), hw, machine)| {
            let mut config = VmConfig::new(os, cpu, memory_mb * MB, disk_mb * MB, Resolution { width, height });
            config.hardware_model = hw;
            config.machine_identifier = machine;
            config
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_config_save_load_roundtrip(config in arb_config()) {
        prop_assert!(config.validate().is_ok());

        let tmp = TempDir::new().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let loaded = runtime.block_on(async {
            let dir = StorageLayout::single(tmp.path()).resolve("vm", None).unwrap();
            tokio::fs::create_dir_all(dir.path()).await.unwrap();
            config.save(&dir).await.unwrap();
            VmConfig::load(&dir).await.unwrap()
        });
        prop_assert_eq!(loaded, config);
    }

    #[test]
    fn prop_config_json_roundtrip(config in arb_config()) {
        let json = serde_json::to_string(&config).unwrap();
        let back: VmConfig = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, config);
    }

    #[test]
    fn prop_whole_unit_sizes_roundtrip(
        n in 1u64..1_000_000,
        unit in prop_oneof![Just(KB), Just(MB), Just(GB), Just(TB)],
    ) {
        let bytes = n * unit;
        prop_assert_eq!(parse_size(&format_size(bytes)).unwrap(), bytes);
    }

    #[test]
    fn prop_bare_numbers_are_megabytes(n in 0u64..10_000_000) {
        prop_assert_eq!(parse_size(&n.to_string()).unwrap(), n * MB);
    }

    #[test]
    fn prop_update_never_shrinks_disk(config in arb_config(), requested_mb in 1u64..=(8 * TB / MB)) {
        let mut updated = config.clone();
        let update = VmConfigUpdate {
            disk_size: Some(requested_mb * MB),
            ..Default::default()
        };
        match update.apply(&mut updated) {
            Ok(()) => {
                prop_assert!(updated.disk_size >= config.disk_size);
                prop_assert_eq!(updated.disk_size, requested_mb * MB);
            }
            Err(VmError::ResizeTooSmall { current, requested }) => {
                prop_assert!(requested < current);
                prop_assert_eq!(&updated, &config);
            }
            Err(e) => prop_assert!(false, "unexpected error: {}", e),
        }
    }
}
