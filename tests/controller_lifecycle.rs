// End-to-end VM lifecycle over the in-memory hypervisor, display and registry

use std::sync::Arc;

use tempfile::TempDir;
use vmkeeper::cancel::CancelToken;
use vmkeeper::config::VmDefaults;
use vmkeeper::registry::mock::{MockRegistry, PublishOptions};
use vmkeeper::registry::Puller;
use vmkeeper::units::{GB, MB};
use vmkeeper::vm::display::MockDisplay;
use vmkeeper::vm::mock::MockHypervisor;
use vmkeeper::vm::{
    Controller, CreateOptions, OsKind, RunOptions, RuntimeState, StorageLayout, VmConfigUpdate, VmError, VmSource,
};

struct Harness {
    tmp: TempDir,
    registry: Arc<MockRegistry>,
    hypervisor: Arc<MockHypervisor>,
    display: Arc<MockDisplay>,
    controller: Controller,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    let hypervisor = Arc::new(MockHypervisor::new());
    let display = Arc::new(MockDisplay::new());
    let puller = Arc::new(Puller::new(registry.clone(), &tmp.path().join("cache"), "vmkeeper", 4));
    let defaults = VmDefaults {
        stop_timeout_secs: 2,
        lock_timeout_secs: 2,
        disk_size: 8 * MB,
        memory: GB,
        ..Default::default()
    };
    let controller = Controller::new(
        StorageLayout::single(tmp.path().join("vms")),
        hypervisor.clone(),
        display.clone(),
        defaults,
    )
    .with_puller(puller);
    Harness {
        tmp,
        registry,
        hypervisor,
        display,
        controller,
    }
}

fn image_disk() -> Vec<u8> {
    let mut disk = vec![0u8; 256 * 1024];
    disk[..4096].fill(0xeb);
    disk[200_000..200_100].fill(0x42);
    disk
}

#[tokio::test]
async fn image_to_running_vm_and_back() {
    let h = harness();
    let disk = image_disk();
    h.registry.publish_image(
        "vmkeeper/debian",
        "12",
        &disk,
        64 * 1024,
        PublishOptions {
            nvram: Some(vec![0x11; 128]),
            vm_config: Some(serde_json::json!({ "os": "linux", "cpuCount": 3 })),
            ..Default::default()
        },
    );

    let (record, vm) = h
        .controller
        .pull("debian:12", Some("web"), None, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(record.uncompressed_size, disk.len() as u64);
    let vm = vm.unwrap();
    assert_eq!(vm.config.os, OsKind::Linux);
    assert_eq!(vm.config.cpu_count, 3);
    assert!(vm.config.disk_size >= disk.len() as u64);

    // the VM disk starts with the image and was grown to the configured size
    let vm_disk = std::fs::read(vm.path.join("disk.img")).unwrap();
    assert_eq!(vm_disk.len() as u64, vm.config.disk_size);
    assert_eq!(&vm_disk[..disk.len()], &disk[..]);
    assert_eq!(std::fs::read(vm.path.join("nvram.bin")).unwrap(), vec![0x11; 128]);

    let running = h
        .controller
        .run("web", RunOptions::default(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(running.state, RuntimeState::Running);
    let url = running.display_url.clone().unwrap();
    assert_eq!(h.display.active_url("web"), Some(url));

    let err = h
        .controller
        .update_settings("web", None, &VmConfigUpdate { cpu_count: Some(8), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::MustBeStopped { .. }));

    assert_eq!(h.controller.pause("web", None).await.unwrap().state, RuntimeState::Paused);
    assert_eq!(h.controller.resume("web", None).await.unwrap().state, RuntimeState::Running);
    assert_eq!(h.controller.stop("web", None).await.unwrap().state, RuntimeState::Stopped);
    assert!(h.display.active_url("web").is_none());

    let grown = h
        .controller
        .update_settings(
            "web",
            None,
            &VmConfigUpdate {
                disk_size: Some(16 * MB),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(grown.disk_size, 16 * MB);
    assert_eq!(std::fs::metadata(vm.path.join("disk.img")).unwrap().len(), 16 * MB);

    let copy = h.controller.clone_vm("web", "web-2", None, None).await.unwrap();
    assert_eq!(copy.config.disk_size, 16 * MB);
    assert_ne!(copy.config.mac_address, grown.mac_address);

    let names: Vec<String> = h.controller.list().await.unwrap().into_iter().map(|d| d.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"web".to_string()) && names.contains(&"web-2".to_string()));

    h.controller.delete("web", None).await.unwrap();
    h.controller.delete("web-2", None).await.unwrap();
    assert!(h.controller.list().await.unwrap().is_empty());
    assert!(matches!(
        h.controller.get("web", None).await,
        Err(VmError::NotFound(_))
    ));

    // the image outlives the VMs created from it
    assert_eq!(h.controller.puller().unwrap().images().await.unwrap().len(), 1);
    assert!(h.tmp.path().join("cache").exists());
}

#[tokio::test]
async fn create_from_image_rejects_smaller_disk() {
    let h = harness();
    h.registry
        .publish_image("vmkeeper/tiny", "latest", &image_disk(), 64 * 1024, PublishOptions::default());

    let options = CreateOptions {
        disk_size: Some(64 * 1024),
        source: VmSource::Image("tiny".to_string()),
        ..Default::default()
    };
    let err = h
        .controller
        .create("small", options, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::ResizeTooSmall { .. }), "got {err:?}");
    assert!(h.controller.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn run_with_image_creates_missing_vm() {
    let h = harness();
    h.registry
        .publish_image("vmkeeper/alpine", "3", &image_disk(), 128 * 1024, PublishOptions::default());

    let options = RunOptions {
        display: false,
        image: Some("alpine:3".to_string()),
        ..Default::default()
    };
    let details = h.controller.run("edge", options, &CancelToken::new()).await.unwrap();
    assert_eq!(details.state, RuntimeState::Running);
    assert!(details.display_url.is_none());
    assert_eq!(h.hypervisor.call_count("start"), 1);

    h.controller.stop("edge", None).await.unwrap();
}
