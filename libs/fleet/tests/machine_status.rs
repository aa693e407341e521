//! End-to-end machine status reconciliation: a real store and controller
//! runtime driving the `MachineStatus` controller against a mock node.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use anvil_runtime::{Backoff, ControllerRuntime, RuntimeOptions};
use anvil_state::{Actor, Phase, Resource, StateError, Store, Version};

use anvil_fleet::client::{remote, NodeResource};
use anvil_fleet::collector::CollectorConfig;
use anvil_fleet::controllers::MachineStatusController;
use anvil_fleet::meta::LABELS_META_KEY;
use anvil_fleet::mock::MockNode;
use anvil_fleet::resources::{
    labels, machine_labels_ref, machine_ref, machine_status_ref, machine_status_snapshot_ref,
    new_machine, new_machine_labels, new_machine_status_snapshot, FleetSpec, MachineSpec,
    MachineStatusSnapshotSpec, MachineStatusSpec,
};
use anvil_fleet::schematic::{DEFAULT_SCHEMATIC_ID, SCHEMATIC_ID_EXTENSION_DESCRIPTION};

const MACHINE: &str = "m1";

struct FleetHarness {
    store: Store<FleetSpec>,
    node: MockNode,
    shutdown: watch::Sender<bool>,
    runtime: JoinHandle<()>,
}

impl FleetHarness {
    async fn start() -> Self {
        let store = Store::new();
        let node = MockNode::new();

        let controller = MachineStatusController::new(
            node.connector(),
            CollectorConfig {
                poll_interval: Duration::from_millis(50),
                connect_backoff: Backoff {
                    initial: Duration::from_millis(10),
                    cap: Duration::from_millis(100),
                    jitter: 0.0,
                },
            },
        );

        let mut runtime = ControllerRuntime::new(store.clone());
        runtime
            .register_with_options(
                controller,
                RuntimeOptions {
                    degree: 1,
                    reconcile_timeout: Duration::from_secs(5),
                    backoff: Backoff {
                        initial: Duration::from_millis(10),
                        cap: Duration::from_millis(100),
                        jitter: 0.0,
                    },
                },
            )
            .unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runtime = tokio::spawn(runtime.run(shutdown_rx));

        Self {
            store,
            node,
            shutdown,
            runtime,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.runtime.await;
    }

    fn create_machine(&self, connected: bool) {
        self.store
            .create(
                new_machine(
                    MACHINE,
                    MachineSpec {
                        connected,
                        management_address: format!("mock://{MACHINE}"),
                    },
                ),
                &Actor::external(),
            )
            .unwrap();
    }

    fn set_connected(&self, connected: bool) {
        self.store
            .update_with_retry(&machine_ref(MACHINE), &Actor::external(), |res| {
                if let FleetSpec::Machine(spec) = res.spec_mut() {
                    spec.connected = connected;
                }
                Ok(())
            })
            .unwrap();
    }

    /// Poll until the stored status satisfies the predicate, in the spirit
    /// of an eventual-consistency assertion.
    async fn assert_status<F>(&self, what: &str, check: F)
    where
        F: Fn(&Resource<FleetSpec>, &MachineStatusSpec) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);

        while Instant::now() < deadline {
            if let Some(status) = self.store.find(&machine_status_ref(MACHINE)) {
                if let Some(spec) = status.spec().as_machine_status() {
                    if check(&status, spec) {
                        return;
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("machine status never reached: {what}");
    }

    async fn assert_status_gone(&self, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);

        while Instant::now() < deadline {
            if self.store.find(&machine_status_ref(MACHINE)).is_none() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("machine status still present: {what}");
    }
}

fn has_label(res: &Resource<FleetSpec>, key: &str) -> bool {
    res.metadata().labels.contains_key(key)
}

fn label<'a>(res: &'a Resource<FleetSpec>, key: &str) -> Option<&'a str> {
    res.metadata().labels.get(key).map(String::as_str)
}

#[tokio::test]
async fn test_connected_flag_toggles() {
    let harness = FleetHarness::start().await;

    harness.create_machine(true);

    harness
        .assert_status("connected with label", |res, spec| {
            spec.connected && has_label(res, labels::CONNECTED)
        })
        .await;

    harness.set_connected(false);

    harness
        .assert_status("disconnected without label", |res, spec| {
            !spec.connected && !has_label(res, labels::CONNECTED)
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_reporting_events_follows_snapshot() {
    let harness = FleetHarness::start().await;

    harness.create_machine(false);
    harness
        .store
        .create(
            new_machine_status_snapshot(
                MACHINE,
                MachineStatusSnapshotSpec {
                    last_event: "running".into(),
                },
            ),
            &Actor::external(),
        )
        .unwrap();

    harness
        .assert_status("reporting-events set", |res, _| {
            has_label(res, labels::REPORTING_EVENTS)
        })
        .await;

    harness
        .store
        .destroy(&machine_status_snapshot_ref(MACHINE), &Actor::external())
        .unwrap();

    harness
        .assert_status("reporting-events cleared", |res, _| {
            !has_label(res, labels::REPORTING_EVENTS)
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_user_labels_overlay_image_labels() {
    let harness = FleetHarness::start().await;

    harness.node.insert(NodeResource::MetaKey {
        id: LABELS_META_KEY.into(),
        value: r#"{"machineLabels": {"label1": "value1"}}"#.into(),
    });

    harness.create_machine(true);

    // Image labels flow into the spec and the metadata labels.
    harness
        .assert_status("initial image labels", |res, spec| {
            spec.image_labels.is_some() && label(res, "label1") == Some("value1")
        })
        .await;

    // User labels merge in; empty values are preserved.
    harness
        .store
        .create(new_machine_labels(MACHINE), &Actor::external())
        .unwrap();
    harness
        .store
        .update_with_retry(&machine_labels_ref(MACHINE), &Actor::external(), |res| {
            res.metadata_mut().labels.insert("test".into(), String::new());
            Ok(())
        })
        .unwrap();

    harness
        .assert_status("user label joins image label", |res, _| {
            label(res, "label1") == Some("value1") && label(res, "test") == Some("")
        })
        .await;

    // A user override wins over the image value.
    harness
        .store
        .update_with_retry(&machine_labels_ref(MACHINE), &Actor::external(), |res| {
            res.metadata_mut().labels.insert("label1".into(), "gasp".into());
            Ok(())
        })
        .unwrap();

    harness
        .assert_status("user override wins", |res, _| {
            label(res, "label1") == Some("gasp")
        })
        .await;

    // Destroying the user labels reverts to the image value.
    harness
        .store
        .destroy(&machine_labels_ref(MACHINE), &Actor::external())
        .unwrap();

    harness
        .assert_status("image value restored", |res, _| {
            label(res, "label1") == Some("value1")
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_overlay_precedence_across_image_update() {
    let harness = FleetHarness::start().await;

    harness.node.insert(NodeResource::MetaKey {
        id: LABELS_META_KEY.into(),
        value: r#"{"machineLabels": {"label1": "value1"}}"#.into(),
    });

    harness.create_machine(true);

    let mut machine_labels = new_machine_labels(MACHINE);
    machine_labels
        .metadata_mut()
        .labels
        .insert("label2".into(), "aaa".into());
    harness
        .store
        .create(machine_labels, &Actor::external())
        .unwrap();

    harness
        .assert_status("user label present", |res, _| {
            label(res, "label1") == Some("value1") && label(res, "label2") == Some("aaa")
        })
        .await;

    // The image updates both keys; the user's label2 still wins.
    harness.node.replace(
        remote::RUNTIME_NAMESPACE,
        remote::META_KEY,
        vec![NodeResource::MetaKey {
            id: LABELS_META_KEY.into(),
            value: r#"{"machineLabels": {"label1": "updated", "label2": "override"}}"#.into(),
        }],
    );

    harness
        .assert_status("image update with user precedence", |res, _| {
            label(res, "label1") == Some("updated") && label(res, "label2") == Some("aaa")
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_schematic_id_from_marker_extension() {
    let harness = FleetHarness::start().await;

    harness.node.insert(NodeResource::ExtensionStatus {
        name: "schematic".into(),
        version: "1234".into(),
        description: SCHEMATIC_ID_EXTENSION_DESCRIPTION.into(),
    });

    harness.create_machine(true);

    harness
        .assert_status("explicit schematic id", |_, spec| {
            spec.schematic
                .as_ref()
                .is_some_and(|schematic| schematic.id == "1234" && !schematic.invalid)
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_schematic_invalid_then_default() {
    let harness = FleetHarness::start().await;

    harness.node.insert(NodeResource::ExtensionStatus {
        name: "unknown".into(),
        version: "1".into(),
        description: "unknown".into(),
    });

    harness.create_machine(true);

    harness
        .assert_status("unknown extension means invalid", |_, spec| {
            spec.schematic.as_ref().is_some_and(|schematic| schematic.invalid)
        })
        .await;

    // No extensions at all resolves to the vanilla schematic.
    harness
        .node
        .clear(remote::RUNTIME_NAMESPACE, remote::EXTENSION_STATUS);

    harness
        .assert_status("vanilla autodetect", |_, spec| {
            spec.schematic
                .as_ref()
                .is_some_and(|schematic| schematic.id == DEFAULT_SCHEMATIC_ID && !schematic.invalid)
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_status_retained_across_disconnect() {
    let harness = FleetHarness::start().await;

    harness.node.insert(NodeResource::HostnameStatus {
        hostname: "node-1".into(),
        domainname: "fleet".into(),
    });

    harness.create_machine(true);

    harness
        .assert_status("hostname collected", |_, spec| {
            spec.network.hostname.as_deref() == Some("node-1")
        })
        .await;

    // Disconnecting keeps the status and its last collected state; only the
    // connected flag and label drop.
    harness.set_connected(false);

    harness
        .assert_status("status retained with last info", |res, spec| {
            !spec.connected
                && !has_label(res, labels::CONNECTED)
                && spec.network.hostname.as_deref() == Some("node-1")
        })
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_idempotent_reconcile_suppresses_writes() {
    let harness = FleetHarness::start().await;

    harness.node.insert(NodeResource::HostnameStatus {
        hostname: "node-1".into(),
        domainname: "fleet".into(),
    });
    harness.node.set_version("v1.7.5", "amd64");

    harness.create_machine(true);

    harness
        .assert_status("fully collected", |_, spec| {
            spec.network.hostname.is_some() && spec.talos_version.is_some() && spec.schematic.is_some()
        })
        .await;

    // Settle, then confirm steady-state reconciles write nothing even while
    // interval pollers keep signaling.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let version = harness
        .store
        .get(&machine_status_ref(MACHINE))
        .unwrap()
        .metadata()
        .version;

    // Touching the machine without changing it must also be write-free.
    harness
        .store
        .update_with_retry(&machine_ref(MACHINE), &Actor::external(), |_| Ok(()))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        harness
            .store
            .get(&machine_status_ref(MACHINE))
            .unwrap()
            .metadata()
            .version,
        version,
        "steady-state reconciles must not write"
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_only_the_controller_writes_status() {
    let harness = FleetHarness::start().await;

    harness.create_machine(true);
    harness.assert_status("status exists", |_, _| true).await;

    let err = harness
        .store
        .update(
            &machine_status_ref(MACHINE),
            Version::UNDEFINED,
            &Actor::external(),
            |_| Ok(()),
        )
        .unwrap_err();
    assert!(matches!(err, StateError::OwnerConflict { .. }));

    let err = harness
        .store
        .update(
            &machine_status_ref(MACHINE),
            Version::UNDEFINED,
            &Actor::controller("Impostor"),
            |_| Ok(()),
        )
        .unwrap_err();
    assert!(matches!(err, StateError::OwnerConflict { .. }));

    harness.stop().await;
}

#[tokio::test]
async fn test_machine_destroy_tears_down_status() {
    let harness = FleetHarness::start().await;

    harness.create_machine(true);
    harness.assert_status("status exists", |_, _| true).await;

    // The controller pins the machine; destroy defers until the status is
    // cleaned up, then the machine goes too.
    let err = harness
        .store
        .destroy(&machine_ref(MACHINE), &Actor::external())
        .unwrap_err();
    assert!(matches!(err, StateError::PreconditionFailed { .. }));
    if let Some(machine) = harness.store.find(&machine_ref(MACHINE)) {
        assert_eq!(machine.metadata().phase, Phase::TearingDown);
    }

    harness.assert_status_gone("after machine destroy").await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.store.find(&machine_ref(MACHINE)).is_some() {
        assert!(Instant::now() < deadline, "machine not released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    harness.stop().await;
}
