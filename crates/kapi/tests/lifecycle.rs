//! Scenario tests over the pure decision layers: specification intake,
//! object synthesis, IP arithmetic and binding migration. Anything needing
//! a live cluster, database or Redis lives behind the respective service
//! structs and is exercised in cluster CI instead.

use std::collections::{BTreeSet, HashMap};

use kapi::config::{IpMode, SystemSettings};
use kapi::ippool::net;
use kapi::pod::build::{self, PodView, POD_UID_LABEL};
use kapi::pod::{spec, PodConfig};
use kapi::pstorage::names;
use kapi::reconciler::endpoints::{decide, BindingAction, PublicIpState};
use kapi::store::billing::Kube;
use kapi::Error;

fn standard_kube() -> Kube {
    Kube {
        id: 0,
        name: Some("Standard".to_owned()),
        cpu: 0.25,
        cpu_units: "Cores".to_owned(),
        memory: 64,
        memory_units: "MB".to_owned(),
        disk_space: 1,
        disk_space_units: "GB".to_owned(),
        included_traffic: 0,
    }
}

fn web_pod_config() -> PodConfig {
    serde_json::from_value(serde_json::json!({
        "containers": [{
            "name": "web",
            "image": "nginx",
            "kubes": 2,
            "ports": [{"containerPort": 80, "isPublic": true}]
        }],
        "restartPolicy": "Always"
    }))
    .expect("config decodes")
}

/// Submitting a web pod yields one RC (replicas=1, uid label everywhere)
/// and one Service carrying the public port.
#[test]
fn create_and_start_synthesis() {
    let mut config = web_pod_config();
    spec::normalize(&mut config).expect("normalize");
    spec::validate(
        "web",
        &config,
        0,
        &[0],
        None,
        &SystemSettings::default(),
    )
    .expect("a simple web pod is valid");

    let kube = standard_kube();
    let view = PodView {
        id: "0a51bb47-68d2-4b9e-a02e-04bd2b276e12".to_owned(),
        sid: "3f00c9e2-dd4e-43f4-9778-a3e4703e91c0".to_owned(),
        owner_id: 3,
        owner_is_internal: false,
        kube: &kube,
        config: &config,
    };

    let rc = build::replication_controller(&view);
    assert_eq!(rc["spec"]["replicas"], 1);
    assert_eq!(
        rc["spec"]["selector"][POD_UID_LABEL],
        "0a51bb47-68d2-4b9e-a02e-04bd2b276e12"
    );
    assert_eq!(
        rc["spec"]["template"]["spec"]["containers"][0]["imagePullPolicy"],
        "Always"
    );

    let service = build::service_object(&view, IpMode::Floating).expect("ports need a service");
    assert_eq!(service["spec"]["ports"][0]["name"], "c0-p0-public");
    assert_eq!(
        service["spec"]["selector"][POD_UID_LABEL],
        "0a51bb47-68d2-4b9e-a02e-04bd2b276e12"
    );
}

/// The quota gate accepts a pod exactly at the package limit and rejects
/// one kube more.
#[test]
fn quota_boundary() {
    let mut config = web_pod_config();
    let settings = SystemSettings {
        max_kubes_per_container: 20,
        persistent_disk_max_size: 10,
    };
    config.containers[0].kubes = 10;
    spec::validate("web", &config, 0, &[0], Some(10), &settings).expect("10 of 10 fits");
    config.containers[0].kubes = 11;
    let err = spec::validate("web", &config, 0, &[0], Some(10), &settings).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

/// Deleting a disk frees its (name, owner) slot for a replacement while
/// the old physical drive is still being collected under a new suffix.
#[test]
fn disk_name_reuse_across_delete() {
    let base = names::compose_drive_name("data", 3);
    assert_eq!(base, "data__SEPID__3");

    // First deletion: the replacement takes suffix _1.
    let replacement = names::next_drive_name(&base, [].into_iter());
    assert_eq!(replacement, "data__SEPID__3_1");

    // Deleting the replacement while _1 is still collecting: suffix _2.
    let second = names::next_drive_name(&base, [replacement.as_str()].into_iter());
    assert_eq!(second, "data__SEPID__3_2");

    // Both physical names still parse back to the same owner.
    for name in [base.as_str(), replacement.as_str()] {
        let parsed = names::parse_drive_name(name).expect("parses");
        assert_eq!(parsed.uid, Some(3));
    }
}

/// An endpoint event that moves a service's backing pod from node X to
/// node Y removes the binding on X and installs it on Y.
#[test]
fn public_ip_migration() {
    let state = PublicIpState {
        assigned_public_ip: Some("192.0.2.10".to_owned()),
        assigned_to: Some("nodeX".to_owned()),
        assigned_pod_ip: Some("10.1.0.5".to_owned()),
    };
    let action = decide(&state, true, Some(("nodeY", "10.2.0.9")));
    match action {
        BindingAction::Migrate {
            from,
            from_pod_ip,
            to,
            pod_ip,
        } => {
            assert_eq!(from, "nodeX");
            assert_eq!(from_pod_ip, "10.1.0.5");
            assert_eq!(to, "nodeY");
            assert_eq!(pod_ip, "10.2.0.9");
        }
        other => panic!("expected migration, got {:?}", other),
    }
}

/// Pool arithmetic: allocation scans pages in order, autoblock is a set
/// union, and exhausting a pool is detected.
#[test]
fn pool_allocation_walk() {
    let network = net::parse_network("10.0.0.0/23").expect("network");
    assert_eq!(net::pages(&network), 2);

    let blocked = net::parse_autoblock("10.0.0.0-10.0.0.255").expect("autoblock");
    assert_eq!(blocked.len(), 256);

    // The whole first page blocked: allocation lands on page two.
    let first = net::first_free_host(&network, &blocked).expect("free host");
    assert_eq!(net::int_to_ip(first), "10.0.1.0");

    // Block the second page too and the pool is exhausted.
    let all: BTreeSet<u32> = net::parse_autoblock("10.0.0.0-10.0.1.255").expect("autoblock");
    assert_eq!(net::first_free_host(&network, &all), None);
}

/// Applying the same container event twice produces identical timeline
/// rows: the upsert key makes redelivery harmless.
#[test]
fn reconciler_event_idempotence() {
    use chrono::NaiveDate;
    use kapi::reconciler::pods::timeline_rows;
    use uuid::Uuid;

    let statuses: Vec<k8s_openapi::api::core::v1::ContainerStatus> =
        vec![serde_json::from_value(serde_json::json!({
            "name": "web",
            "ready": true,
            "image": "nginx",
            "imageID": "sha:1",
            "restartCount": 0,
            "containerID": "docker://abc",
            "state": {"running": {"startedAt": "2016-05-01T10:00:00Z"}}
        }))
        .expect("status decodes")];
    let kubes = HashMap::from([("web".to_owned(), 2)]);
    let now = NaiveDate::from_ymd(2016, 5, 1).and_hms(12, 0, 0);

    let first = timeline_rows(Uuid::nil(), &kubes, &statuses, false, now);
    let second = timeline_rows(Uuid::nil(), &kubes, &statuses, false, now);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].start_time, second[0].start_time);
    assert_eq!(first[0].docker_id, second[0].docker_id);
    assert_eq!(first[0].kubes, second[0].kubes);
    assert_eq!(first[0].end_time, second[0].end_time);
}
