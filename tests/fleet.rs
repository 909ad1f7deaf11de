mod common;

use std::time::Duration;

use common::{MemoryFleet, declared, desired, quick_options, value};
use esxctl::builder::{self, BuildOptions};
use esxctl::cache::{CacheValidity, StateCache};
use esxctl::error::FleetError;
use esxctl::fleet::Reachability;
use esxctl::model::{AttrKey, VmPath};
use esxctl::probe::ProbeError;
use esxctl::reconcile::{DiffRequest, DiffWarning, Policy, diff};
use tokio_util::sync::CancellationToken;

// ── Collisions ───────────────────────────────────────────

#[tokio::test]
async fn same_name_on_two_hosts_is_one_collision() {
    let state = desired(
        &["esx1", "esx2", "esx3"],
        vec![declared("dup", "esx1", &[(AttrKey::Memory, value("1024"))])],
    );
    let fleet = MemoryFleet::new()
        .with_host("esx1", &[("dup", &[(AttrKey::Memory, "1024")])])
        .with_host("esx2", &[("dup", &[(AttrKey::Memory, "2048")])])
        .with_host("esx3", &[("solo", &[])]);

    let outcome = common::probe_all(&fleet, &state).await;
    let map = &outcome.map;

    assert_eq!(map.collisions().len(), 1);
    let collision = &map.collisions()[0];
    assert_eq!(collision.name, "dup");
    assert_eq!(collision.hosts, vec!["esx1".to_string(), "esx2".to_string()]);
    assert!(map.get("dup").is_none(), "no instance may be picked");
    assert!(map.get("solo").is_some());

    let (plan, warnings) = diff(&state, map, &DiffRequest::default());
    assert!(plan.is_empty());
    assert!(matches!(&warnings[..], [DiffWarning::Collision { vm, .. }] if vm == "dup"));
}

#[tokio::test]
async fn resolving_a_collision_leaves_a_stray() {
    let state = desired(&["esx1", "esx2"], Vec::new());
    let fleet = MemoryFleet::new()
        .with_host("esx1", &[("dup", &[])])
        .with_host("esx2", &[("dup", &[])]);
    let map = common::probe_all(&fleet, &state).await.map;

    let resolved = map.resolve_collision("dup", "esx2").unwrap();
    assert!(resolved.collisions().is_empty());
    assert_eq!(resolved.get("dup").unwrap().host, "esx2");
    let strays = resolved.strays("dup");
    assert_eq!(strays.len(), 1);
    assert_eq!(strays[0].host, "esx1");

    assert!(map.resolve_collision("dup", "esx9").is_err());
}

#[tokio::test]
async fn preferred_instance_leaves_the_other_as_a_stray() {
    let state = desired(
        &["esx1", "esx2"],
        vec![declared("dup", "esx1", &[(AttrKey::Memory, value("1024"))])],
    );
    let fleet = MemoryFleet::new()
        .with_host("esx1", &[("dup", &[(AttrKey::Memory, "1024")])])
        .with_host("esx2", &[("dup", &[(AttrKey::Memory, "2048")])]);
    let map = common::probe_all(&fleet, &state).await.map;

    let prefer = vec!["esx1/dup".parse::<VmPath>().unwrap()];
    let resolved = map.resolve_preferred(&prefer).unwrap();
    assert!(resolved.collisions().is_empty());

    let (plan, warnings) = diff(&state, &resolved, &DiffRequest::default());
    assert!(plan.is_empty(), "{plan:?}");
    assert_eq!(
        warnings,
        [DiffWarning::Stray {
            vm: "dup".into(),
            declared_host: "esx1".into(),
            found_on: vec!["esx2".into()],
        }]
    );

    let relocate = DiffRequest::new(Policy {
        relocate: true,
        ..Policy::default()
    });
    let (plan, _) = diff(&state, &resolved, &relocate);
    let first = &plan.actions()[0];
    assert_eq!(first.host, "esx2");
    assert_eq!(first.kind.label(), "migrate-destroy-other");

    let nowhere = vec!["esx9/dup".parse::<VmPath>().unwrap()];
    assert!(matches!(
        map.resolve_preferred(&nowhere),
        Err(FleetError::UnknownVm { .. })
    ));
}

// ── Partial reachability ─────────────────────────────────

#[tokio::test]
async fn one_slow_host_of_three_is_left_out() {
    let state = desired(
        &["esx1", "esx2", "esx3"],
        vec![
            declared("a", "esx1", &[(AttrKey::Memory, value("1024"))]),
            declared("b", "esx2", &[(AttrKey::Memory, value("1024"))]),
            declared("c", "esx3", &[(AttrKey::Memory, value("4096"))]),
        ],
    );
    let fleet = MemoryFleet::new()
        .with_host("esx1", &[("a", &[(AttrKey::Memory, "512")])])
        .with_host("esx2", &[("b", &[(AttrKey::Memory, "1024")])])
        .with_host("esx3", &[("c", &[(AttrKey::Memory, "1024")])])
        .with_delay("esx3", Duration::from_secs(5));

    let options = BuildOptions {
        ignore_unreachable: true,
        ..quick_options()
    };
    let outcome = builder::build(
        &fleet,
        &state.hypervisors,
        &options,
        &(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let map = &outcome.map;
    assert!(map.is_partial());
    assert!(map.inventory("esx1").is_some());
    assert!(map.inventory("esx2").is_some());
    assert!(map.inventory("esx3").is_none());
    assert!(map.get("c").is_none());
    assert_eq!(map.reachability("esx3"), Reachability::Unreachable);

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].host, "esx3");
    assert!(outcome.errors[0].error.is_unreachable());

    let (plan, warnings) = diff(&state, map, &DiffRequest::default());
    assert!(plan.iter().all(|a| a.host != "esx3"));
    assert_eq!(plan.len(), 1, "only a's memory differs: {plan:?}");
    assert!(warnings.contains(&DiffWarning::HostUnavailable {
        vm: "c".into(),
        host: "esx3".into(),
    }));
}

#[tokio::test]
async fn unreachable_host_aborts_without_ignore() {
    let state = desired(&["esx1", "esx2"], Vec::new());
    let fleet = MemoryFleet::new()
        .with_host("esx1", &[])
        .with_unreachable("esx2");

    let err = builder::build(
        &fleet,
        &state.hypervisors,
        &quick_options(),
        &(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, FleetError::Unreachable { ref host, .. } if host == "esx2"));
}

#[tokio::test]
async fn probe_timeout_is_reported_as_unreachable() {
    let state = desired(&["slow"], Vec::new());
    let fleet = MemoryFleet::new()
        .with_host("slow", &[])
        .with_delay("slow", Duration::from_secs(5));
    let options = BuildOptions {
        ignore_unreachable: true,
        ..quick_options()
    };
    let outcome = builder::build(&fleet, &state.hypervisors, &options, &(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        &outcome.errors[0].error,
        ProbeError::Unreachable { transient: true, .. }
    ));
}

// ── Cache ────────────────────────────────────────────────

#[tokio::test]
async fn bypass_always_misses() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StateCache::new(dir.path().join("fleet.json"));
    let state = desired(&["esx1"], Vec::new());
    let fleet = MemoryFleet::new().with_host("esx1", &[("a", &[(AttrKey::Cpus, "2")])]);
    let map = common::probe_all(&fleet, &state).await.map;

    cache.store(&map).unwrap();
    let hit = cache
        .load(CacheValidity::Window(Duration::from_secs(300)))
        .expect("fresh entry is a hit");
    assert_eq!(hit.get("a").unwrap().live(AttrKey::Cpus), "2");

    assert!(cache.load(CacheValidity::Bypass).is_none());
    assert!(cache.load(CacheValidity::parse("bypass").unwrap()).is_none());
}

#[tokio::test]
async fn partial_maps_are_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = StateCache::new(dir.path().join("fleet.json"));
    let state = desired(&["esx1", "esx2"], Vec::new());
    let fleet = MemoryFleet::new()
        .with_host("esx1", &[])
        .with_unreachable("esx2");
    let options = BuildOptions {
        ignore_unreachable: true,
        ..quick_options()
    };
    let outcome = builder::build(&fleet, &state.hypervisors, &options, &(), &CancellationToken::new())
        .await
        .unwrap();

    cache.store(&outcome.map).unwrap();
    assert!(!cache.path().exists());
}
