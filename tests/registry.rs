//! Registry construction, lookup and teardown

mod common;

use common::{emulated_builder, emulated_registry, init_tracing};
use devctx::Place;
use devctx::error::Error;
use devctx::registry::{ContextRegistry, HostVariant};
use proptest::prelude::*;
use std::collections::BTreeSet;

#[test]
fn test_parsed_places_build_one_context_each() {
    let places = Place::parse_list("cpu, gpu:1, cuda:1, cuda_pinned, gpu:0, cpu").unwrap();
    let (_emu, registry) = emulated_registry(2, places);

    assert_eq!(registry.len(), 4);
    assert_eq!(
        registry.places().collect::<Vec<_>>(),
        vec![
            Place::Host,
            Place::HostPinned,
            Place::Accelerator(0),
            Place::Accelerator(1)
        ]
    );
    for place in registry.places() {
        assert_eq!(registry.get(place).unwrap().place(), place);
        assert_eq!(registry[place].device().place(), place);
    }
}

#[test]
fn test_lookup_never_constructs() {
    let (emu, registry) = emulated_registry(4, [Place::Accelerator(2)]);

    assert!(matches!(
        registry.get(Place::Accelerator(0)),
        Err(Error::PlaceNotRegistered {
            place: Place::Accelerator(0)
        })
    ));
    assert!(!registry.contains(Place::Accelerator(0)));
    assert_eq!(emu.live_streams(), 1);
}

#[test]
fn test_error_message_names_the_place() {
    let registry = ContextRegistry::new([Place::Host]).unwrap();
    let message = registry.get(Place::Accelerator(3)).unwrap_err().to_string();
    assert!(message.contains("gpu:3"));
    assert!(message.contains("not supported"));
}

#[test]
fn test_all_returns_every_context() {
    let (_emu, registry) = emulated_registry(2, [Place::Accelerator(1), Place::Host]);

    let mut kinds: Vec<_> = registry.all().iter().map(|c| c.kind()).collect();
    kinds.sort();
    assert_eq!(kinds, vec!["accelerator", "host"]);
    for ctx in registry.all() {
        ctx.wait().unwrap();
    }
}

#[test]
fn test_blob_cache_host_variant() {
    let (_emu, builder) = emulated_builder(1);
    let registry = builder
        .places([Place::Host, Place::Accelerator(0)])
        .host_variant(HostVariant::BlobCache)
        .build()
        .unwrap();

    assert_eq!(registry[Place::Host].kind(), "blob_cache");
    assert!(registry[Place::Accelerator(0)].as_blob_cache().is_none());
}

#[test]
fn test_drop_releases_every_resource() {
    let (emu, registry) = emulated_registry(
        3,
        [
            Place::Accelerator(0),
            Place::Accelerator(1),
            Place::Accelerator(2),
        ],
    );
    for index in 0..3 {
        registry
            .accelerator(index)
            .unwrap()
            .run_with_workspace(256, |_| ())
            .unwrap();
    }
    assert_eq!(emu.live_streams(), 3);
    assert_eq!(emu.live_allocations(), 3);

    drop(registry);
    assert_eq!(emu.live_streams(), 0);
    assert_eq!(emu.live_blas_handles(), 0);
    assert_eq!(emu.live_allocations(), 0);
    assert!(emu.violations().is_empty());
}

#[test]
fn test_concurrent_lookups() {
    let (_emu, registry) = emulated_registry(2, [Place::Host, Place::Accelerator(0), Place::Accelerator(1)]);

    std::thread::scope(|s| {
        for t in 0..8 {
            let registry = &registry;
            s.spawn(move || {
                let place = Place::Accelerator(t % 2);
                for _ in 0..100 {
                    assert_eq!(registry.get(place).unwrap().place(), place);
                }
                registry.accelerator(t % 2).unwrap().wait().unwrap();
            });
        }
    });
}

proptest! {
    #[test]
    fn prop_registry_holds_dedup_of_places(
        indices in prop::collection::vec(0usize..6, 1..16)
    ) {
        init_tracing();
        let places: Vec<Place> = indices
            .iter()
            .map(|&i| match i {
                0 => Place::Host,
                1 => Place::HostPinned,
                n => Place::Accelerator(n - 2),
            })
            .collect();

        let (_emu, registry) = emulated_registry(4, places.clone());
        let distinct: BTreeSet<Place> = places.into_iter().collect();

        prop_assert_eq!(registry.len(), distinct.len());
        prop_assert_eq!(registry.places().collect::<BTreeSet<_>>(), distinct.clone());
        for place in distinct {
            prop_assert_eq!(registry.get(place).unwrap().place(), place);
        }
    }
}
