//! Context registry
//!
//! A [`ContextRegistry`] owns exactly one [`ExecutionContext`] per distinct
//! [`Place`]. Every context is built up front; lookups never construct. The
//! key set is fixed after construction, so concurrent `get` needs no lock.
//!
//! ```rust,ignore
//! use devctx::prelude::*;
//!
//! let registry = RegistryBuilder::new()
//!     .places(Place::parse_list("cpu,gpu:0")?)
//!     .build()?;
//!
//! let gpu = registry.accelerator(0)?;
//! gpu.run_with_workspace(1 << 20, |ws| launch(ws.ptr(), gpu.stream()))?;
//! gpu.wait()?;
//! ```

use crate::context::{AcceleratorContext, BlobCacheContext, ExecutionContext, HostContext};
use crate::error::{Error, Result};
use crate::place::Place;
use crate::runtime::{AcceleratorBackend, Allocator, HostAllocator};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

/// Which context serves [`Place::Host`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostVariant {
    /// Plain host context
    #[default]
    Plain,
    /// Host context with a per-thread object cache
    BlobCache,
}

/// Startup configuration for a [`ContextRegistry`]
///
/// Without an explicit backend, accelerator and pinned places are only
/// accepted when the `cuda` feature supplies one. Without an explicit
/// allocator, the CUDA allocator is used alongside the CUDA default backend
/// and [`HostAllocator`] otherwise. An explicit backend serving accelerator
/// places must come with an explicit allocator.
#[derive(Default)]
pub struct RegistryBuilder {
    places: Vec<Place>,
    host_variant: HostVariant,
    allocator: Option<Arc<dyn Allocator>>,
    backend: Option<AcceleratorBackend>,
}

impl RegistryBuilder {
    /// Start with no places
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one place
    pub fn place(mut self, place: Place) -> Self {
        self.places.push(place);
        self
    }

    /// Add places; duplicates are collapsed at build time
    pub fn places(mut self, places: impl IntoIterator<Item = Place>) -> Self {
        self.places.extend(places);
        self
    }

    /// Choose the host context variant
    pub fn host_variant(mut self, variant: HostVariant) -> Self {
        self.host_variant = variant;
        self
    }

    /// Allocator shared by every context
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Accelerator capabilities for accelerator and pinned places
    pub fn accelerator(mut self, backend: AcceleratorBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build one context per distinct place
    ///
    /// On failure, contexts built so far are torn down before the error is
    /// returned.
    pub fn build(self) -> Result<ContextRegistry> {
        if self.places.is_empty() {
            return Err(Error::EmptyPlaceSet);
        }

        let unique: BTreeSet<Place> = self.places.into_iter().collect();

        // A caller-supplied backend brings its own memory; the host
        // allocator cannot stand in for it.
        let missing_allocator = self.backend.is_some() && self.allocator.is_none();
        if let Some(&place) = unique.iter().find(|p| missing_allocator && p.is_accelerator()) {
            return Err(Error::unsupported_place(
                place,
                "an explicit accelerator backend needs an explicit allocator",
            ));
        }

        let needs_backend = unique.iter().any(|p| !p.is_host());
        let (backend, allocator) = resolve_capabilities(self.backend, self.allocator, needs_backend);

        tracing::debug!(places = unique.len(), "building context registry");

        // Contexts go straight into the registry so an early return tears
        // down the ones already built.
        let mut registry = ContextRegistry {
            contexts: BTreeMap::new(),
        };
        for place in unique {
            let context = match place {
                Place::Host => match self.host_variant {
                    HostVariant::Plain => {
                        ExecutionContext::Host(HostContext::new(place, allocator.clone()))
                    }
                    HostVariant::BlobCache => {
                        ExecutionContext::BlobCache(BlobCacheContext::new(allocator.clone()))
                    }
                },
                Place::HostPinned => {
                    if backend.is_none() {
                        return Err(Error::unsupported_place(
                            place,
                            "no accelerator backend is configured",
                        ));
                    }
                    ExecutionContext::Pinned(HostContext::new(place, allocator.clone()))
                }
                Place::Accelerator(device) => {
                    let backend = backend.clone().ok_or_else(|| {
                        Error::unsupported_place(place, "no accelerator backend is configured")
                    })?;
                    ExecutionContext::Accelerator(AcceleratorContext::new(
                        device,
                        backend,
                        allocator.clone(),
                    )?)
                }
            };
            tracing::debug!(%place, kind = context.kind(), "context ready");
            registry.contexts.insert(place, context);
        }

        Ok(registry)
    }
}

#[cfg(feature = "cuda")]
fn resolve_capabilities(
    backend: Option<AcceleratorBackend>,
    allocator: Option<Arc<dyn Allocator>>,
    needs_backend: bool,
) -> (Option<AcceleratorBackend>, Arc<dyn Allocator>) {
    use crate::runtime::cuda::{cuda_allocator, cuda_backend};

    match backend {
        Some(backend) => (
            Some(backend),
            allocator.unwrap_or_else(|| Arc::new(HostAllocator::new())),
        ),
        None if needs_backend => (
            Some(cuda_backend()),
            allocator.unwrap_or_else(cuda_allocator),
        ),
        None => (None, allocator.unwrap_or_else(|| Arc::new(HostAllocator::new()))),
    }
}

#[cfg(not(feature = "cuda"))]
fn resolve_capabilities(
    backend: Option<AcceleratorBackend>,
    allocator: Option<Arc<dyn Allocator>>,
    _needs_backend: bool,
) -> (Option<AcceleratorBackend>, Arc<dyn Allocator>) {
    (
        backend,
        allocator.unwrap_or_else(|| Arc::new(HostAllocator::new())),
    )
}

/// Owner of every execution context, keyed by place
pub struct ContextRegistry {
    contexts: BTreeMap<Place, ExecutionContext>,
}

impl ContextRegistry {
    /// Build a registry for `places` with default configuration
    pub fn new(places: impl IntoIterator<Item = Place>) -> Result<Self> {
        RegistryBuilder::new().places(places).build()
    }

    /// Start configuring a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Context for `place`
    pub fn get(&self, place: Place) -> Result<&ExecutionContext> {
        self.contexts
            .get(&place)
            .ok_or(Error::PlaceNotRegistered { place })
    }

    /// Accelerator context for device `index`
    pub fn accelerator(&self, index: usize) -> Result<&AcceleratorContext> {
        let place = Place::Accelerator(index);
        self.get(place)?
            .as_accelerator()
            .ok_or(Error::PlaceNotRegistered { place })
    }

    /// Every context, one per registered place
    ///
    /// The order is unspecified.
    pub fn all(&self) -> Vec<&ExecutionContext> {
        self.contexts.values().collect()
    }

    /// Registered places
    pub fn places(&self) -> impl Iterator<Item = Place> + '_ {
        self.contexts.keys().copied()
    }

    /// Is there a context for `place`?
    pub fn contains(&self, place: Place) -> bool {
        self.contexts.contains_key(&place)
    }

    /// Number of contexts
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Always false for a built registry
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl Index<Place> for ContextRegistry {
    type Output = ExecutionContext;

    fn index(&self, place: Place) -> &ExecutionContext {
        match self.contexts.get(&place) {
            Some(context) => context,
            None => panic!("{}", Error::PlaceNotRegistered { place }),
        }
    }
}

impl Drop for ContextRegistry {
    fn drop(&mut self) {
        // Reverse construction order.
        while let Some((place, context)) = self.contexts.pop_last() {
            tracing::debug!(%place, "dropping context");
            drop(context);
        }
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.contexts.iter().map(|(place, ctx)| (place, ctx.kind())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::emulated::EmulatedBackend;
    use proptest::prelude::*;

    fn emulated_builder(devices: usize) -> (Arc<EmulatedBackend>, RegistryBuilder) {
        let emu = Arc::new(EmulatedBackend::new(devices));
        let builder = RegistryBuilder::new()
            .accelerator(emu.accelerator_backend())
            .allocator(emu.allocator());
        (emu, builder)
    }

    #[test]
    fn test_empty_place_set_fails() {
        assert!(matches!(
            ContextRegistry::new(Vec::new()),
            Err(Error::EmptyPlaceSet)
        ));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_accelerator_without_backend_is_unsupported() {
        let err = ContextRegistry::new([Place::Host, Place::Accelerator(0)]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedPlace {
                place: Place::Accelerator(0),
                ..
            }
        ));

        let err = ContextRegistry::new([Place::HostPinned]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlace { .. }));
    }

    #[test]
    fn test_explicit_backend_requires_allocator() {
        let emu = Arc::new(EmulatedBackend::new(1));
        let err = RegistryBuilder::new()
            .places([Place::Host, Place::Accelerator(0)])
            .accelerator(emu.accelerator_backend())
            .build()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::UnsupportedPlace {
                place: Place::Accelerator(0),
                ..
            }
        ));
        assert!(err.to_string().contains("allocator"));
        assert_eq!(emu.live_streams(), 0);

        // Pinned memory is host memory, so the host allocator still serves it.
        let registry = RegistryBuilder::new()
            .place(Place::HostPinned)
            .accelerator(emu.accelerator_backend())
            .build()
            .unwrap();
        assert_eq!(registry[Place::HostPinned].kind(), "pinned");
    }

    #[test]
    fn test_host_only_registry() {
        let registry = ContextRegistry::new([Place::Host, Place::Host]).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[Place::Host].kind(), "host");
        assert!(matches!(
            registry.get(Place::HostPinned),
            Err(Error::PlaceNotRegistered { .. })
        ));
    }

    #[test]
    fn test_blob_cache_variant_replaces_plain_host() {
        let registry = RegistryBuilder::new()
            .place(Place::Host)
            .host_variant(HostVariant::BlobCache)
            .build()
            .unwrap();

        let ctx = registry.get(Place::Host).unwrap();
        assert!(ctx.as_blob_cache().is_some());
        assert_eq!(ctx.place(), Place::Host);
    }

    #[test]
    fn test_variants_follow_place_kind() {
        let (_emu, builder) = emulated_builder(2);
        let registry = builder
            .places([Place::Accelerator(1), Place::HostPinned, Place::Host])
            .build()
            .unwrap();

        assert_eq!(registry[Place::Host].kind(), "host");
        assert_eq!(registry[Place::HostPinned].kind(), "pinned");
        assert_eq!(registry[Place::Accelerator(1)].kind(), "accelerator");
        assert_eq!(registry.accelerator(1).unwrap().device_index(), 1);
        assert!(registry.accelerator(0).is_err());
    }

    #[test]
    fn test_failed_build_tears_down_built_contexts() {
        let (emu, builder) = emulated_builder(1);
        let result = builder
            .places([Place::Accelerator(0), Place::Accelerator(5)])
            .build();

        assert!(matches!(result, Err(Error::InvalidDevice { device: 5, .. })));
        assert_eq!(emu.live_streams(), 0);
        assert_eq!(emu.live_blas_handles(), 0);
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn test_index_panics_on_unregistered_place() {
        let registry = ContextRegistry::new([Place::Host]).unwrap();
        let _ = &registry[Place::Accelerator(0)];
    }

    fn place_strategy() -> impl Strategy<Value = Place> {
        prop_oneof![
            Just(Place::Host),
            Just(Place::HostPinned),
            (0usize..4).prop_map(Place::Accelerator),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_context_per_distinct_place(
            places in prop::collection::vec(place_strategy(), 1..12)
        ) {
            let (emu, builder) = emulated_builder(4);
            let registry = builder.places(places.iter().copied()).build().unwrap();

            let distinct: BTreeSet<Place> = places.iter().copied().collect();
            prop_assert_eq!(registry.len(), distinct.len());
            for place in &distinct {
                prop_assert_eq!(registry.get(*place).unwrap().place(), *place);
            }

            let accelerators = distinct.iter().filter(|p| p.is_accelerator()).count();
            prop_assert_eq!(emu.live_streams(), accelerators);
            drop(registry);
            prop_assert_eq!(emu.live_streams(), 0);
        }
    }
}
