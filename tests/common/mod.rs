//! Common test utilities
#![allow(dead_code)]

use devctx::Place;
use devctx::registry::{ContextRegistry, RegistryBuilder};
use devctx::runtime::emulated::{EmulatedBackend, Event};
use std::sync::{Arc, Once};

/// Route `tracing` output to the test harness once per binary
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Builder preloaded with an emulated backend of `devices` accelerators
pub fn emulated_builder(devices: usize) -> (Arc<EmulatedBackend>, RegistryBuilder) {
    init_tracing();
    let emu = Arc::new(EmulatedBackend::new(devices));
    let builder = RegistryBuilder::new()
        .accelerator(emu.accelerator_backend())
        .allocator(emu.allocator());
    (emu, builder)
}

/// Registry over `places` on a fresh emulated backend
pub fn emulated_registry(
    devices: usize,
    places: impl IntoIterator<Item = Place>,
) -> (Arc<EmulatedBackend>, ContextRegistry) {
    let (emu, builder) = emulated_builder(devices);
    let registry = builder
        .places(places)
        .build()
        .expect("emulated registry should build");
    (emu, registry)
}

/// Index of the first event matching `pred`
pub fn position(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("no matching event in {:#?}", events))
}
