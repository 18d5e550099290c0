//! Accelerator context behavior on the emulated backend

mod common;

use common::{emulated_registry, position};
use devctx::Place;
use devctx::context::ContextState;
use devctx::error::Error;
use devctx::registry::RegistryBuilder;
use devctx::runtime::Device;
use devctx::runtime::emulated::{EmulatedBackend, Event, FaultPoint};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_wait_completes_all_prior_work() {
    let (emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        emu.enqueue(ctx.stream(), move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    ctx.wait().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert_eq!(emu.completed_ops(ctx.stream()), emu.enqueued_ops(ctx.stream()));
    assert_eq!(emu.pending_ops(ctx.stream()), 0);
}

#[test]
fn test_wait_reports_async_fault() {
    let (emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();

    emu.inject_async_fault(ctx.stream(), "misaligned address");
    let err = ctx.wait().unwrap_err();
    assert!(matches!(err, Error::AsyncFault { device: 0, .. }));
}

#[test]
fn test_wait_reports_sticky_error() {
    let (emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();

    emu.inject_sticky_error(0, "launch failure");
    assert!(matches!(ctx.wait(), Err(Error::AsyncFault { .. })));
    ctx.wait().unwrap();
}

#[test]
fn test_workspace_never_shrinks() {
    let (_emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();

    for (request, expected) in [(64, 64), (4096, 4096), (64, 4096), (5000, 5000), (0, 5000)] {
        let len = ctx.run_with_workspace(request, |ws| ws.len()).unwrap();
        assert!(len >= request);
        assert_eq!(ctx.workspace_capacity(), expected);
    }
}

#[test]
fn test_failed_workspace_growth_keeps_capacity() {
    let (emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();
    ctx.run_with_workspace(4096, |_| ()).unwrap();

    emu.fail_next(FaultPoint::Allocate);
    assert!(matches!(
        ctx.run_with_workspace(8192, |_| ()),
        Err(Error::OutOfMemory { .. })
    ));
    assert_eq!(ctx.workspace_capacity(), 4096);

    let len = ctx.run_with_workspace(8192, |ws| ws.len()).unwrap();
    assert_eq!(len, 8192);
    assert_eq!(ctx.workspace_capacity(), 8192);

    drop(registry);
    assert_eq!(emu.live_allocations(), 0);
    assert!(emu.violations().is_empty(), "{:?}", emu.violations());
}

#[test]
fn test_workspace_growth_drains_in_flight_work_before_free() {
    let (emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();
    let stream = ctx.stream();

    // A kernel that reads the small workspace is still queued when the
    // next caller asks for more.
    let first = ctx
        .run_with_workspace(256, |ws| {
            let ptr = ws.ptr();
            emu.enqueue(stream, move || {
                // SAFETY: the workspace stays allocated until this runs.
                let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, 256) };
                assert!(bytes.iter().all(|&b| b == 0));
            })
            .unwrap();
            ptr
        })
        .unwrap();
    emu.clear_events();

    let second = ctx.run_with_workspace(1024, |ws| ws.ptr()).unwrap();
    assert_ne!(first, 0);
    assert_ne!(second, 0);

    let events = emu.events();
    let sync = position(&events, |e| matches!(e, Event::Synchronize(s) if *s == stream));
    let free = position(&events, |e| matches!(e, Event::Free { ptr, .. } if *ptr == first));
    assert!(sync < free, "stream must drain before the old buffer is freed");
    assert!(emu.violations().is_empty(), "{:?}", emu.violations());
}

#[test]
fn test_workspace_use_is_serialized() {
    let (_emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();
    let inside = AtomicUsize::new(0);
    let max_inside = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for t in 0..8 {
            let (inside, max_inside) = (&inside, &max_inside);
            s.spawn(move || {
                for i in 0..20 {
                    ctx.run_with_workspace(64 * (t + i + 1), |_| {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            });
        }
    });

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.workspace_capacity(), 64 * (7 + 19 + 1));
}

#[test]
fn test_callbacks_follow_stream_work() {
    let (emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let kernel_log = log.clone();
        emu.enqueue(ctx.stream(), move || kernel_log.lock().push(format!("kernel {i}")))
            .unwrap();
        let callback_log = log.clone();
        ctx.add_callback(move || callback_log.lock().push(format!("callback {i}")))
            .unwrap();
    }
    ctx.wait_callback().unwrap();
    assert_eq!(ctx.pending_callbacks(), 0);

    let log = log.lock();
    for i in 0..3 {
        let kernel = log.iter().position(|e| *e == format!("kernel {i}")).unwrap();
        let callback = log.iter().position(|e| *e == format!("callback {i}")).unwrap();
        assert!(kernel < callback);
    }
}

#[test]
fn test_callback_panic_is_reported() {
    let (_emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();

    ctx.add_callback(|| panic!("bad callback")).unwrap();
    ctx.add_callback(|| {}).unwrap();
    assert!(matches!(ctx.wait_callback(), Err(Error::CallbackFailed(_))));
}

#[test]
fn test_dnn_handle_is_optional() {
    let (_emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    assert!(registry.accelerator(0).unwrap().dnn_handle().is_none());

    let emu = Arc::new(EmulatedBackend::new(1).with_dnn(true));
    let registry = RegistryBuilder::new()
        .place(Place::Accelerator(0))
        .accelerator(emu.accelerator_backend())
        .allocator(emu.allocator())
        .build()
        .unwrap();
    let ctx = registry.accelerator(0).unwrap();
    assert!(ctx.dnn_handle().is_some());

    let bind = emu
        .events()
        .into_iter()
        .find_map(|e| match e {
            Event::BindDnn(_, stream) => Some(stream),
            _ => None,
        })
        .unwrap();
    assert_eq!(bind, ctx.stream());
}

#[test]
fn test_teardown_order() {
    let emu = Arc::new(EmulatedBackend::new(1).with_dnn(true));
    let registry = RegistryBuilder::new()
        .place(Place::Accelerator(0))
        .accelerator(emu.accelerator_backend())
        .allocator(emu.allocator())
        .build()
        .unwrap();

    let ctx = registry.accelerator(0).unwrap();
    let stream = ctx.stream();
    ctx.run_with_workspace(128, |_| ()).unwrap();
    ctx.stream_device().semaphore().unwrap();
    emu.enqueue(stream, || {}).unwrap();
    emu.clear_events();

    drop(registry);

    let events = emu.events();
    let set_device = position(&events, |e| matches!(e, Event::SetDevice(0)));
    let sync = position(&events, |e| matches!(e, Event::Synchronize(s) if *s == stream));
    let last_error = position(&events, |e| matches!(e, Event::CheckLastError(0)));
    let blas = position(&events, |e| matches!(e, Event::DestroyBlas(_)));
    let dnn = position(&events, |e| matches!(e, Event::DestroyDnn(_)));
    let first_free = position(&events, |e| matches!(e, Event::Free { .. }));
    let destroy = position(&events, |e| matches!(e, Event::DestroyStream(_)));

    assert!(set_device < sync);
    assert!(sync < last_error);
    assert!(last_error < blas);
    assert!(blas < dnn);
    assert!(dnn < first_free);
    assert!(first_free < destroy);
    assert_eq!(destroy, events.len() - 1);

    assert_eq!(emu.live_streams(), 0);
    assert_eq!(emu.live_blas_handles(), 0);
    assert_eq!(emu.live_dnn_handles(), 0);
    assert_eq!(emu.live_allocations(), 0);
    assert!(emu.violations().is_empty(), "{:?}", emu.violations());
}

#[test]
fn test_construction_failure_cleans_up() {
    for point in [
        FaultPoint::SetDevice,
        FaultPoint::Properties,
        FaultPoint::CreateStream,
        FaultPoint::CreateBlas,
        FaultPoint::CreateDnn,
    ] {
        let emu = Arc::new(EmulatedBackend::new(1).with_dnn(true));
        emu.fail_next(point);

        let result = RegistryBuilder::new()
            .places([Place::Host, Place::Accelerator(0)])
            .accelerator(emu.accelerator_backend())
            .allocator(emu.allocator())
            .build();

        assert!(result.is_err(), "{point:?} should fail the build");
        assert_eq!(emu.live_streams(), 0, "{point:?}");
        assert_eq!(emu.live_blas_handles(), 0, "{point:?}");
        assert_eq!(emu.live_dnn_handles(), 0, "{point:?}");
        assert!(emu.violations().is_empty(), "{point:?}: {:?}", emu.violations());
    }
}

#[test]
fn test_stream_device_delegates_to_allocator() {
    let (emu, registry) = emulated_registry(2, [Place::Accelerator(1)]);
    let ctx = registry.accelerator(1).unwrap();
    let device = registry.get(Place::Accelerator(1)).unwrap().device();

    assert!(device.is_streamed());
    assert_eq!(device.id(), 1);

    let ptr = device.allocate(512).unwrap();
    assert!(emu.events().contains(&Event::Allocate {
        place: Place::Accelerator(1),
        ptr,
        size: 512,
    }));
    device.deallocate(ptr, 512);
    device.synchronize().unwrap();
    assert_eq!(ctx.stream_device().stream(), ctx.stream());
}

#[test]
fn test_metadata_reads() {
    let (_emu, registry) = emulated_registry(1, [Place::Accelerator(0)]);
    let ctx = registry.accelerator(0).unwrap();

    assert_eq!(ctx.state(), ContextState::Ready);
    assert_eq!(ctx.multiprocessor_count(), 82);
    assert_eq!(ctx.max_threads_per_multiprocessor(), 1536);
    assert_eq!(ctx.max_physical_thread_count(), 82 * 1536);
    assert_eq!(ctx.driver_version(), 12040);
    assert_eq!(ctx.properties().driver_version_string(), "12.4");
    assert_eq!(ctx.properties().runtime_version_string(), "12.4");
}
