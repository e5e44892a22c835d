#![no_main]
use libfuzzer_sys::fuzz_target;
use scenesync_core::test_utils::Harness;

fuzz_target!(|data: &[u8]| {
    // Feed the input twice so the second pass reconciles against a baseline.
    // Must not panic and must not error without a pool ceiling.
    let h = Harness::new();
    let mut bridge = h.bridge(1);
    assert!(bridge.submit(data).is_ok());
    assert!(bridge.submit(data).is_ok());
    let _ = bridge.dump_state();
    bridge.shutdown();
    h.with_world(|world| world.sweep());
    assert_eq!(h.pools.outstanding(), 0);
});
