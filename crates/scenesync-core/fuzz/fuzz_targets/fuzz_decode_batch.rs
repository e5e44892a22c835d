#![no_main]
use libfuzzer_sys::fuzz_target;
use scenesync_core::message::decode_batch;
use scenesync_core::pool::PoolRegistry;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode without panicking; skipped frames are fine.
    let pools = PoolRegistry::default();
    let mut out = Vec::new();
    let _ = decode_batch(data, &mut out, &pools.payloads);
});
