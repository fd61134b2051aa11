#![no_main]
use libfuzzer_sys::fuzz_target;
use chunksync::delta::codec::{self, DeltaReader};
use chunksync::store::oploc;

fuzz_target!(|data: &[u8]| {
    // Every decoder must reject garbage with an error, never a panic.
    let _ = codec::decode_operation(data);
    let _ = codec::decode_signature(data);
    let _ = oploc::decode_locations(data);

    let mut framed = codec::DELTA_MAGIC.to_vec();
    framed.extend_from_slice(data);
    if let Ok(reader) = DeltaReader::new(framed.as_slice()) {
        for op in reader {
            if op.is_err() {
                break;
            }
        }
    }
});
