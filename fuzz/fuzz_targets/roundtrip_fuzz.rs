#![no_main]
use libfuzzer_sys::fuzz_target;
use chunksync::chunker::Chunker;
use chunksync::delta;
use chunksync::hash::ChunkerConfig;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First byte picks the chunk size, second the split point.
    let avg = 256usize << (data[0] % 4);
    let payload = &data[2..];
    let split = data[1] as usize * payload.len() / 256;
    let (original, source) = payload.split_at(split);

    let chunker = Chunker::new(ChunkerConfig::with_average(avg).unwrap());
    let sig = delta::build_signature(&chunker, original).unwrap();
    let ops = delta::diff_all(&chunker, source, &sig).unwrap();
    let rebuilt = delta::apply_to_vec(&ops, original).unwrap();
    assert_eq!(rebuilt, source);

    let self_sig = delta::build_signature(&chunker, source).unwrap();
    let self_ops = delta::diff_all(&chunker, source, &self_sig).unwrap();
    assert!(self_ops.iter().all(|op| op.is_block()));
});
