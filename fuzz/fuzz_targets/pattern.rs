#![no_main]

use libfuzzer_sys::fuzz_target;
use pefrun::container::pattern::expand;

fuzz_target!(|data: &[u8]| {
    if let Some((size, stream)) = data.split_first() {
        let _ = expand(stream, usize::from(*size) * 16);
    }
});
