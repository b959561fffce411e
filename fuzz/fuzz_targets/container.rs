#![no_main]

use libfuzzer_sys::fuzz_target;
use pefrun::container::LoaderConfig;
use pefrun::Container;

fuzz_target!(|data: &[u8]| {
    let config = LoaderConfig::new().instantiate_all(true);
    if let Ok(container) = Container::from_mem_with_config(data.to_vec(), config) {
        let _ = container.loader_info();
    }
});
