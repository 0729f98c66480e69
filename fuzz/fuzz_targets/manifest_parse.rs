#![no_main]

use encryption::manifest::EncryptedManifest;
use encryption::instance::parse_instance_id;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(xml) = std::str::from_utf8(data) else {
        return;
    };

    let _ = parse_instance_id(xml);

    if let Ok(manifest) = EncryptedManifest::parse(xml) {
        let rewritten = manifest.to_xml().expect("serialize parsed manifest");
        let reparsed = EncryptedManifest::parse(&rewritten).expect("reparse own output");
        assert_eq!(manifest, reparsed);
    }
});
