#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = sigil_envelope::wire::detect_format(data);
    if let Ok((header, len)) = sigil_envelope::wire::decode_header(data) {
        let encoded = sigil_envelope::wire::encode_header(&header).expect("decoded header re-encodes");
        assert_eq!(&encoded[..], &data[..len]);
    }
});
