#![no_main]

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;

static KEYPAIR: Lazy<(sigil_envelope::PublicKey, sigil_envelope::SecretKey)> =
    Lazy::new(sigil_envelope::generate_keypair);

fuzz_target!(|data: &[u8]| {
    let (_pk, sk) = &*KEYPAIR;
    let Ok(opener) = sigil_envelope::Opener::begin(data, "decrypt") else {
        return;
    };
    if let Ok(unlocked) = opener.unlock(&[sk]) {
        let _ = opener.stream(&unlocked, std::io::sink());
    }
});
