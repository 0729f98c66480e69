#![no_main]

use encryption::cipher::{decrypt, encrypt, BLOCK_SIZE};
use encryption::keymaterial::{IvSequence, SymmetricKey, SYMMETRIC_KEY_SIZE};
use libfuzzer_sys::fuzz_target;

const INSTANCE_ID_LEN: usize = 8;

fuzz_target!(|data: &[u8]| {
    if data.len() < SYMMETRIC_KEY_SIZE + INSTANCE_ID_LEN {
        return;
    }

    let mut key_bytes = [0u8; SYMMETRIC_KEY_SIZE];
    key_bytes.copy_from_slice(&data[..SYMMETRIC_KEY_SIZE]);
    let key = SymmetricKey::from_bytes(key_bytes);

    let instance_id = String::from_utf8_lossy(
        &data[SYMMETRIC_KEY_SIZE..SYMMETRIC_KEY_SIZE + INSTANCE_ID_LEN],
    );
    let mut ivs = IvSequence::for_instance(&instance_id, &key);
    let iv = ivs.next_iv();

    let payload = &data[SYMMETRIC_KEY_SIZE + INSTANCE_ID_LEN..];
    let ciphertext = match encrypt(payload, &key, &iv) {
        Ok(ciphertext) => ciphertext,
        Err(_) => return,
    };
    assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
    assert!(ciphertext.len() > payload.len());

    let plaintext = decrypt(&ciphertext, &key, &iv).expect("own ciphertext must decrypt");
    assert_eq!(payload, plaintext.as_slice());

    // Arbitrary bytes must be rejected cleanly, never panic
    let _ = decrypt(payload, &key, &iv);
});
