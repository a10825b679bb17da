//! AES-256-CBC credential encryption for the vault.
//!
//! Each credential is stored as hex `{iv, ciphertext}` under the 32-byte
//! master key held in `<state>/.masterkey`.

use crate::config::EncryptedCredential;

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn encrypt_credential(key: &[u8; 32], plaintext: &str) -> Result<EncryptedCredential, String> {
    use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    let iv: [u8; 16] = rand::random();

    let pt = plaintext.as_bytes();
    // Buffer: plaintext + up to 16 bytes PKCS#7 padding
    let mut buf = vec![0u8; pt.len() + 16];
    buf[..pt.len()].copy_from_slice(pt);

    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(key, &iv)
        .map_err(|e| format!("cipher init failed: {e}"))?
        .encrypt_padded_mut::<Pkcs7>(&mut buf, pt.len())
        .map_err(|e| format!("encryption failed: {e}"))?;

    Ok(EncryptedCredential {
        iv: hex::encode(iv),
        ciphertext: hex::encode(ciphertext),
    })
}

/// Decrypt a stored credential back to its plaintext.
pub fn decrypt_credential(key: &[u8; 32], cred: &EncryptedCredential) -> Result<String, String> {
    use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

    let iv = hex::decode(&cred.iv).map_err(|e| format!("invalid IV hex: {e}"))?;
    if iv.len() != 16 {
        return Err(format!("invalid IV length: {} (expected 16)", iv.len()));
    }
    let mut buf = hex::decode(&cred.ciphertext).map_err(|e| format!("invalid ciphertext hex: {e}"))?;

    let plaintext = cbc::Decryptor::<aes::Aes256>::new_from_slices(key, &iv)
        .map_err(|e| format!("cipher init failed: {e}"))?
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| format!("decryption failed: {e}"))?;

    String::from_utf8(plaintext.to_vec()).map_err(|e| format!("credential is not UTF-8: {e}"))
}
