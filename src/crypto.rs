use anyhow::{anyhow, Result};

/// AES-128 key or IV length in bytes.
pub const BLOCK_LEN: usize = 16;

/// 解密数据
pub fn decrypt_data(encrypted_data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    use aes::cipher::block_padding::Pkcs7;
    use aes::cipher::{BlockDecryptMut, KeyIvInit};
    use cbc::Decryptor;

    if key.len() != BLOCK_LEN || iv.len() != BLOCK_LEN {
        return Err(anyhow!(
            "AES-128 needs a {}-byte key and IV, got {} and {}",
            BLOCK_LEN,
            key.len(),
            iv.len()
        ));
    }

    let cipher = Decryptor::<aes::Aes128>::new(key.into(), iv.into());
    let mut buf = encrypted_data.to_vec();
    let decrypted_slice = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| anyhow!("Decryption error: {}", e))?;

    Ok(decrypted_slice.to_vec())
}

/// Parses an `#EXT-X-KEY` IV attribute (`0x` + 32 hex digits).
pub fn parse_iv(value: &str) -> Result<[u8; BLOCK_LEN]> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(digits).map_err(|e| anyhow!("无法解析IV值: {} - 错误: {}", value, e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("IV must be {} bytes, got {}", BLOCK_LEN, b.len()))
}

/// IV implied by the media sequence number when the key tag carries none.
pub fn sequence_iv(sequence: u64) -> [u8; BLOCK_LEN] {
    let mut iv = [0u8; BLOCK_LEN];
    iv[BLOCK_LEN - 8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}
