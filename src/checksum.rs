use std::path::Path;

use sha2::{Digest, Sha512};
use tokio::io::AsyncReadExt;

use crate::error::CoreError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Streaming SHA-512 over a file's current contents, hex-encoded. Used both
/// by the reuse check and by post-transfer verification.
pub async fn sha512_file(path: &Path) -> Result<String, CoreError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sha512_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let digest = sha512_file(&path).await.unwrap();
        // sha512("abc") per FIPS 180-4 test vectors.
        assert_eq!(
            digest,
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39\
a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49"
        );
    }

    #[tokio::test]
    async fn sha512_of_all_ones_4096_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ones");
        tokio::fs::write(&path, vec![0xFFu8; 4096]).await.unwrap();
        let digest = sha512_file(&path).await.unwrap();
        assert_eq!(digest.len(), 128);
    }
}
