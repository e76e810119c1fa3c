//! Streaming checksums for bundle archives: the adler32 + SHA-512 pair
//! recorded at creation, and the SHA-512 recomputed at every verification
//! point.
//!
//! Hashing is CPU-bound, so it runs on the blocking pool and never stalls
//! the worker's cooperative loop.

use std::fs::File;
use std::io::Read;

use adler32::RollingAdler32;
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha512};

use lta_api::models::Checksum;

const BUFFER_SIZE: usize = 128 * 1024;

/// Both archive checksums in a single streaming pass over the file.
pub async fn lta_checksums(path: &Utf8Path) -> anyhow::Result<Checksum> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || checksums_sync(&path))
        .await
        .context("checksum task panicked")?
}

/// SHA-512 only; used by the verifiers.
pub async fn sha512sum(path: &Utf8Path) -> anyhow::Result<String> {
    Ok(lta_checksums(path).await?.sha512)
}

fn checksums_sync(path: &Utf8PathBuf) -> anyhow::Result<Checksum> {
    let mut file =
        File::open(path).with_context(|| format!("opening {path} for checksumming"))?;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut adler = RollingAdler32::new();
    let mut sha512 = Sha512::new();
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("reading {path}"))?;
        if n == 0 {
            break;
        }
        adler.update_buffer(&buffer[..n]);
        sha512.update(&buffer[..n]);
    }
    Ok(Checksum {
        adler32: format!("{:08x}", adler.hash()),
        sha512: hex::encode(sha512.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn known_adler32_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wikipedia.txt");
        std::fs::write(&path, b"Wikipedia").unwrap();
        let checksum = lta_checksums(&path).await.unwrap();
        assert_eq!(checksum.adler32, "11e60398");
    }

    #[tokio::test]
    async fn known_sha512_vector_for_empty_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        let checksum = lta_checksums(&path).await.unwrap();
        assert_eq!(checksum.adler32, "00000001");
        assert_eq!(
            checksum.sha512,
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
             47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
    }

    #[tokio::test]
    async fn checksum_shape_matches_the_recorded_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![0xAB; 300_000]).unwrap();
        let checksum = lta_checksums(&path).await.unwrap();
        assert_eq!(checksum.adler32.len(), 8);
        assert_eq!(checksum.sha512.len(), 128);
        assert!(checksum.sha512.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(checksum.sha512, checksum.sha512.to_lowercase());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("no-such-file");
        assert!(lta_checksums(&path).await.is_err());
    }
}
