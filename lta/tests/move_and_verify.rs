//! End-to-end exercise of the local transfer driver against the archive
//! and checksum layers: build an archive, "transfer" it, and verify the
//! destination copy the way the source-move verifier does.

use camino_tempfile::tempdir;
use url::Url;

use lta::archive::ArchiveWriter;
use lta::checksum::{lta_checksums, sha512sum};
use lta::transfer::file_mover::FileMover;
use lta::transfer::{TransferBackend, TransferTaskStatus};

#[tokio::test]
async fn transferred_bundle_passes_destination_verification() {
    let dir = tempdir().unwrap();
    let outbox = dir.path().join("outbox");
    let dest = dir.path().join("dest");
    let scratch = dir.path().join("scratch");
    for d in [&outbox, &dest, &scratch] {
        std::fs::create_dir_all(d).unwrap();
    }

    // Bundler side: a small archive with a manifest entry and one payload.
    let payload = dir.path().join("payload.dat");
    std::fs::write(&payload, vec![42u8; 100_000]).unwrap();
    let bundle_path = outbox.join("e4a0a7e2c0de4a8f9a1b.zip");
    let mut writer = ArchiveWriter::create(&bundle_path).await.unwrap();
    writer
        .add_bytes(b"{\"file_count\":1}\n".to_vec(), "e4a0a7e2c0de4a8f9a1b.metadata.ndjson")
        .await
        .unwrap();
    writer.add_file(&payload, "payload.dat").await.unwrap();
    writer.finish().await.unwrap();
    let recorded = lta_checksums(&bundle_path).await.unwrap();

    // Replicator side: submit through the file-move driver.
    let mover = FileMover::new();
    let dest_url = Url::parse(&format!("file://{}", dest.join("e4a0a7e2c0de4a8f9a1b.zip"))).unwrap();
    let task_id = mover.submit(&bundle_path, &dest_url).await.unwrap();
    assert_eq!(
        mover.poll(&task_id).await.unwrap(),
        TransferTaskStatus::Succeeded
    );

    // Verifier side: pull the destination copy back and re-checksum it.
    let scratch_file = scratch.join("e4a0a7e2c0de4a8f9a1b.zip");
    mover.fetch(&dest_url, &scratch_file).await.unwrap();
    let computed = sha512sum(&scratch_file).await.unwrap();
    assert_eq!(computed, recorded.sha512);
}

#[tokio::test]
async fn a_corrupted_destination_copy_fails_verification() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("bundle.zip");
    std::fs::write(&source, vec![7u8; 50_000]).unwrap();
    let recorded = lta_checksums(&source).await.unwrap();

    let mover = FileMover::new();
    let dest_path = dir.path().join("dest").join("bundle.zip");
    let dest_url = Url::parse(&format!("file://{dest_path}")).unwrap();
    mover.submit(&source, &dest_url).await.unwrap();

    // One flipped bit at the destination must be caught.
    let mut bytes = std::fs::read(&dest_path).unwrap();
    bytes[25_000] ^= 0x01;
    std::fs::write(&dest_path, &bytes).unwrap();

    let scratch = dir.path().join("scratch.zip");
    mover.fetch(&dest_url, &scratch).await.unwrap();
    let computed = sha512sum(&scratch).await.unwrap();
    assert_ne!(computed, recorded.sha512);
}
