//! Round-trip laws for the compressed artifact store, exercised through
//! the public storage API over the in-memory backend.

use arkiv::storage::{ObjectStorage, Storage, ZstdStorage};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

fn store() -> ZstdStorage<ObjectStorage> {
    ZstdStorage::new(ObjectStorage::memory())
}

async fn put(storage: &ZstdStorage<ObjectStorage>, key: &str, payload: &[u8]) {
    let mut writer = storage.writer(key).await.unwrap();
    writer.write_all(payload).await.unwrap();
    writer.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_read_law() {
    let storage = store();
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    put(&storage, "aB9xQ/mhtml.mhtml.zst", &payload).await;

    let mut reader = storage.reader("aB9xQ/mhtml.mhtml.zst").await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, payload);
}

#[tokio::test]
async fn uncompressed_size_equals_bytes_written() {
    let storage = store();
    for (key, len) in [
        ("k1/a.bin.zst", 0usize),
        ("k2/b.bin.zst", 1),
        ("k3/c.bin.zst", 1 << 20),
        ("k4/d.bin.zst", (1 << 20) + 1),
        ("k5/e.bin.zst", 3_333_333),
    ] {
        put(&storage, key, &vec![0xabu8; len]).await;
        assert_eq!(
            storage.uncompressed_size(key).await.unwrap(),
            len as u64,
            "key {key}"
        );
    }
}

#[tokio::test]
async fn ranged_reads_match_slices() {
    let storage = store();
    let payload: Vec<u8> = (0..4_000_000u32).map(|i| (i * 31 % 256) as u8).collect();
    put(&storage, "rg/video.mp4.zst", &payload).await;

    for (start, len) in [(0u64, 100usize), (1_048_575, 10), (3_999_990, 10), (2_000_000, 65536)] {
        let mut reader = storage.seekable_reader("rg/video.mp4.zst").await.unwrap();
        reader.seek(std::io::SeekFrom::Start(start)).await.unwrap();
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            &payload[start as usize..start as usize + len],
            "range {start}+{len}"
        );
    }
}

#[tokio::test]
async fn exists_tracks_lifecycle() {
    let storage = store();
    assert!(!storage.exists("gone/x.zst").await.unwrap());

    put(&storage, "here/x.zst", b"payload").await;
    assert!(storage.exists("here/x.zst").await.unwrap());

    storage.delete("here/x.zst").await.unwrap();
    assert!(!storage.exists("here/x.zst").await.unwrap());
}

#[tokio::test]
async fn filesystem_backend_matches_memory_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let storage = ZstdStorage::new(ObjectStorage::filesystem(dir.path()).unwrap());
    let payload = b"the same artifact bytes".repeat(1000);

    put(&storage, "Ab3xY/git.tar.zst", &payload).await;

    // The on-disk object lives at the documented layout and is compressed.
    let on_disk = dir.path().join("Ab3xY").join("git.tar.zst");
    assert!(on_disk.exists());
    let raw = std::fs::read(&on_disk).unwrap();
    assert!(raw.len() < payload.len());
    assert_eq!(&raw[0..4], &[0x28, 0xb5, 0x2f, 0xfd], "zstd frame magic");

    let mut reader = storage.reader("Ab3xY/git.tar.zst").await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, payload);
}
