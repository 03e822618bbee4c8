use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ipfkit::{
    CreateConfig, IpfArchive, IpfExtractor, IpfNameCipher, NameCipher, PlainNameCipher, create,
};

fn populate(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (name, body) in files {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }
}

/// Relative path -> SHA-256 of every file below `root`.
fn digest_tree(root: &Path) -> BTreeMap<String, String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap();
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_str().unwrap())
                .collect::<Vec<_>>()
                .join("/");
            let digest = hex::encode(Sha256::digest(std::fs::read(e.path()).unwrap()));
            (name, digest)
        })
        .collect()
}

fn sample_files() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("hello.txt", b"hello ipf\n".to_vec()),
        ("xml/item.xml", b"<item id=\"1\"/>\n".to_vec()),
        ("ui/empty.dat", Vec::new()),
        ("data/blob.bin", (0..200_000u32).map(|i| (i % 251) as u8).collect()),
    ]
}

async fn pack_and_unpack(
    files: &[(&str, Vec<u8>)],
    encrypt_names: bool,
    cipher: Arc<dyn NameCipher>,
) -> (tempfile::TempDir, BTreeMap<String, String>) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    let archive_path = dir.path().join("test.ipf");
    populate(&input, files);

    let config = CreateConfig {
        encrypt_names,
        ..CreateConfig::new(&input, &archive_path)
    };
    let summary = create(&config, cipher.clone()).await.unwrap();
    assert_eq!(summary.entries, files.len());

    let archive = IpfArchive::load(&archive_path, cipher, 4).await.unwrap();
    assert_eq!(archive.skipped().count(), 0);
    let report = IpfExtractor::new(&archive, 4)
        .extract_all(&output)
        .await
        .unwrap();
    assert!(report.is_complete(), "failures: {:?}", report.failures);
    assert_eq!(report.extracted, files.len());

    assert_eq!(digest_tree(&output), digest_tree(&input));
    let digests = digest_tree(&output);
    (dir, digests)
}

#[tokio::test]
async fn four_entries_match_reference_hashes() {
    let (_dir, digests) =
        pack_and_unpack(&sample_files(), true, Arc::new(IpfNameCipher::new())).await;

    let expected: BTreeMap<String, String> = [
        ("data/blob.bin", "e24bc62381f1224fbbb74688663f8f9743b9680b193edd666835e97b06e730eb"),
        ("hello.txt", "8b94109bfd5fb9211ae4bcaa5fd58480d7425970cc43662a2a9e801e58800519"),
        ("ui/empty.dat", "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"),
        ("xml/item.xml", "06d59726df6cc3c3df325966f0b892e43b378f78e954a53b317476b7dada8022"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    assert_eq!(digests, expected);
}

#[tokio::test]
async fn plain_names_round_trip() {
    pack_and_unpack(&sample_files(), false, Arc::new(PlainNameCipher)).await;
}

#[tokio::test]
async fn creation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    populate(&input, &sample_files());

    let mut outputs = Vec::new();
    for (name, workers) in [("a.ipf", 1), ("b.ipf", 8)] {
        let path = dir.path().join(name);
        let config = CreateConfig {
            workers,
            ..CreateConfig::new(&input, &path)
        };
        create(&config, Arc::new(IpfNameCipher::new())).await.unwrap();
        outputs.push(std::fs::read(&path).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn extraction_is_idempotent_over_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let archive_path = dir.path().join("t.ipf");
    let output = dir.path().join("out");
    populate(&input, &sample_files());
    create(
        &CreateConfig::new(&input, &archive_path),
        Arc::new(IpfNameCipher::new()),
    )
    .await
    .unwrap();

    let archive = IpfArchive::load(&archive_path, Arc::new(IpfNameCipher::new()), 2)
        .await
        .unwrap();
    for _ in 0..2 {
        let report = IpfExtractor::new(&archive, 2).extract_all(&output).await.unwrap();
        assert!(report.is_complete());
    }
    assert_eq!(digest_tree(&output), digest_tree(&input));
}

#[tokio::test]
async fn many_entries_extract() {
    let files: Vec<(String, Vec<u8>)> = (0..10_050)
        .map(|i| (format!("d{:02}/f{:05}.txt", i % 50, i), format!("entry {}\n", i).into_bytes()))
        .collect();
    let borrowed: Vec<(&str, Vec<u8>)> = files
        .iter()
        .map(|(name, body)| (name.as_str(), body.clone()))
        .collect();

    let (_dir, digests) = pack_and_unpack(&borrowed, true, Arc::new(IpfNameCipher::new())).await;
    assert_eq!(digests.len(), 10_050);
}
