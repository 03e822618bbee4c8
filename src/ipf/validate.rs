use crate::error::{IpfError, Result};
use crate::io::ReadAt;

use super::archive::IpfArchive;
use super::structures::MAX_ENTRIES;

/// Structural sanity check, required before extraction.
///
/// Entry count must be in `1..=MAX_ENTRIES` and every local header offset must
/// fall inside the file.
pub fn validate<R: ReadAt>(archive: &IpfArchive<R>) -> Result<()> {
    let count = archive.len();
    if count == 0 {
        return Err(IpfError::Format("archive has no entries".into()));
    }
    if count > MAX_ENTRIES {
        return Err(IpfError::Capacity(format!(
            "{} entries exceeds the limit of {}",
            count, MAX_ENTRIES
        )));
    }

    let size = archive.size();
    if let Some(entry) = archive.entries().iter().find(|e| e.lfh_offset >= size) {
        return Err(IpfError::Format(format!(
            "entry {} starts at {} beyond end of file ({} bytes)",
            entry.index, entry.lfh_offset, size
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileReader;
    use crate::ipf::cipher::PlainNameCipher;
    use crate::ipf::extractor::IpfExtractor;
    use crate::ipf::structures::CDFH_SIGNATURE;
    use crate::ipf::testutil::RawArchive;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn open_bytes(dir: &tempfile::TempDir, bytes: &[u8]) -> IpfArchive<LocalFileReader> {
        let path = dir.path().join("v.ipf");
        std::fs::write(&path, bytes).unwrap();
        IpfArchive::from_reader(Arc::new(LocalFileReader::new(&path).unwrap())).unwrap()
    }

    #[test]
    fn unscanned_archive_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_bytes(&dir, b"not scanned yet");
        assert!(matches!(validate(&archive), Err(IpfError::Format(_))));
    }

    /// Two-entry archive whose second directory record points at `offset`.
    fn archive_with_second_offset(dir: &tempfile::TempDir, offset: Option<u32>) -> PathBuf {
        let mut raw = RawArchive::new();
        raw.push(5, b"a.txt", b"first");
        raw.push(5, b"b.txt", b"second");
        let mut bytes = raw.finish();

        let first_record = bytes
            .windows(4)
            .position(|w| w == CDFH_SIGNATURE)
            .unwrap();
        // each record carries the 3-byte placeholder name
        let field = first_record + 46 + 3 + 42;
        let offset = offset.unwrap_or(bytes.len() as u32);
        bytes[field..field + 4].copy_from_slice(&offset.to_le_bytes());

        let path = dir.path().join("offsets.ipf");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    async fn scanned(path: &std::path::Path) -> IpfArchive {
        let mut archive = IpfArchive::open(path).unwrap();
        archive.read_structure().await.unwrap();
        archive
            .read_encrypted_filenames(Arc::new(PlainNameCipher), 2)
            .await
            .unwrap();
        archive
    }

    #[tokio::test]
    async fn header_offset_at_end_of_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive_with_second_offset(&dir, None);

        let archive = scanned(&path).await;
        assert_eq!(archive.entry(1).unwrap().lfh_offset, archive.size());
        let err = validate(&archive).unwrap_err();
        assert!(matches!(err, IpfError::Format(msg) if msg.contains("entry 1")));

        let err = IpfArchive::load(&path, Arc::new(PlainNameCipher), 2)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IpfError::Format(_)));
    }

    #[tokio::test]
    async fn extraction_is_gated_on_header_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive_with_second_offset(&dir, Some(u32::MAX - 1));
        let archive = scanned(&path).await;

        let dest = dir.path().join("out");
        let err = IpfExtractor::new(&archive, 2)
            .extract_all(&dest)
            .await
            .unwrap_err();
        assert!(matches!(err, IpfError::Format(_)));
        assert!(!dest.exists(), "destination created before validation");
    }

    #[tokio::test]
    async fn offsets_inside_the_file_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive_with_second_offset(&dir, Some(40));
        let archive = scanned(&path).await;
        validate(&archive).unwrap();
    }
}
