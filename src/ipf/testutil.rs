//! Hand-built archives for tests that need malformed local headers.

use byteorder::{LittleEndian, WriteBytesExt};
use std::path::{Path, PathBuf};

use super::structures::{CDFH_SIGNATURE, EndOfCentralDirectory, LFH_SIGNATURE};

/// Stored-method archive builder.
///
/// Each entry's local header declares whatever name length the test asks for,
/// while its directory record carries a dummy name.
pub(crate) struct RawArchive {
    data: Vec<u8>,
    directory: Vec<u8>,
    count: u16,
}

impl RawArchive {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            directory: Vec::new(),
            count: 0,
        }
    }

    pub(crate) fn push(&mut self, declared_name_len: u16, name: &[u8], payload: &[u8]) {
        let offset = self.data.len() as u32;
        let crc = crc32fast::hash(payload);

        let h = &mut self.data;
        h.extend_from_slice(LFH_SIGNATURE);
        h.write_u16::<LittleEndian>(20).unwrap();
        h.write_u16::<LittleEndian>(0).unwrap();
        h.write_u16::<LittleEndian>(0).unwrap();
        h.write_u32::<LittleEndian>(0).unwrap();
        h.write_u32::<LittleEndian>(crc).unwrap();
        h.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        h.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        h.write_u16::<LittleEndian>(declared_name_len).unwrap();
        h.write_u16::<LittleEndian>(0).unwrap();
        h.extend_from_slice(name);
        h.extend_from_slice(payload);

        let d = &mut self.directory;
        d.extend_from_slice(CDFH_SIGNATURE);
        d.write_u16::<LittleEndian>(20).unwrap();
        d.write_u16::<LittleEndian>(20).unwrap();
        d.write_u16::<LittleEndian>(0).unwrap();
        d.write_u16::<LittleEndian>(0).unwrap();
        d.write_u32::<LittleEndian>(0).unwrap();
        d.write_u32::<LittleEndian>(crc).unwrap();
        d.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        d.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        d.write_u16::<LittleEndian>(3).unwrap();
        d.write_u16::<LittleEndian>(0).unwrap();
        d.write_u16::<LittleEndian>(0).unwrap();
        d.write_u16::<LittleEndian>(0).unwrap();
        d.write_u16::<LittleEndian>(0).unwrap();
        d.write_u32::<LittleEndian>(0).unwrap();
        d.write_u32::<LittleEndian>(offset).unwrap();
        d.extend_from_slice(b"zzz");
        self.count += 1;
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        let cd_offset = self.data.len() as u32;
        self.data.extend_from_slice(&self.directory);
        EndOfCentralDirectory {
            disk_entries: self.count,
            total_entries: self.count,
            cd_size: self.directory.len() as u32,
            cd_offset,
            ..Default::default()
        }
        .write_to(&mut self.data)
        .unwrap();
        self.data
    }

    pub(crate) fn write(self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.finish()).unwrap();
        path
    }
}
