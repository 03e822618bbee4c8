use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

use crate::error::{DecodeSkip, IpfError, Result};

/// Entry compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(IpfError::Format("invalid end of central directory".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            disk_with_cd: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            disk_entries: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            total_entries: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            cd_size: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            cd_offset: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            comment_len: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
        })
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        out.write_u16::<LittleEndian>(self.disk_number)?;
        out.write_u16::<LittleEndian>(self.disk_with_cd)?;
        out.write_u16::<LittleEndian>(self.disk_entries)?;
        out.write_u16::<LittleEndian>(self.total_entries)?;
        out.write_u32::<LittleEndian>(self.cd_size)?;
        out.write_u32::<LittleEndian>(self.cd_offset)?;
        out.write_u16::<LittleEndian>(self.comment_len)
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(IpfError::Format("invalid zip64 end locator".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            eocd64_offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            total_disks: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
        })
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        out.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        out.write_u64::<LittleEndian>(self.eocd64_offset)?;
        out.write_u32::<LittleEndian>(self.total_disks)
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(IpfError::Format("invalid zip64 end of central directory".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            version_made_by: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            version_needed: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            disk_number: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            disk_with_cd: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            disk_entries: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            total_entries: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            cd_size: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            cd_offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
        })
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        out.write_u64::<LittleEndian>(self.eocd64_size)?;
        out.write_u16::<LittleEndian>(self.version_made_by)?;
        out.write_u16::<LittleEndian>(self.version_needed)?;
        out.write_u32::<LittleEndian>(self.disk_number)?;
        out.write_u32::<LittleEndian>(self.disk_with_cd)?;
        out.write_u64::<LittleEndian>(self.disk_entries)?;
        out.write_u64::<LittleEndian>(self.total_entries)?;
        out.write_u64::<LittleEndian>(self.cd_size)?;
        out.write_u64::<LittleEndian>(self.cd_offset)
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Offset of the name length field inside a local header.
pub const LFH_NAME_LEN_OFFSET: usize = 26;

/// Longest stored name the reader accepts.
pub const MAX_NAME_LEN: u16 = 512;

/// Upper bound on entry count before an archive is considered corrupt.
pub const MAX_ENTRIES: usize = 1_000_000;

/// Extra field id for zip64 extended information.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// General purpose flag: names are UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

/// Version needed for deflate entries (2.0).
pub const VERSION_DEFLATE: u16 = 20;

/// Version needed once zip64 records are present (4.5).
pub const VERSION_ZIP64: u16 = 45;

/// DOS time and date for 1980-01-01 00:00:00.
pub const DOS_EPOCH_TIME: u16 = 0;
pub const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;

/// One archive member.
///
/// Directory-sourced fields are set by the structure scan. The name fields
/// start empty and are filled by the filename pass.
#[derive(Debug, Clone)]
pub struct IpfEntry {
    pub index: usize,
    pub lfh_offset: u64,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub encrypted_name: Vec<u8>,
    pub decrypted_name: Option<String>,
    pub name_skip: Option<DecodeSkip>,
}

impl IpfEntry {
    pub(crate) fn from_directory(index: usize, record: DirectoryRecord) -> Self {
        Self {
            index,
            lfh_offset: record.lfh_offset,
            compression_method: record.compression_method,
            compressed_size: record.compressed_size,
            uncompressed_size: record.uncompressed_size,
            crc32: record.crc32,
            last_mod_time: record.last_mod_time,
            last_mod_date: record.last_mod_date,
            encrypted_name: Vec::new(),
            decrypted_name: None,
            name_skip: None,
        }
    }

    /// Placeholder used whenever the real name is unavailable.
    pub fn fallback_name(&self) -> String {
        format!("file_{:04}.bin", self.index)
    }

    /// The name extraction will use: decoded path or the fallback.
    pub fn display_name(&self) -> String {
        self.decrypted_name
            .clone()
            .unwrap_or_else(|| self.fallback_name())
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

/// Fields the central directory is authoritative for.
///
/// The directory's own name bytes are deliberately not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
}

fn truncated(err: io::Error) -> IpfError {
    IpfError::Format(format!("truncated record: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eocd_survives_write_and_parse() {
        let eocd = EndOfCentralDirectory {
            disk_entries: 3,
            total_entries: 3,
            cd_size: 150,
            cd_offset: 4096,
            ..Default::default()
        };
        let mut buf = Vec::new();
        eocd.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), EndOfCentralDirectory::SIZE);
        assert_eq!(EndOfCentralDirectory::from_bytes(&buf).unwrap(), eocd);
        assert!(!eocd.is_zip64());
    }

    #[test]
    fn eocd_rejects_wrong_signature() {
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        buf[0..4].copy_from_slice(b"PK\x03\x04");
        assert!(matches!(
            EndOfCentralDirectory::from_bytes(&buf),
            Err(IpfError::Format(_))
        ));
    }

    #[test]
    fn fallback_name_is_zero_padded() {
        let record = DirectoryRecord {
            compression_method: CompressionMethod::Deflate,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            last_mod_time: DOS_EPOCH_TIME,
            last_mod_date: DOS_EPOCH_DATE,
        };
        let entry = IpfEntry::from_directory(7, record.clone());
        assert_eq!(entry.fallback_name(), "file_0007.bin");
        assert_eq!(entry.display_name(), "file_0007.bin");
        assert_eq!(IpfEntry::from_directory(12345, record).fallback_name(), "file_12345.bin");
    }

    #[test]
    fn dos_epoch_decodes_to_1980() {
        let record = DirectoryRecord {
            compression_method: CompressionMethod::Stored,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            last_mod_time: DOS_EPOCH_TIME,
            last_mod_date: DOS_EPOCH_DATE,
        };
        let entry = IpfEntry::from_directory(0, record);
        assert_eq!(entry.mod_date(), (1980, 1, 1));
        assert_eq!(entry.mod_time(), (0, 0, 0));
    }
}
