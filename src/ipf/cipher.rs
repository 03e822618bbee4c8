//! Filename obfuscation.
//!
//! The reader and writer only see the [`NameCipher`] contract; which concrete
//! transform a caller injects is a policy decision outside the codec.

/// Reversible transform between a relative path and the bytes stored in a
/// local header's name field.
///
/// Implementations must be deterministic and `decrypt(encrypt(p)) == Some(p)`
/// must hold for every relative path the writer produces.
pub trait NameCipher: Send + Sync {
    fn encrypt(&self, name: &str) -> Vec<u8>;

    /// Returns `None` when the bytes do not decode to a UTF-8 path.
    fn decrypt(&self, bytes: &[u8]) -> Option<String>;
}

/// Names are stored as plain UTF-8, readable by generic unpackers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainNameCipher;

impl NameCipher for PlainNameCipher {
    fn encrypt(&self, name: &str) -> Vec<u8> {
        name.as_bytes().to_vec()
    }

    fn decrypt(&self, bytes: &[u8]) -> Option<String> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

const IPF_PASSWORD: [u8; 20] = [
    0x6F, 0x66, 0x4F, 0x31, 0x61, 0x30, 0x75, 0x65, 0x58, 0x41, 0x3F, 0x20, 0x5B, 0xFF, 0x73, 0x20,
    0x68, 0x20, 0x25, 0x3F,
];

const INITIAL_KEYS: [u32; 3] = [0x12345678, 0x23456789, 0x34567890];

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB88320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// Keyed byte-stream cipher used by IPF tooling.
///
/// Three 32-bit keys are seeded from a password and advanced with every
/// plaintext byte. Only even-indexed bytes are transformed, so the output has
/// the same length as the input.
#[derive(Debug, Clone)]
pub struct IpfNameCipher {
    seed: [u32; 3],
}

impl IpfNameCipher {
    pub fn new() -> Self {
        Self::with_password(&IPF_PASSWORD)
    }

    pub fn with_password(password: &[u8]) -> Self {
        let mut seed = INITIAL_KEYS;
        for &byte in password {
            keys_update(&mut seed, byte);
        }
        Self { seed }
    }

    fn apply(&self, buffer: &mut [u8], encrypting: bool) {
        let mut keys = self.seed;
        for idx in (0..buffer.len()).step_by(2) {
            let mask = keystream_byte(&keys);
            let plain = if encrypting {
                buffer[idx]
            } else {
                buffer[idx] ^ mask
            };
            buffer[idx] ^= mask;
            keys_update(&mut keys, plain);
        }
    }
}

impl Default for IpfNameCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl NameCipher for IpfNameCipher {
    fn encrypt(&self, name: &str) -> Vec<u8> {
        let mut bytes = name.as_bytes().to_vec();
        self.apply(&mut bytes, true);
        bytes
    }

    fn decrypt(&self, bytes: &[u8]) -> Option<String> {
        let mut plain = bytes.to_vec();
        self.apply(&mut plain, false);
        String::from_utf8(plain).ok()
    }
}

fn crc32_step(crc: u32, b: u8) -> u32 {
    CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8)
}

fn keys_update(keys: &mut [u32; 3], b: u8) {
    keys[0] = crc32_step(keys[0], b);
    keys[1] = 0x8088405u32
        .wrapping_mul((keys[0] as u8 as u32).wrapping_add(keys[1]))
        .wrapping_add(1);
    keys[2] = crc32_step(keys[2], (keys[1] >> 24) as u8);
}

fn keystream_byte(keys: &[u32; 3]) -> u8 {
    let v = (keys[2] & 0xFFFD) | 2;
    (v.wrapping_mul(v ^ 1) >> 8) as u8
}
