/// POSIX `cksum` checksum.
///
/// CRC with polynomial 0x04C11DB7, MSB-first, zero initial value, with the
/// message length appended (least significant byte first, as few bytes as
/// needed) and the result complemented. This is *not* the zlib/Ethernet
/// CRC-32, which is reflected and pre-inverted.

const POLY: u32 = 0x04C1_1DB7;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental `cksum` over a stream of byte slices.
#[derive(Debug, Clone, Default)]
pub struct Cksum {
    crc: u32,
    len: u64,
}

impl Cksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;
        for &b in data {
            crc = (crc << 8) ^ TABLE[((crc >> 24) ^ b as u32) as usize];
        }
        self.crc = crc;
        self.len += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> u32 {
        let mut crc = self.crc;
        let mut n = self.len;
        while n != 0 {
            crc = (crc << 8) ^ TABLE[((crc >> 24) ^ (n & 0xFF) as u32) as usize];
            n >>= 8;
        }
        !crc
    }
}

/// One-shot `cksum` of a buffer.
pub fn cksum(data: &[u8]) -> u32 {
    let mut c = Cksum::new();
    c.update(data);
    c.finalize()
}
