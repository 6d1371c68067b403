use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use digest::Digest as _;
use md5::Md5;
use sha2::Sha256;

use cassbak_types::{Error, Result};

pub const MD5_LEN: usize = 16;
pub const SHA256_LEN: usize = 32;

const HEADER_LEN: usize = 16;

/// Per-part MD5 and SHA-256 digests of a file, split on a fixed part size.
///
/// A zero-length input still carries exactly one (empty) part, because S3
/// requires content hashes even for an empty PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDigests {
    part_size: u64,
    total_length: u64,
    md5_parts: Vec<[u8; MD5_LEN]>,
    sha256_parts: Vec<[u8; SHA256_LEN]>,
}

impl PartDigests {
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn parts(&self) -> u64 {
        parts_for(self.total_length, self.part_size)
    }

    /// Byte offset of 1-indexed part `n`.
    pub fn part_offset(&self, n: u64) -> u64 {
        assert!(n >= 1 && n <= self.parts(), "part_offset: invalid part {n}");
        (n - 1) * self.part_size
    }

    /// Byte length of 1-indexed part `n`. The final part carries the
    /// remainder, which for an exact multiple is a full part.
    pub fn part_length(&self, n: u64) -> u64 {
        assert!(n >= 1 && n <= self.parts(), "part_length: invalid part {n}");
        if n == self.parts() {
            self.total_length - (n - 1) * self.part_size
        } else {
            self.part_size
        }
    }

    /// Base64 MD5 for the `Content-MD5` request header of part `n`.
    pub fn part_content_md5(&self, n: u64) -> String {
        assert!(n >= 1 && n <= self.parts(), "part_content_md5: invalid part {n}");
        STANDARD.encode(self.md5_parts[(n - 1) as usize])
    }

    /// Hex SHA-256 for the `x-amz-content-sha256` request header of part `n`.
    pub fn part_content_sha256(&self, n: u64) -> String {
        assert!(n >= 1 && n <= self.parts(), "part_content_sha256: invalid part {n}");
        hex::encode(self.sha256_parts[(n - 1) as usize])
    }

    /// Layout: `part_size u64 BE || total_length u64 BE || N*md5 || N*sha256`.
    /// N is recomputed from the header on unmarshal.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.md5_parts.len() * MD5_LEN + self.sha256_parts.len() * SHA256_LEN);
        out.extend_from_slice(&self.part_size.to_be_bytes());
        out.extend_from_slice(&self.total_length.to_be_bytes());
        for part in &self.md5_parts {
            out.extend_from_slice(part);
        }
        for part in &self.sha256_parts {
            out.extend_from_slice(part);
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidData("part digests: short header".into()));
        }
        let part_size = u64::from_be_bytes(data[0..8].try_into().unwrap());
        let total_length = u64::from_be_bytes(data[8..16].try_into().unwrap());
        if part_size == 0 {
            return Err(Error::InvalidData("part digests: zero part size".into()));
        }
        let parts = parts_for(total_length, part_size) as usize;
        let expected = HEADER_LEN + parts * (MD5_LEN + SHA256_LEN);
        if data.len() != expected {
            return Err(Error::InvalidData(format!(
                "part digests: expected {expected} bytes for {parts} parts, got {}",
                data.len()
            )));
        }

        let mut md5_parts = Vec::with_capacity(parts);
        let mut sha256_parts = Vec::with_capacity(parts);
        let md5_region = &data[HEADER_LEN..HEADER_LEN + parts * MD5_LEN];
        for chunk in md5_region.chunks_exact(MD5_LEN) {
            md5_parts.push(chunk.try_into().unwrap());
        }
        let sha256_region = &data[HEADER_LEN + parts * MD5_LEN..];
        for chunk in sha256_region.chunks_exact(SHA256_LEN) {
            sha256_parts.push(chunk.try_into().unwrap());
        }

        Ok(PartDigests {
            part_size,
            total_length,
            md5_parts,
            sha256_parts,
        })
    }
}

fn parts_for(total_length: u64, part_size: u64) -> u64 {
    if total_length == 0 {
        return 1;
    }
    total_length.div_ceil(part_size)
}

/// Streaming accumulator producing [`PartDigests`] in a single pass.
pub struct PartDigestsMaker {
    part_size: u64,
    md5: Md5,
    sha256: Sha256,
    pending: u64,
    total_length: u64,
    md5_parts: Vec<[u8; MD5_LEN]>,
    sha256_parts: Vec<[u8; SHA256_LEN]>,
}

impl PartDigestsMaker {
    pub fn new(part_size: u64) -> Self {
        assert!(part_size > 0, "part size must be non-zero");
        PartDigestsMaker {
            part_size,
            md5: Md5::new(),
            sha256: Sha256::new(),
            pending: 0,
            total_length: 0,
            md5_parts: Vec::new(),
            sha256_parts: Vec::new(),
        }
    }

    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.pending == self.part_size {
                self.flush_part();
            }
            let remaining = (self.part_size - self.pending) as usize;
            let take = remaining.min(data.len());
            let (head, tail) = data.split_at(take);
            self.md5.update(head);
            self.sha256.update(head);
            self.pending += take as u64;
            data = tail;
        }
    }

    pub fn finish(mut self) -> PartDigests {
        if self.pending > 0 || self.md5_parts.is_empty() {
            self.flush_part();
        }
        PartDigests {
            part_size: self.part_size,
            total_length: self.total_length,
            md5_parts: self.md5_parts,
            sha256_parts: self.sha256_parts,
        }
    }

    fn flush_part(&mut self) {
        let md5 = std::mem::replace(&mut self.md5, Md5::new());
        let sha256 = std::mem::replace(&mut self.sha256, Sha256::new());
        self.md5_parts.push(md5.finalize().into());
        self.sha256_parts.push(sha256.finalize().into());
        self.total_length += self.pending;
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md5_of(data: &[u8]) -> [u8; MD5_LEN] {
        Md5::digest(data).into()
    }

    fn sha256_of(data: &[u8]) -> [u8; SHA256_LEN] {
        Sha256::digest(data).into()
    }

    #[test]
    fn two_part_split_matches_direct_hashes() {
        let mut maker = PartDigestsMaker::new(1024);
        maker.write(&[0u8; 1024]);
        maker.write(&[0u8; 512]);
        let pd = maker.finish();

        assert_eq!(pd.parts(), 2);
        assert_eq!(pd.total_length(), 1536);
        assert_eq!(pd.part_length(1), 1024);
        assert_eq!(pd.part_length(2), 512);
        assert_eq!(pd.part_offset(1), 0);
        assert_eq!(pd.part_offset(2), 1024);

        assert_eq!(pd.md5_parts[0], md5_of(&[0u8; 1024]));
        assert_eq!(pd.md5_parts[1], md5_of(&[0u8; 512]));
        assert_eq!(pd.sha256_parts[0], sha256_of(&[0u8; 1024]));
        assert_eq!(pd.sha256_parts[1], sha256_of(&[0u8; 512]));
    }

    #[test]
    fn empty_input_yields_one_empty_part() {
        let pd = PartDigestsMaker::new(1024).finish();
        assert_eq!(pd.parts(), 1);
        assert_eq!(pd.total_length(), 0);
        assert_eq!(pd.part_length(1), 0);
        assert_eq!(pd.md5_parts[0], md5_of(b""));
        assert_eq!(pd.sha256_parts[0], sha256_of(b""));
    }

    #[test]
    fn exact_multiple_keeps_full_final_part() {
        let mut maker = PartDigestsMaker::new(1024);
        maker.write(&[7u8; 2048]);
        let pd = maker.finish();
        assert_eq!(pd.parts(), 2);
        assert_eq!(pd.part_length(2), 1024);
        assert_eq!(pd.part_offset(2), 1024);
    }

    #[test]
    fn split_is_independent_of_write_granularity() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let mut whole = PartDigestsMaker::new(1000);
        whole.write(&data);
        let a = whole.finish();

        let mut chunked = PartDigestsMaker::new(1000);
        for chunk in data.chunks(17) {
            chunked.write(chunk);
        }
        let b = chunked.finish();

        assert_eq!(a, b);
    }

    #[test]
    fn marshal_round_trips() {
        let mut maker = PartDigestsMaker::new(1024);
        maker.write(&[1u8; 1500]);
        let pd = maker.finish();

        let raw = pd.marshal();
        let back = PartDigests::unmarshal(&raw).unwrap();
        assert_eq!(back, pd);
        assert_eq!(back.parts(), pd.parts());
        assert_eq!(back.part_length(2), pd.part_length(2));
    }

    #[test]
    fn unmarshal_rejects_malformed_data() {
        assert!(PartDigests::unmarshal(&[0u8; 8]).is_err());

        let mut maker = PartDigestsMaker::new(1024);
        maker.write(&[1u8; 100]);
        let mut raw = maker.finish().marshal();
        raw.pop();
        assert!(PartDigests::unmarshal(&raw).is_err());
    }

    #[test]
    fn content_headers_use_expected_encodings() {
        let mut maker = PartDigestsMaker::new(1024);
        maker.write(b"header encoding check");
        let pd = maker.finish();

        assert_eq!(
            pd.part_content_md5(1),
            STANDARD.encode(md5_of(b"header encoding check"))
        );
        assert_eq!(
            pd.part_content_sha256(1),
            hex::encode(sha256_of(b"header encoding check"))
        );
    }
}
