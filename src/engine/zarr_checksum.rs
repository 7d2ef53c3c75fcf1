//! Aggregate Zarr checksum (spec.md GLOSSARY, §4.5).
//!
//! Format: `hex-digest + "-" + file_count + "--" + total_bytes`, where
//! `hex-digest` is the MD5 of the concatenation of each entry's own digest
//! bytes, in path-sorted order — the Zarr-tree analogue of the multipart
//! ETag's part-ordered concatenation in [`super::multipart_etag`].

use md5::{Digest, Md5};

/// One entry contributing to the aggregate: its relative path (used only for
/// sorting — the digest itself is order-sensitive per entry, not per path
/// string), md5 digest, and size.
#[derive(Debug, Clone)]
pub struct ChecksumEntry {
    pub path: String,
    pub md5: [u8; 16],
    pub size: u64,
}

/// Compute the aggregate Zarr checksum over `entries`.
///
/// Entries are hashed in path-sorted order so the result is independent of
/// the order downloads completed in.
pub fn aggregate(entries: &[ChecksumEntry]) -> String {
    let mut sorted: Vec<&ChecksumEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Md5::new();
    let mut total_bytes = 0u64;
    for entry in &sorted {
        hasher.update(entry.md5);
        total_bytes += entry.size;
    }
    let digest = hasher.finalize();
    format!(
        "{}-{}--{}",
        hex::encode(digest),
        sorted.len(),
        total_bytes
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_of_entries_passed_in_does_not_matter() {
        let a = ChecksumEntry {
            path: "a/0".into(),
            md5: Md5::digest(b"hello").into(),
            size: 5,
        };
        let b = ChecksumEntry {
            path: "a/1".into(),
            md5: Md5::digest(b"world").into(),
            size: 5,
        };
        assert_eq!(
            aggregate(&[a.clone(), b.clone()]),
            aggregate(&[b, a])
        );
    }

    #[test]
    fn format_matches_glossary_shape() {
        let a = ChecksumEntry {
            path: "a/0".into(),
            md5: Md5::digest(b"hello").into(),
            size: 5,
        };
        let result = aggregate(&[a]);
        let mut parts = result.splitn(2, '-');
        let hex_part = parts.next().unwrap();
        assert_eq!(hex_part.len(), 32);
        assert_eq!(result, format!("{}-1--5", hex_part));
    }
}
