use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Derives a deterministic UUIDv4 for a subread from its parent read id and a
/// descriptor of the subread (here, the sequence range). The first 16 bytes of
/// `SHA-256(parent_id || descriptor)` are stamped with the RFC 4122 version
/// and variant bits and rendered as a lowercase hyphenated UUID.
pub fn derive_uuid(input_uuid: &str, desc: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input_uuid.as_bytes());
    hasher.update(desc.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let mut uuid = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            uuid.push('-');
        }
        write!(uuid, "{:02x}", b).unwrap();
    }
    uuid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_and_version_bits() {
        let uuid = derive_uuid("11111111-1111-1111-1111-111111111111", "500-527");
        assert_eq!(uuid.len(), 36);
        let fields: Vec<&str> = uuid.split('-').collect();
        assert_eq!(
            fields.iter().map(|f| f.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        // Version 4, RFC 4122 variant.
        assert_eq!(fields[2].chars().next(), Some('4'));
        assert!(matches!(
            fields[3].chars().next(),
            Some('8') | Some('9') | Some('a') | Some('b')
        ));
    }

    #[test]
    fn test_deterministic() {
        let a = derive_uuid("11111111-1111-1111-1111-111111111111", "500-527");
        let b = derive_uuid("11111111-1111-1111-1111-111111111111", "500-527");
        assert_eq!(a, b);
    }

    #[test]
    fn test_descriptor_changes_result() {
        let parent = "11111111-1111-1111-1111-111111111111";
        assert_ne!(derive_uuid(parent, "0-500"), derive_uuid(parent, "528-1028"));
        assert_ne!(
            derive_uuid(parent, "0-500"),
            derive_uuid("22222222-2222-2222-2222-222222222222", "0-500")
        );
    }
}
