//! Concrete ID types used by the deployer.

use crate::{define_cid, define_id};

// =============================================================================
// Local records
// =============================================================================

define_id!(DiskRecordId, "disk");

// =============================================================================
// Cloud resources
// =============================================================================

define_cid!(VmCid);
define_cid!(DiskCid);
define_cid!(StemcellCid);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_disk_record_id_roundtrip() {
        let id = DiskRecordId::new();
        let s = id.to_string();
        assert!(s.starts_with("disk_"));
        assert_eq!(DiskRecordId::parse(&s).unwrap(), id);
    }

    #[test]
    fn test_disk_record_id_invalid_prefix() {
        let err = DiskRecordId::parse("vol_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_disk_record_id_missing_separator() {
        assert_eq!(
            DiskRecordId::parse("disk01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
    }

    #[test]
    fn test_disk_record_id_empty() {
        assert!(DiskRecordId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_disk_record_ids_sort_by_creation() {
        let first = DiskRecordId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = DiskRecordId::new();
        assert!(first < second);
    }

    #[test]
    fn test_cid_rejects_empty() {
        assert_eq!(VmCid::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn test_cid_serializes_as_plain_string() {
        let cid = DiskCid::parse("vol-0abc").unwrap();
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, "\"vol-0abc\"");

        let back: DiskCid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
        assert!(serde_json::from_str::<DiskCid>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_cid_preserves_backend_format(s in "[a-zA-Z0-9:/_.-]{1,64}") {
            let cid = StemcellCid::parse(s.clone()).unwrap();
            prop_assert_eq!(cid.as_str(), s.as_str());
            prop_assert_eq!(cid.to_string(), s);
        }
    }
}
