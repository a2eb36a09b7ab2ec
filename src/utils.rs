//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Canonical form of a suite number for comparison: trimmed, uppercased.
pub fn normalise_suite(suite: &str) -> String {
    suite.trim().to_uppercase()
}

/// Prefix under which every key owned by `owner` is stored.
///
/// The owner is hashed so that the prefix has a fixed width and no caller
/// supplied id can reach into another owner's range.
pub(crate) fn owner_prefix(owner: &str) -> String {
    format!("{}/", sha256::digest(owner))
}

pub(crate) fn owned_key(owner: &str, member: &str) -> String {
    format!("{}{member}", owner_prefix(owner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suites_compare_loosely() {
        assert_eq!(normalise_suite("  vc-010 "), normalise_suite("VC-010"));
        assert_ne!(normalise_suite("VC-010"), normalise_suite("VC-099"));
    }

    #[test]
    fn owner_ranges_do_not_nest() {
        let owner = owner_prefix("pkg_1abc");
        let nested = owned_key("pkg_1abc/x", "entry");

        assert_eq!(owner.len(), 65);
        assert!(owned_key("pkg_1abc", "entry").starts_with(&owner));
        assert!(!nested.starts_with(&owner));
    }
}
