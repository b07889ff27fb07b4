//! Tap device naming.

use crate::runtime::constants::network as net_consts;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};

/// Names the allocator tries, in order, starting at `preferred`.
///
/// The trailing number is advanced: `fctap3`, `fctap4`, ... A name with no
/// trailing digits is tried as-is first, then with `0`, `1`, ... appended.
/// Candidates stop at the kernel's interface name limit or after
/// `MAX_TAP_CANDIDATES` names.
pub fn tap_candidates(preferred: &str) -> FlotillaResult<Vec<String>> {
    if preferred.is_empty()
        || preferred.len() > net_consts::MAX_IFNAME_LEN
        || !preferred.is_ascii()
        || preferred.contains(['/', ' ', ':'])
    {
        return Err(FlotillaError::Network(format!(
            "invalid tap device name '{}'",
            preferred
        )));
    }

    let base = preferred.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &preferred[base.len()..];

    let mut candidates = Vec::with_capacity(net_consts::MAX_TAP_CANDIDATES);
    candidates.push(preferred.to_string());

    let mut next: u64 = if digits.is_empty() {
        0
    } else {
        digits
            .parse::<u64>()
            .map_err(|_| {
                FlotillaError::Network(format!("tap name '{}' has an oversized suffix", preferred))
            })?
            .saturating_add(1)
    };

    while candidates.len() < net_consts::MAX_TAP_CANDIDATES {
        let name = format!("{}{}", base, next);
        if name.len() > net_consts::MAX_IFNAME_LEN {
            break;
        }
        if name != preferred {
            candidates.push(name);
        }
        next = match next.checked_add(1) {
            Some(n) => n,
            None => break,
        };
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_numeric_suffix_advances() {
        let names = tap_candidates("fctap1").unwrap();
        assert_eq!(&names[..3], ["fctap1", "fctap2", "fctap3"]);
        assert_eq!(names.len(), net_consts::MAX_TAP_CANDIDATES);
    }

    #[test]
    fn test_name_without_digits() {
        let names = tap_candidates("tap").unwrap();
        assert_eq!(&names[..3], ["tap", "tap0", "tap1"]);
    }

    #[test]
    fn test_leading_zeros_not_repeated() {
        let names = tap_candidates("tap00").unwrap();
        assert_eq!(&names[..3], ["tap00", "tap1", "tap2"]);
    }

    #[test]
    fn test_stops_at_ifname_limit() {
        // 13 chars of prefix leaves room for two digits
        let names = tap_candidates("abcdefghijklm98").unwrap();
        assert_eq!(names, vec!["abcdefghijklm98", "abcdefghijklm99"]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(tap_candidates("").is_err());
        assert!(tap_candidates("this-name-is-too-long").is_err());
        assert!(tap_candidates("tap/0").is_err());
    }

    proptest! {
        #[test]
        fn prop_candidates_unique_and_valid(prefix in "[a-z]{1,8}", n in 0u32..10_000) {
            let preferred = format!("{}{}", prefix, n);
            let names = tap_candidates(&preferred).unwrap();

            prop_assert_eq!(&names[0], &preferred);
            let unique: std::collections::HashSet<_> = names.iter().collect();
            prop_assert_eq!(unique.len(), names.len());
            for name in &names {
                prop_assert!(name.len() <= net_consts::MAX_IFNAME_LEN);
                prop_assert!(name.starts_with(&prefix));
            }
        }
    }
}
