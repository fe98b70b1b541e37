//! Device identity matching.
//!
//! Bluetooth stacks report device addresses in different notations,
//! e.g. `90:F6:44:AA:EE:67`, `90-f6-44-aa-ee-67` or `90F644AAEE67`.
//! Addresses are therefore compared in a normalized form.

// Number of hex digits in a 6-byte address
const ADDRESS_DIGITS: usize = 12;

/// The three normalized notations of a device address.
///
/// All notations use uppercase hex digits.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AddressForms {
    /// Colon-separated, e.g. `90:F6:44:AA:EE:67`.
    pub colon: String,
    /// Hyphen-separated, e.g. `90-F6-44-AA-EE-67`.
    pub hyphen: String,
    /// Without separators, e.g. `90F644AAEE67`.
    pub bare: String,
}

impl AddressForms {
    /// Returns all three notations.
    #[must_use]
    pub fn as_array(&self) -> [&str; 3] {
        [&self.colon, &self.hyphen, &self.bare]
    }

    /// Returns whether any notation is shared with `other`.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.as_array()
            .iter()
            .any(|form| other.as_array().contains(form))
    }
}

/// Normalizes a device address.
///
/// Existing `:` and `-` separators are removed and the digits uppercased.
/// Separated notations assume a 12-digit address: shorter input yields
/// empty groups and longer input is truncated, but the bare notation
/// always keeps every digit.
#[must_use]
pub fn normalize(address: &str) -> AddressForms {
    let digits: Vec<char> = address
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let groups: Vec<String> = (0..ADDRESS_DIGITS)
        .step_by(2)
        .map(|i| digits.iter().skip(i).take(2).collect())
        .collect();

    AddressForms {
        colon: groups.join(":"),
        hyphen: groups.join("-"),
        bare: digits.into_iter().collect(),
    }
}

/// Identity of an observed device.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct DeviceIdentity {
    /// Address as reported by the Bluetooth stack.
    pub address: String,
    /// Advertised name, if any.
    pub name: Option<String>,
}

/// Reason a device was recognized as the target.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "lowercase")]
pub enum MatchReason {
    /// One of the configured addresses matched.
    Address,
    /// One of the configured names is part of the device name.
    Name,
}

/// Configured target devices.
///
/// Addresses may be given in any notation accepted by [`normalize`].
/// Names match case-insensitively as substrings of the advertised name.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct Targets {
    /// Target addresses.
    pub addresses: Vec<String>,
    /// Target name fragments.
    pub names: Vec<String>,
}

impl Targets {
    /// Constructs a new target set.
    pub fn new<A, N>(addresses: A, names: N) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks whether the identity belongs to a target device.
    ///
    /// An address match takes precedence over a name match.
    #[must_use]
    pub fn match_identity(&self, identity: &DeviceIdentity) -> Option<MatchReason> {
        let forms = normalize(&identity.address);

        if self
            .addresses
            .iter()
            .any(|addr| normalize(addr).intersects(&forms))
        {
            return Some(MatchReason::Address);
        }

        let name = identity.name.as_deref()?.to_lowercase();

        self.names
            .iter()
            .filter(|target| !target.is_empty())
            .any(|target| name.contains(&target.to_lowercase()))
            .then_some(MatchReason::Name)
    }

    /// Returns whether the identity belongs to a target device.
    #[must_use]
    pub fn is_target(&self, identity: &DeviceIdentity) -> bool {
        self.match_identity(identity).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(address: &str, name: Option<&str>) -> DeviceIdentity {
        DeviceIdentity {
            address: address.to_string(),
            name: name.map(ToString::to_string),
        }
    }

    #[test]
    fn normalize_forms() {
        let forms = normalize("90:f6:44:aa:ee:67");

        assert_eq!(forms.colon, "90:F6:44:AA:EE:67", "colon form should be correct");
        assert_eq!(forms.hyphen, "90-F6-44-AA-EE-67", "hyphen form should be correct");
        assert_eq!(forms.bare, "90F644AAEE67", "bare form should be correct");
    }

    #[test]
    fn normalize_idempotent() {
        let forms = normalize("90-f6-44-AA-ee-67");

        for form in forms.as_array() {
            assert_eq!(normalize(form), forms, "normalizing {form} should be idempotent");
        }
    }

    #[test]
    fn normalize_malformed() {
        let forms = normalize("AB:C");

        assert_eq!(forms.colon, "AB:C::::", "colon form should keep empty groups");
        assert_eq!(forms.bare, "ABC", "bare form should be correct");
        assert_eq!(normalize(&forms.colon), forms, "malformed form should be stable");
    }

    #[test]
    fn match_any_configured_form() {
        for configured in ["90:F6:44:AA:EE:67", "90-F6-44-AA-EE-67", "90f644aaee67"] {
            let targets = Targets::new([configured], Vec::<String>::new());

            for observed in ["90:F6:44:AA:EE:67", "90-f6-44-aa-ee-67", "90F644AAEE67"] {
                assert_eq!(
                    targets.match_identity(&identity(observed, None)),
                    Some(MatchReason::Address),
                    "{observed} should match {configured}"
                );
            }
        }
    }

    #[test]
    fn match_name() {
        let targets = Targets::new(["00:11:22:33:44:55"], ["FreeBuds SE 2"]);

        assert_eq!(
            targets.match_identity(&identity("AA:BB:CC:DD:EE:FF", Some("HUAWEI freebuds se 2"))),
            Some(MatchReason::Name),
            "name should match case-insensitively"
        );
        assert!(
            !targets.is_target(&identity("AA:BB:CC:DD:EE:FF", Some("FreeBuds Pro"))),
            "other name should not match"
        );
        assert!(
            !targets.is_target(&identity("AA:BB:CC:DD:EE:FF", None)),
            "missing name should not match"
        );
    }

    #[test]
    fn address_takes_precedence() {
        let targets = Targets::new(["AA:BB:CC:DD:EE:FF"], ["FreeBuds"]);

        assert_eq!(
            targets.match_identity(&identity("aa-bb-cc-dd-ee-ff", Some("FreeBuds SE 2"))),
            Some(MatchReason::Address),
            "address match should be reported"
        );
    }

    #[test]
    fn empty_name_matches_nothing() {
        let targets = Targets::new(Vec::<String>::new(), [""]);

        assert!(
            !targets.is_target(&identity("AA:BB:CC:DD:EE:FF", Some("Speaker"))),
            "empty name fragment should be ignored"
        );
    }
}
