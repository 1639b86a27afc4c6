//! User ranks: sets of permission tags.
//!
//! A rank is a set of tags. Bare tags are `user`, `admin` and `system`;
//! namespaced tags are `mod.<group>`, `usr.<group>` and `ban.<group>`, where
//! `<group>` is made of ASCII letters, digits, `.`, `_` and `-`. The string
//! form is the sorted tags joined by commas, and it is what gets persisted.
//!
//! ```
//! use warden_authn::rank::Rank;
//!
//! let rank: Rank = "usr.gophers,admin,user".parse()?;
//! assert!(rank.has_user("gophers"));
//! assert_eq!(rank.to_string(), "admin,user,usr.gophers");
//! # Ok::<(), warden_authn::error::RankError>(())
//! ```
//!
//! `org.<name>` tags are reserved for organization names and are never legal
//! in a user rank; see [`is_valid_org_name`].

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::RankError;

/// Longest tag accepted by [`Rank::parse`].
pub const RANK_LENGTH_CAP: usize = 128;

/// The base user tag.
pub const TAG_USER: &str = "user";
/// The administrator tag.
pub const TAG_ADMIN: &str = "admin";
/// The system tag.
pub const TAG_SYSTEM: &str = "system";
/// Prefix of group moderator tags.
pub const TAG_MOD_PREFIX: &str = "mod";
/// Prefix of group membership tags.
pub const TAG_USER_PREFIX: &str = "usr";
/// Prefix of group ban tags.
pub const TAG_BAN_PREFIX: &str = "ban";
/// Prefix of organization names.
pub const TAG_ORG_PREFIX: &str = "org";

const RANK_SEPARATOR: char = '.';
const TAG_LIST_SEPARATOR: char = ',';

/// A set of permission tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Rank(BTreeSet<String>);

impl Rank {
    /// The empty rank.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `{user}`.
    #[must_use]
    pub fn base_user() -> Self {
        Self::new().with(TAG_USER)
    }

    /// `{user, admin}`.
    #[must_use]
    pub fn admin() -> Self {
        Self::base_user().with(TAG_ADMIN)
    }

    /// `{system}`.
    #[must_use]
    pub fn system() -> Self {
        Self::new().with(TAG_SYSTEM)
    }

    /// Parses a comma-separated tag list.
    ///
    /// The empty string yields the empty rank.
    ///
    /// # Errors
    ///
    /// Returns [`RankError::InvalidRank`] for the first tag that is longer than
    /// [`RANK_LENGTH_CAP`] or matches none of the recognized grammars.
    pub fn parse(s: &str) -> Result<Self, RankError> {
        if s.is_empty() {
            return Ok(Self::new());
        }
        let mut rank = Self::new();
        for tag in s.split(TAG_LIST_SEPARATOR) {
            if !is_valid_tag(tag) {
                return Err(RankError::invalid_rank(tag));
            }
            rank.0.insert(tag.to_owned());
        }
        Ok(rank)
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the rank holds no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the tags in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// The tags, sorted.
    #[must_use]
    pub fn to_slice(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// Returns `true` if the rank holds `tag`.
    #[must_use]
    pub fn has(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// Returns `true` if the rank moderates `group`.
    #[must_use]
    pub fn has_mod(&self, group: &str) -> bool {
        self.has(&to_mod_name(group))
    }

    /// Returns `true` if the rank is a member of `group`.
    #[must_use]
    pub fn has_user(&self, group: &str) -> bool {
        self.has(&to_usr_name(group))
    }

    /// Returns `true` if the rank is banned from `group`.
    #[must_use]
    pub fn has_ban(&self, group: &str) -> bool {
        self.has(&to_ban_name(group))
    }

    /// Adds `tag` as is. No grammar check is made.
    pub fn add(&mut self, tag: impl Into<String>) -> &mut Self {
        self.0.insert(tag.into());
        self
    }

    /// Builder form of [`Rank::add`].
    #[must_use]
    pub fn with(mut self, tag: impl Into<String>) -> Self {
        self.add(tag);
        self
    }

    /// Adds the moderator tag of `group`.
    pub fn add_mod(&mut self, group: &str) -> &mut Self {
        self.add(to_mod_name(group))
    }

    /// Adds the membership tag of `group`.
    pub fn add_user(&mut self, group: &str) -> &mut Self {
        self.add(to_usr_name(group))
    }

    /// Adds the ban tag of `group`.
    pub fn add_ban(&mut self, group: &str) -> &mut Self {
        self.add(to_ban_name(group))
    }

    /// Adds every tag of `other`.
    pub fn extend(&mut self, other: &Rank) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Removes every tag of `other`.
    pub fn remove(&mut self, other: &Rank) {
        for tag in &other.0 {
            self.0.remove(tag);
        }
    }

    /// The tags present in both ranks.
    #[must_use]
    pub fn intersect(&self, other: &Rank) -> Rank {
        Rank(self.0.intersection(&other.0).cloned().collect())
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(tag)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Rank {
    type Err = RankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<S: Into<String>> FromIterator<S> for Rank {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Rank(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a Rank {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for Rank {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rank {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Rank::parse(&s).map_err(de::Error::custom)
    }
}

/// The moderator tag of `group`.
#[must_use]
pub fn to_mod_name(group: &str) -> String {
    format!("{TAG_MOD_PREFIX}{RANK_SEPARATOR}{group}")
}

/// The membership tag of `group`.
#[must_use]
pub fn to_usr_name(group: &str) -> String {
    format!("{TAG_USER_PREFIX}{RANK_SEPARATOR}{group}")
}

/// The ban tag of `group`.
#[must_use]
pub fn to_ban_name(group: &str) -> String {
    format!("{TAG_BAN_PREFIX}{RANK_SEPARATOR}{group}")
}

/// The organization name for `name`.
#[must_use]
pub fn to_org_name(name: &str) -> String {
    format!("{TAG_ORG_PREFIX}{RANK_SEPARATOR}{name}")
}

/// Returns `true` if `orgname` is a well-formed `org.<name>` string.
#[must_use]
pub fn is_valid_org_name(orgname: &str) -> bool {
    has_prefixed_ident(orgname, TAG_ORG_PREFIX)
}

/// Splits a group tag into its prefix and group.
///
/// # Errors
///
/// Returns [`RankError::InvalidRank`] unless the tag is `mod.`, `usr.` or
/// `ban.` followed by a group name.
pub fn split_tag(tag: &str) -> Result<(&str, &str), RankError> {
    match tag.split_once(RANK_SEPARATOR) {
        Some((prefix @ (TAG_MOD_PREFIX | TAG_USER_PREFIX | TAG_BAN_PREFIX), group))
            if !group.is_empty() =>
        {
            Ok((prefix, group))
        },
        _ => Err(RankError::invalid_rank(tag)),
    }
}

fn is_valid_tag(tag: &str) -> bool {
    if tag.len() > RANK_LENGTH_CAP {
        return false;
    }
    matches!(tag, TAG_USER | TAG_ADMIN | TAG_SYSTEM)
        || has_prefixed_ident(tag, TAG_MOD_PREFIX)
        || has_prefixed_ident(tag, TAG_USER_PREFIX)
        || has_prefixed_ident(tag, TAG_BAN_PREFIX)
}

fn has_prefixed_ident(tag: &str, prefix: &str) -> bool {
    tag.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(RANK_SEPARATOR))
        .is_some_and(is_ident)
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(Rank::base_user().to_string(), "user");
        assert_eq!(Rank::admin().to_string(), "admin,user");
        assert_eq!(Rank::system().to_string(), "system");
        assert!(Rank::new().is_empty());
    }

    #[test]
    fn test_string_form_is_sorted() {
        let rank = Rank::new().with("usr.b").with("admin").with("mod.a");
        assert_eq!(rank.to_string(), "admin,mod.a,usr.b");
        assert_eq!(rank.to_slice(), vec!["admin", "mod.a", "usr.b"]);
    }

    #[test]
    fn test_empty_string_parses_to_empty_rank() {
        assert_eq!(Rank::parse("").unwrap(), Rank::new());
    }

    #[rstest]
    #[case("user")]
    #[case("admin,system,user")]
    #[case("mod.gophers")]
    #[case("usr.a-b_c.d")]
    #[case("ban.X9")]
    fn test_parse_accepts(#[case] s: &str) {
        let rank = Rank::parse(s).unwrap();
        assert_eq!(rank.to_string(), s);
    }

    #[rstest]
    #[case("root")]
    #[case("org.acme")]
    #[case("mod.")]
    #[case("mod")]
    #[case("usr.has space")]
    #[case("user,")]
    #[case("user,,admin")]
    #[case("modx.group")]
    #[case("ban.a/b")]
    fn test_parse_rejects(#[case] s: &str) {
        assert!(matches!(Rank::parse(s), Err(RankError::InvalidRank { .. })), "{s}");
    }

    #[test]
    fn test_length_cap() {
        let at_cap = format!("usr.{}", "a".repeat(RANK_LENGTH_CAP - 4));
        assert!(Rank::parse(&at_cap).is_ok());

        let over_cap = format!("usr.{}", "a".repeat(RANK_LENGTH_CAP - 3));
        let err = Rank::parse(&over_cap).unwrap_err();
        assert_eq!(err, RankError::invalid_rank(over_cap));
    }

    #[test]
    fn test_group_helpers() {
        let mut rank = Rank::new();
        rank.add_mod("g").add_user("g").add_ban("h");
        assert!(rank.has_mod("g"));
        assert!(rank.has_user("g"));
        assert!(rank.has_ban("h"));
        assert!(!rank.has_ban("g"));
    }

    #[test]
    fn test_remove_and_intersect() {
        let mut rank = Rank::admin().with("usr.g");
        let other = Rank::new().with(TAG_ADMIN).with("mod.x");

        assert_eq!(rank.intersect(&other), Rank::new().with(TAG_ADMIN));

        rank.remove(&other);
        assert_eq!(rank.to_string(), "user,usr.g");
    }

    #[test]
    fn test_org_names() {
        assert_eq!(to_org_name("acme"), "org.acme");
        assert!(is_valid_org_name("org.acme-corp"));
        assert!(!is_valid_org_name("org."));
        assert!(!is_valid_org_name("mod.acme"));
    }

    #[rstest]
    #[case("mod.g", Some(("mod", "g")))]
    #[case("usr.a.b", Some(("usr", "a.b")))]
    #[case("ban.x", Some(("ban", "x")))]
    #[case("org.x", None)]
    #[case("admin", None)]
    #[case("mod.", None)]
    fn test_split_tag(#[case] tag: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(split_tag(tag).ok(), expected);
    }

    #[test]
    fn test_serde_as_string() {
        let rank = Rank::admin().with("mod.g");
        let json = serde_json::to_string(&rank).unwrap();
        assert_eq!(json, r#""admin,mod.g,user""#);
        assert_eq!(serde_json::from_str::<Rank>(&json).unwrap(), rank);
        assert!(serde_json::from_str::<Rank>(r#""org.nope""#).is_err());
    }

    fn arb_tag() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(TAG_USER.to_owned()),
            Just(TAG_ADMIN.to_owned()),
            Just(TAG_SYSTEM.to_owned()),
            ("(mod|usr|ban)", "[A-Za-z0-9._-]{1,40}").prop_map(|(p, g)| format!("{p}.{g}")),
        ]
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_display(tags in proptest::collection::vec(arb_tag(), 0..12)) {
            let rank: Rank = tags.into_iter().collect();
            let parsed = Rank::parse(&rank.to_string()).unwrap();
            prop_assert_eq!(parsed, rank);
        }

        #[test]
        fn prop_unknown_prefix_is_rejected(prefix in "[a-z]{1,6}", group in "[a-z]{1,8}") {
            prop_assume!(![TAG_MOD_PREFIX, TAG_USER_PREFIX, TAG_BAN_PREFIX].contains(&prefix.as_str()));
            let tag = format!("{prefix}.{group}");
            prop_assert!(Rank::parse(&tag).is_err());
        }
    }
}
