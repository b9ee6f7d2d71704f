//! Shared ledger types
//!
//! Addresses, public keys, coin amounts and the module permission table.
//!
//! Byte newtypes serialize as hex text in human-readable formats (genesis
//! JSON, query responses) and as raw bytes in bincode.

use crate::{Error, Result};
use chain_store::crypto::{address_hash, ADDRESS_LEN};
use rust_decimal::prelude::*;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Native token denomination
pub const NATIVE_DENOM: &str = "aphoton";

macro_rules! hex_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Parse hex text, with or without a `0x` prefix
            pub fn from_hex(s: &str) -> Result<Self> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)
                    .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
                let array: [u8; $len] = bytes.as_slice().try_into().map_err(|_| {
                    Error::InvalidAddress(format!(
                        "expected {} bytes, got {}",
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&hex::encode(self.0))
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_hex(&s).map_err(de::Error::custom)
                } else {
                    Ok(Self(<[u8; $len]>::deserialize(deserializer)?))
                }
            }
        }
    };
}

hex_newtype!(
    /// 20-byte account address
    Address,
    ADDRESS_LEN
);

hex_newtype!(
    /// Ed25519 public key
    PubKey,
    32
);

hex_newtype!(
    /// 32-byte hash
    H256,
    32
);

impl Address {
    /// Address owned by a public key
    pub fn from_public_key(pub_key: &PubKey) -> Self {
        Self(address_hash(&pub_key.0))
    }

    /// Module account address, derived from the module name
    pub fn for_module(name: &str) -> Self {
        Self(address_hash(name.as_bytes()))
    }
}

/// Token amounts as decimal strings in text formats, `u128` in bincode
pub mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serialize an amount
    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&value.to_string())
        } else {
            serializer.serialize_u128(*value)
        }
    }

    /// Deserialize an amount
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            u128::deserialize(deserializer)
        }
    }
}

/// Check a denomination: lowercase letter first, then 2..=127 of `[a-z0-9/]`
pub fn validate_denom(denom: &str) -> Result<()> {
    let mut chars = denom.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && (3..=128).contains(&denom.len())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '/');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCoins(format!("invalid denom: {}", denom)))
    }
}

fn split_amount(s: &str) -> Result<(&str, &str)> {
    let idx = s
        .find(|c: char| c.is_ascii_lowercase())
        .ok_or_else(|| Error::InvalidCoins(format!("missing denom: {}", s)))?;
    Ok((&s[..idx], &s[idx..]))
}

/// Amount of a single denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Denomination
    pub denom: String,
    /// Amount
    #[serde(with = "amount")]
    pub amount: u128,
}

impl Coin {
    /// Create coin
    pub fn new(amount: u128, denom: impl Into<String>) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

impl FromStr for Coin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (amount, denom) = split_amount(s.trim())?;
        let amount = amount
            .parse()
            .map_err(|e| Error::InvalidCoins(format!("{}: {}", s, e)))?;
        validate_denom(denom)?;
        Ok(Coin::new(amount, denom))
    }
}

/// Sorted set of non-zero coins, one entry per denomination
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coins(Vec<Coin>);

impl Coins {
    /// Build from arbitrary coins; sorts, rejects duplicates, drops zeros
    pub fn new(mut coins: Vec<Coin>) -> Result<Self> {
        coins.retain(|c| c.amount > 0);
        coins.sort_by(|a, b| a.denom.cmp(&b.denom));
        let coins = Coins(coins);
        coins.validate()?;
        Ok(coins)
    }

    /// No coins
    pub fn empty() -> Self {
        Self::default()
    }

    /// One denomination (empty when `amount` is zero)
    pub fn single(denom: impl Into<String>, amount: u128) -> Self {
        if amount == 0 {
            Self::empty()
        } else {
            Coins(vec![Coin::new(amount, denom)])
        }
    }

    /// Check ordering, uniqueness, denominations and non-zero amounts
    pub fn validate(&self) -> Result<()> {
        for coin in &self.0 {
            validate_denom(&coin.denom)?;
            if coin.amount == 0 {
                return Err(Error::InvalidCoins(format!("zero amount: {}", coin)));
            }
        }
        for pair in self.0.windows(2) {
            if pair[0].denom >= pair[1].denom {
                return Err(Error::InvalidCoins(format!(
                    "coins not sorted or duplicated: {}",
                    self
                )));
            }
        }
        Ok(())
    }

    /// True when no denomination is held
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of denominations
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate in denomination order
    pub fn iter(&self) -> impl Iterator<Item = &Coin> {
        self.0.iter()
    }

    /// Amount held of `denom`
    pub fn amount_of(&self, denom: &str) -> u128 {
        self.0
            .iter()
            .find(|c| c.denom == denom)
            .map(|c| c.amount)
            .unwrap_or(0)
    }

    /// Sum, failing on overflow
    pub fn checked_add(&self, other: &Coins) -> Result<Coins> {
        let mut sum: BTreeMap<&str, u128> = BTreeMap::new();
        for coin in self.0.iter().chain(other.0.iter()) {
            let entry = sum.entry(coin.denom.as_str()).or_insert(0);
            *entry = entry
                .checked_add(coin.amount)
                .ok_or_else(|| Error::InvalidCoins(format!("overflow adding {}", coin)))?;
        }
        Ok(Coins(
            sum.into_iter()
                .filter(|(_, amount)| *amount > 0)
                .map(|(denom, amount)| Coin::new(amount, denom))
                .collect(),
        ))
    }

    /// Difference, `None` if any denomination would go negative
    pub fn checked_sub(&self, other: &Coins) -> Option<Coins> {
        let mut result: BTreeMap<&str, u128> =
            self.0.iter().map(|c| (c.denom.as_str(), c.amount)).collect();
        for coin in &other.0 {
            let held = result.entry(coin.denom.as_str()).or_insert(0);
            *held = held.checked_sub(coin.amount)?;
        }
        Some(Coins(
            result
                .into_iter()
                .filter(|(_, amount)| *amount > 0)
                .map(|(denom, amount)| Coin::new(amount, denom))
                .collect(),
        ))
    }

    /// True if every denomination of `other` is covered
    pub fn is_all_gte(&self, other: &Coins) -> bool {
        other.iter().all(|c| self.amount_of(&c.denom) >= c.amount)
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for Coins {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Coins::empty());
        }
        let coins = s.split(',').map(Coin::from_str).collect::<Result<Vec<_>>>()?;
        Coins::new(coins)
    }
}

impl IntoIterator for Coins {
    type Item = Coin;
    type IntoIter = std::vec::IntoIter<Coin>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Convert a token amount to a decimal
pub fn dec_from_amount(amount: u128) -> Result<Decimal> {
    Decimal::from_u128(amount)
        .ok_or_else(|| Error::InvalidCoins(format!("amount {} exceeds decimal range", amount)))
}

/// Decimal coin amounts (rewards, prices), zero entries omitted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecCoins(BTreeMap<String, Decimal>);

impl DecCoins {
    /// No coins
    pub fn empty() -> Self {
        Self::default()
    }

    /// Exact conversion of integer coins
    pub fn from_coins(coins: &Coins) -> Result<Self> {
        let mut dec = DecCoins::empty();
        for coin in coins.iter() {
            dec.0.insert(coin.denom.clone(), dec_from_amount(coin.amount)?);
        }
        Ok(dec)
    }

    /// True when every amount is zero
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Amount of `denom`
    pub fn amount_of(&self, denom: &str) -> Decimal {
        self.0.get(denom).copied().unwrap_or(Decimal::ZERO)
    }

    /// Iterate in denomination order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Decimal)> {
        self.0.iter()
    }

    /// Sum
    pub fn checked_add(&self, other: &DecCoins) -> Result<DecCoins> {
        let mut sum = self.0.clone();
        for (denom, amount) in &other.0 {
            let entry = sum.entry(denom.clone()).or_insert(Decimal::ZERO);
            *entry = entry
                .checked_add(*amount)
                .ok_or_else(|| Error::InvalidCoins(format!("overflow adding {}", denom)))?;
        }
        Ok(Self::normalized(sum))
    }

    /// Difference, `None` if any denomination would go negative
    pub fn checked_sub(&self, other: &DecCoins) -> Option<DecCoins> {
        let mut result = self.0.clone();
        for (denom, amount) in &other.0 {
            let entry = result.entry(denom.clone()).or_insert(Decimal::ZERO);
            let diff = entry.checked_sub(*amount)?;
            if diff.is_sign_negative() && !diff.is_zero() {
                return None;
            }
            *entry = diff;
        }
        Some(Self::normalized(result))
    }

    /// Multiply every amount
    pub fn mul_dec(&self, factor: Decimal) -> Result<DecCoins> {
        let mut result = BTreeMap::new();
        for (denom, amount) in &self.0 {
            let product = amount
                .checked_mul(factor)
                .ok_or_else(|| Error::InvalidCoins(format!("overflow scaling {}", denom)))?;
            result.insert(denom.clone(), product);
        }
        Ok(Self::normalized(result))
    }

    /// Divide every amount
    pub fn quo_dec(&self, divisor: Decimal) -> Result<DecCoins> {
        if divisor.is_zero() {
            return Err(Error::InvalidCoins("division by zero".to_string()));
        }
        let mut result = BTreeMap::new();
        for (denom, amount) in &self.0 {
            let quotient = amount
                .checked_div(divisor)
                .ok_or_else(|| Error::InvalidCoins(format!("overflow dividing {}", denom)))?;
            result.insert(denom.clone(), quotient);
        }
        Ok(Self::normalized(result))
    }

    /// Split into whole coins and the fractional remainder
    pub fn truncate(&self) -> (Coins, DecCoins) {
        let mut whole = Vec::new();
        let mut change = BTreeMap::new();
        for (denom, amount) in &self.0 {
            let truncated = amount.trunc();
            if let Some(value) = truncated.to_u128() {
                if value > 0 {
                    whole.push(Coin::new(value, denom.clone()));
                }
            }
            change.insert(denom.clone(), *amount - truncated);
        }
        (Coins(whole), Self::normalized(change))
    }

    /// Per-denomination minimum of both sides
    pub fn intersect(&self, other: &DecCoins) -> DecCoins {
        let map = self
            .0
            .iter()
            .map(|(denom, amount)| (denom.clone(), (*amount).min(other.amount_of(denom))))
            .collect();
        Self::normalized(map)
    }

    /// True if every denomination of `other` is covered
    pub fn is_all_gte(&self, other: &DecCoins) -> bool {
        other.iter().all(|(denom, amount)| self.amount_of(denom) >= *amount)
    }

    fn normalized(map: BTreeMap<String, Decimal>) -> Self {
        DecCoins(map.into_iter().filter(|(_, a)| !a.is_zero()).collect())
    }
}

impl fmt::Display for DecCoins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(d, a)| format!("{}{}", a, d)).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for DecCoins {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut map = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (amount, denom) = split_amount(part)?;
            validate_denom(denom)?;
            let amount = Decimal::from_str(amount)
                .map_err(|e| Error::InvalidCoins(format!("{}: {}", part, e)))?;
            if amount.is_sign_negative() {
                return Err(Error::InvalidCoins(format!("negative amount: {}", part)));
            }
            if map.insert(denom.to_string(), amount).is_some() {
                return Err(Error::InvalidCoins(format!("duplicate denom: {}", denom)));
            }
        }
        Ok(Self::normalized(map))
    }
}

/// Capability held by a module account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// May create new tokens
    Minter,
    /// May destroy tokens
    Burner,
    /// May hold delegated stake
    Staking,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Minter => f.write_str("minter"),
            Permission::Burner => f.write_str("burner"),
            Permission::Staking => f.write_str("staking"),
        }
    }
}

/// Immutable module name to capability mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionTable(BTreeMap<String, BTreeSet<Permission>>);

impl PermissionTable {
    /// Build from `(module, permissions)` pairs
    pub fn new<'a, I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, P)>,
        P: IntoIterator<Item = Permission>,
    {
        PermissionTable(
            entries
                .into_iter()
                .map(|(name, perms)| (name.to_string(), perms.into_iter().collect()))
                .collect(),
        )
    }

    /// True if `module` has a module account
    pub fn contains(&self, module: &str) -> bool {
        self.0.contains_key(module)
    }

    /// True if `module` holds `permission`
    pub fn has(&self, module: &str, permission: Permission) -> bool {
        self.0
            .get(module)
            .map(|perms| perms.contains(&permission))
            .unwrap_or(false)
    }

    /// Permissions of `module`
    pub fn permissions(&self, module: &str) -> Option<&BTreeSet<Permission>> {
        self.0.get(module)
    }

    /// Module names, sorted
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Address of every permissioned module, by module name
    pub fn module_addresses(&self) -> BTreeMap<String, Address> {
        self.0
            .keys()
            .map(|name| (name.clone(), Address::for_module(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip_json() {
        let addr = Address::for_module("fee_collector");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);

        let bytes = bincode::serialize(&addr).unwrap();
        assert_eq!(bytes.len(), ADDRESS_LEN);
    }

    #[test]
    fn test_address_from_hex_rejects_short() {
        assert!(Address::from_hex("abcd").is_err());
        assert!(Address::from_hex("zz").is_err());
        let addr = Address::for_module("mint");
        assert_eq!(Address::from_hex(&format!("0x{}", addr)).unwrap(), addr);
    }

    #[test]
    fn test_module_addresses_distinct() {
        let names = ["fee_collector", "distribution", "mint", "bonded_tokens_pool"];
        let addrs: BTreeSet<Address> = names.iter().map(|n| Address::for_module(n)).collect();
        assert_eq!(addrs.len(), names.len());
    }

    #[test]
    fn test_coins_parse_and_arithmetic() {
        let a: Coins = "100aphoton,5stake".parse().unwrap();
        let b: Coins = "40aphoton".parse().unwrap();

        assert_eq!(a.amount_of("aphoton"), 100);
        assert_eq!(a.checked_add(&b).unwrap().amount_of("aphoton"), 140);
        assert_eq!(a.checked_sub(&b).unwrap().to_string(), "60aphoton,5stake");
        assert!(b.checked_sub(&a).is_none());
        assert!(a.is_all_gte(&b));
        assert!(!b.is_all_gte(&a));

        // exact subtraction drops the denomination
        assert!(b.checked_sub(&b).unwrap().is_empty());
    }

    #[test]
    fn test_coins_validation() {
        assert!("1aphoton,1aphoton".parse::<Coins>().is_err());
        assert!("10A".parse::<Coins>().is_err());
        assert!(Coins::new(vec![Coin::new(0, "aphoton")]).unwrap().is_empty());

        let unsorted: Coins = serde_json::from_str(
            r#"[{"denom":"stake","amount":"1"},{"denom":"aphoton","amount":"1"}]"#,
        )
        .unwrap();
        assert!(unsorted.validate().is_err());
    }

    #[test]
    fn test_coin_json_amount_is_string() {
        let coin = Coin::new(u128::MAX, NATIVE_DENOM);
        let json = serde_json::to_value(&coin).unwrap();
        assert_eq!(json["amount"], u128::MAX.to_string());
        let back: Coin = serde_json::from_value(json).unwrap();
        assert_eq!(back, coin);
    }

    #[test]
    fn test_dec_coins_truncate() {
        let dec: DecCoins = "10.75aphoton,0.5stake".parse().unwrap();
        let (whole, change) = dec.truncate();
        assert_eq!(whole.to_string(), "10aphoton");
        assert_eq!(change.amount_of("aphoton"), Decimal::new(75, 2));
        assert_eq!(change.amount_of("stake"), Decimal::new(5, 1));
    }

    #[test]
    fn test_dec_coins_sub_negative() {
        let a: DecCoins = "1aphoton".parse().unwrap();
        let b: DecCoins = "2aphoton".parse().unwrap();
        assert!(a.checked_sub(&b).is_none());
        assert!(b.checked_sub(&a).unwrap().amount_of("aphoton") == Decimal::ONE);
    }

    #[test]
    fn test_permission_table() {
        let table = PermissionTable::new([
            ("fee_collector", vec![]),
            ("mint", vec![Permission::Minter]),
        ]);
        assert!(table.contains("fee_collector"));
        assert!(table.has("mint", Permission::Minter));
        assert!(!table.has("mint", Permission::Burner));
        assert!(!table.has("unknown", Permission::Minter));
        assert_eq!(table.module_addresses().len(), 2);
    }
}
