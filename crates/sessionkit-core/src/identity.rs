//! Identity keys.
//!
//! An identity key is `(mapper identity, ordered primary key values,
//! optional discriminator)`. It is unique per tracked instance inside one
//! identity map, and doubles as the merge key for external result caches.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::value::{Value, hash_value};

#[derive(Debug, Clone, Serialize)]
pub struct IdentityKey {
    mapper: &'static str,
    primary_key: Vec<Value>,
    discriminator: Option<&'static str>,
}

impl IdentityKey {
    /// Build a key. Primary key values are normalized so integer widths do
    /// not produce distinct keys.
    pub fn new(
        mapper: &'static str,
        primary_key: Vec<Value>,
        discriminator: Option<&'static str>,
    ) -> Self {
        Self {
            mapper,
            primary_key: primary_key.iter().map(Value::to_key_form).collect(),
            discriminator,
        }
    }

    pub fn mapper(&self) -> &'static str {
        self.mapper
    }

    pub fn primary_key(&self) -> &[Value] {
        &self.primary_key
    }

    pub fn discriminator(&self) -> Option<&'static str> {
        self.discriminator
    }

    /// A key with any NULL component can never identify a row.
    pub fn is_complete(&self) -> bool {
        !self.primary_key.is_empty() && self.primary_key.iter().all(|v| !v.is_null())
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.mapper == other.mapper
            && self.discriminator == other.discriminator
            && self.primary_key.len() == other.primary_key.len()
            && self
                .primary_key
                .iter()
                .zip(&other.primary_key)
                .all(|(a, b)| a.same_as(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mapper.hash(state);
        self.discriminator.hash(state);
        for v in &self.primary_key {
            hash_value(v, state);
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.mapper)?;
        for (i, v) in self.primary_key.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")?;
        if let Some(d) = self.discriminator {
            write!(f, "[{d}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_with_equal_values_collide() {
        let a = IdentityKey::new("Parent", vec![Value::Int(1)], None);
        let b = IdentityKey::new("Parent", vec![Value::BigInt(1)], None);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn mapper_and_discriminator_participate() {
        let base = IdentityKey::new("Parent", vec![Value::BigInt(1)], None);
        assert_ne!(base, IdentityKey::new("Child", vec![Value::BigInt(1)], None));
        assert_ne!(
            base,
            IdentityKey::new("Parent", vec![Value::BigInt(1)], Some("manager"))
        );
    }

    #[test]
    fn completeness_and_display() {
        let key = IdentityKey::new("Pair", vec![Value::BigInt(1), Value::from("a")], None);
        assert!(key.is_complete());
        assert_eq!(key.to_string(), "Pair(1, 'a')");
        assert!(!IdentityKey::new("Pair", vec![Value::Null], None).is_complete());
    }
}
