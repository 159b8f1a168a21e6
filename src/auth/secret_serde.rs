//! Serde helpers for `Secret<String>` fields

/// Custom serde module for Secret<String>
pub(crate) mod secret_string {
    use secrecy::{ExposeSecret, Secret};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Secret<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Secret::new(s))
    }
}

/// Custom serde module for Option<Secret<String>>
pub(crate) mod option_secret_string {
    use secrecy::{ExposeSecret, Secret};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &Option<Secret<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match secret {
            Some(ref s) => serializer.serialize_some(s.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt_s = Option::<String>::deserialize(deserializer)?;
        Ok(opt_s.map(Secret::new))
    }
}
