use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps customer and seller data (emails, bank account numbers) so that it
/// never shows up in `Debug` or `Display` output, e.g. `tracing::info!("{:?}", account)`.
///
/// Serialization still writes the real value: persisted aggregates and API
/// responses need it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl Masked<String> {
    /// Last four characters, for log lines that need to tell accounts apart.
    pub fn tail(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(4);
        format!("****{}", chars[start..].iter().collect::<String>())
    }
}

impl From<String> for Masked<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Masked<String> {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_masked() {
        let account = Masked::from("0123456789");
        assert_eq!(format!("{:?}", account), "********");
        assert_eq!(format!("{}", account), "********");
        assert_eq!(account.tail(), "****6789");
    }

    #[test]
    fn test_serializes_real_value() {
        let email = Masked::from("buyer@example.com");
        let json = serde_json::to_string(&email).unwrap();
        assert_eq!(json, "\"buyer@example.com\"");

        let back: Masked<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expose(), "buyer@example.com");
    }
}
