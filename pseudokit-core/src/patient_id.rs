use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PseudokitError;

/// A permanent patient identifier.
///
/// An identifier consists of a value and the identifier type (the domain or
/// namespace the value is valid in). One patient may carry identifiers of
/// several types. Identifiers are immutable value objects used as cache
/// keys, so equality and hashing are stable for the lifetime of a value.
///
/// On the wire an identifier is `{"idType": ..., "idString": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientId {
    id_type: String,
    id_string: String,
}

impl PatientId {
    /// Creates a patient identifier of the given type.
    ///
    /// The type must match an identifier type configured on the connected
    /// service instance.
    ///
    /// # Errors
    /// Returns [`PseudokitError::InvalidArgument`] if either component is
    /// empty.
    pub fn new(
        id_type: impl Into<String>,
        id_string: impl Into<String>,
    ) -> Result<Self, PseudokitError> {
        let id_type = id_type.into();
        let id_string = id_string.into();
        if id_type.is_empty() {
            return Err(PseudokitError::InvalidArgument {
                attribute: "id_type".to_string(),
                reason: "identifier type must not be empty".to_string(),
            });
        }
        if id_string.is_empty() {
            return Err(PseudokitError::InvalidArgument {
                attribute: "id_string".to_string(),
                reason: "identifier value must not be empty".to_string(),
            });
        }
        Ok(Self { id_type, id_string })
    }

    /// The identifier type (domain or namespace) of this identifier.
    #[must_use]
    pub fn id_type(&self) -> &str {
        &self.id_type
    }

    /// The identifier value within its type.
    #[must_use]
    pub fn id_string(&self) -> &str {
        &self.id_string
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id_type, self.id_string)
    }
}
