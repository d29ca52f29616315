use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Identifier shared by every fragment of one application payload.
///
/// Identifiers are 16 bits wide and wrap, skipping zero.
///
/// # Examples
///
/// ```
/// use tunnelframe::fragment::MessageId;
/// let id = MessageId::new(u16::MAX);
/// assert_eq!(id.next(), MessageId::new(1));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct MessageId(u16);

impl MessageId {
    /// Create a new identifier.
    #[must_use]
    pub const fn new(value: u16) -> Self { Self(value) }

    /// Return the inner numeric identifier.
    #[must_use]
    pub const fn get(self) -> u16 { self.0 }

    /// Return the identifier that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}
