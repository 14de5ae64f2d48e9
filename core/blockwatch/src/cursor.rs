use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Blocking index threaded from one response to the next request.
///
/// The backend holds a request carrying a cursor until it has something newer than that cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Validates the cursor returned by the backend, given the cursor we sent.
    ///
    /// - A cursor lower than the previous one means that the server state went back
    ///   (e.g. snapshot restore): start over from the beginning.
    /// - A cursor of 0 never blocks and would turn the loop into a busy loop: use 1 instead.
    pub fn validate(current: u64, previous: Option<Cursor>) -> Cursor {
        let current = match previous {
            Some(Cursor(prev)) if current < prev => 0,
            _ => current,
        };
        Cursor(current.max(1))
    }

    /// Parses a raw cursor, as found in response headers.
    pub fn parse(raw: &str) -> Option<Cursor> {
        raw.trim().parse().ok().map(Cursor)
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Cursor;

    #[test]
    fn validate() {
        assert_eq!(Cursor::validate(42, None), Cursor(42));
        assert_eq!(Cursor::validate(42, Some(Cursor(10))), Cursor(42));
        assert_eq!(Cursor::validate(42, Some(Cursor(42))), Cursor(42));
        // went backwards
        assert_eq!(Cursor::validate(5, Some(Cursor(42))), Cursor(1));
        // zero never blocks
        assert_eq!(Cursor::validate(0, None), Cursor(1));
    }

    #[test]
    fn parse() {
        assert_eq!(Cursor::parse("42"), Some(Cursor(42)));
        assert_eq!(Cursor::parse(" 7 "), Some(Cursor(7)));
        assert_eq!(Cursor::parse("-1"), None);
        assert_eq!(Cursor::parse("abc"), None);
    }
}
