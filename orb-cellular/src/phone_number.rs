use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// A phone number as the user (or the modem) entered it, together with a
/// normalized form used for comparisons.
///
/// Normalization keeps a leading `+`, digits, `*` and `#` and drops separators
/// such as spaces, dashes and parentheses.
#[derive(Debug, Clone, Default)]
pub struct PhoneNumber {
    entered: String,
    normalized: String,
}

impl PhoneNumber {
    pub fn parse(entered: &str) -> Self {
        let entered = entered.trim();
        let mut normalized = String::with_capacity(entered.len());
        for (i, c) in entered.chars().enumerate() {
            match c {
                '+' if i == 0 => normalized.push(c),
                '0'..='9' | '*' | '#' => normalized.push(c),
                _ => {}
            }
        }

        Self {
            entered: entered.to_string(),
            normalized,
        }
    }

    pub fn entered(&self) -> &str {
        &self.entered
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }
}

impl PartialEq for PhoneNumber {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for PhoneNumber {}

impl Hash for PhoneNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}
