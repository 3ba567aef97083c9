//! Fine schedule: violation type to fine amount

use std::collections::HashMap;

/// Result of a fine lookup. An unknown type is a schema gap, never a zero fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FineLookup {
    Known(u32),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FineSchedule {
    amounts: HashMap<String, u32>,
}

impl Default for FineSchedule {
    fn default() -> Self {
        Self::new(default_fines())
    }
}

impl FineSchedule {
    pub fn new(amounts: HashMap<String, u32>) -> Self {
        Self { amounts }
    }

    pub fn lookup(&self, violation_type: &str) -> FineLookup {
        match self.amounts.get(violation_type) {
            Some(amount) => FineLookup::Known(*amount),
            None => FineLookup::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }
}

pub fn default_fines() -> HashMap<String, u32> {
    HashMap::from([
        ("no_stop".to_string(), 300),
        ("no_full_stop_on_right".to_string(), 75),
        ("no_right_on_red".to_string(), 125),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_amounts() {
        let fines = FineSchedule::default();
        assert_eq!(fines.lookup("no_stop"), FineLookup::Known(300));
        assert_eq!(fines.lookup("no_full_stop_on_right"), FineLookup::Known(75));
        assert_eq!(fines.lookup("no_right_on_red"), FineLookup::Known(125));
        assert_eq!(fines.len(), 3);
    }

    #[test]
    fn test_unknown_type_is_explicit() {
        let fines = FineSchedule::default();
        assert_eq!(fines.lookup("speeding"), FineLookup::Unknown);
        assert_eq!(fines.lookup(""), FineLookup::Unknown);
    }
}
