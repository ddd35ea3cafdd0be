use std::collections::BTreeMap;

/// A scalar field value. The mapper on the far side of this boundary only
/// deals in numbers, strings and enum bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    Int(i64),
    Str(String),
    Byte(u8),
}

/// One persisted entity as a flat bag of named scalars. The world core
/// fills and reads these; storage, schemas and dirty tracking live
/// elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, RecordValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.fields.insert(key.to_owned(), RecordValue::Int(value));
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.fields
            .insert(key.to_owned(), RecordValue::Str(value.to_owned()));
    }

    pub fn set_byte(&mut self, key: &str, value: u8) {
        self.fields.insert(key.to_owned(), RecordValue::Byte(value));
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            RecordValue::Int(v) => Some(*v),
            RecordValue::Byte(v) => Some(i64::from(*v)),
            RecordValue::Str(_) => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key)? {
            RecordValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn byte(&self, key: &str) -> Option<u8> {
        match self.fields.get(key)? {
            RecordValue::Byte(v) => Some(*v),
            RecordValue::Int(v) => u8::try_from(*v).ok(),
            RecordValue::Str(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_respect_kinds() {
        let mut record = Record::new();
        record.set_int("x", 530_000);
        record.set_str("name", "graystone golem");
        record.set_byte("realm", 2);

        assert_eq!(record.int("x"), Some(530_000));
        assert_eq!(record.str("name"), Some("graystone golem"));
        assert_eq!(record.byte("realm"), Some(2));

        // Bytes widen to ints, small ints narrow to bytes.
        assert_eq!(record.int("realm"), Some(2));
        record.set_int("flags", 8);
        assert_eq!(record.byte("flags"), Some(8));

        assert_eq!(record.int("name"), None);
        assert_eq!(record.str("x"), None);
        assert_eq!(record.int("missing"), None);
    }

    #[test]
    fn out_of_range_int_is_not_a_byte() {
        let mut record = Record::new();
        record.set_int("big", 300);
        assert_eq!(record.byte("big"), None);
    }
}
