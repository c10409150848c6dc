// Transaction-scoped values are built within a bump allocator owned by the
// caller. Re-export the concrete allocator type, as most clients don't care.
pub use bumpalo::Bump as Arena;

mod field;
pub use field::{new_list, Field, FieldList, FieldType, Getter, Setter, Stream, Value};

// FieldMap is the per-transaction ordered name → Field mapping.
mod map;
pub use map::FieldMap;

// Templates containing %{name} references are expanded against a FieldMap.
mod expand;
pub use expand::expand_test;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("field {0:?} already exists")]
    Exists(String),
    #[error("field holds {actual}, expected {expected}")]
    TypeMismatch {
        expected: FieldType,
        actual: FieldType,
    },
    #[error("invalid field operation: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod test {
    use super::{Arena, Field, FieldMap, Value};

    #[test]
    fn test_map_round_trip() {
        let arena = Arena::new();
        let mut map = FieldMap::new();

        map.add(Field::num("hits", 3, &arena)).unwrap();
        map.add(Field::nulstr("user", "alice", &arena)).unwrap();

        assert!(matches!(
            map.get("HITS").unwrap().value().unwrap(),
            Value::Num(3)
        ));
        let removed = map.remove("user").unwrap();
        assert_eq!(removed.name(), "user");
        assert!(map.get("user").is_none());
    }

    #[test]
    fn test_sizes() {
        // Value is a tagged word pair: every payload is either an immediate
        // or a thin arena reference.
        assert_eq!(std::mem::size_of::<Value<'static>>(), 24);
    }
}
