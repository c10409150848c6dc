use crate::{expand, Arena, Error, Field, FieldList, Value};

/// FieldMap is the ordered name → Field mapping scoped to one transaction.
/// Names are compared ASCII-case-insensitively and keep their original case.
/// A name maps to at most one field; removal then re-insertion is the only
/// way to replace a binding.
#[derive(Debug, Default)]
pub struct FieldMap<'a> {
    fields: Vec<Field<'a>>,
}

impl<'a> FieldMap<'a> {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append a field. Duplicate names are rejected.
    pub fn add(&mut self, field: Field<'a>) -> Result<(), Error> {
        if self.get(field.name()).is_some() {
            return Err(Error::Exists(field.name().to_string()));
        }
        self.fields.push(field);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Field<'a>> {
        self.fields
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Field<'a>> {
        self.fields
            .iter_mut()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    /// Remove and return the named field, if bound.
    pub fn remove(&mut self, name: &str) -> Option<Field<'a>> {
        let at = self
            .fields
            .iter()
            .position(|f| f.name().eq_ignore_ascii_case(name))?;
        Some(self.fields.remove(at))
    }

    /// All fields, in insertion order.
    pub fn get_all(&self) -> &[Field<'a>] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<'a>> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn add_num(&mut self, name: &str, n: i64, arena: &'a Arena) -> Result<(), Error> {
        self.add(Field::num(name, n, arena))
    }

    pub fn add_nulstr(&mut self, name: &str, s: &str, arena: &'a Arena) -> Result<(), Error> {
        self.add(Field::nulstr(name, s, arena))
    }

    /// Bind an existing list under `name`.
    pub fn add_list(
        &mut self,
        name: &str,
        list: &'a FieldList<'a>,
        arena: &'a Arena,
    ) -> Result<(), Error> {
        self.add(Field::new(name, Value::List(list), arena))
    }

    /// Append `field` to the list bound at `name`, creating the list if the
    /// name is unbound. Used for capture lists.
    pub fn add_to_list(
        &mut self,
        name: &str,
        field: Field<'a>,
        arena: &'a Arena,
    ) -> Result<(), Error> {
        let value = match self.get(name) {
            Some(f) => f.value()?,
            None => {
                let value = Value::List(crate::new_list(arena));
                self.add(Field::new(name, value, arena))?;
                value
            }
        };
        match value {
            Value::List(l) => {
                l.borrow_mut().push(field);
                Ok(())
            }
            v => Err(Error::TypeMismatch {
                expected: crate::FieldType::List,
                actual: v.ty(),
            }),
        }
    }

    /// Expand every well-formed %{name} reference in `template` against this
    /// map. The output buffer is allocated in `arena`.
    pub fn expand(&self, template: &str, arena: &'a Arena) -> Result<&'a [u8], Error> {
        expand::expand(self, template, arena)
    }
}
