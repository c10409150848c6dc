use crate::{Arena, Error};
use std::cell::{Cell, RefCell};
use std::fmt::{self, Write};

/// FieldType is the immutable type tag of a Field, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Signed 64-bit integer.
    Num,
    /// Unsigned 64-bit integer.
    Unum,
    /// IEEE-754 binary64.
    Float,
    /// Text string.
    NulStr,
    /// Raw bytes.
    ByteStr,
    /// Ordered sequence of child Fields.
    List,
    /// Opaque byte cursor.
    Stream,
}

impl FieldType {
    /// Stable uppercase name, used by the diagnostic formatter.
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Num => "NUM",
            FieldType::Unum => "UNUM",
            FieldType::Float => "FLOAT",
            FieldType::NulStr => "NULSTR",
            FieldType::ByteStr => "BYTESTR",
            FieldType::List => "LIST",
            FieldType::Stream => "STREAM",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A list of Fields resident in the transaction arena. The interior
/// mutability lets collection managers and capture operations grow a list
/// that other holders are already pointing at.
pub type FieldList<'a> = RefCell<bumpalo::collections::Vec<'a, Field<'a>>>;

/// Allocate an empty FieldList in the arena.
pub fn new_list<'a>(arena: &'a Arena) -> &'a FieldList<'a> {
    arena.alloc(RefCell::new(bumpalo::collections::Vec::new_in(arena)))
}

/// Stream is an opaque read cursor over arena-resident bytes.
#[derive(Debug)]
pub struct Stream<'a> {
    bytes: &'a [u8],
    pos: Cell<usize>,
}

impl<'a> Stream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: Cell::new(0),
        }
    }

    /// Read up to `n` bytes, advancing the cursor.
    pub fn read(&self, n: usize) -> &'a [u8] {
        let at = self.pos.get();
        let end = std::cmp::min(at + n, self.bytes.len());
        self.pos.set(end);
        &self.bytes[at..end]
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos.get()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Value is a typed transaction value. Payloads are either immediates or
/// thin references into the owning arena, so Value is Copy and reads are
/// handle-cheap regardless of the underlying storage discipline.
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    Num(i64),
    Unum(u64),
    Float(f64),
    NulStr(&'a str),
    Bytes(&'a [u8]),
    List(&'a FieldList<'a>),
    Stream(&'a Stream<'a>),
}

impl<'a> Value<'a> {
    pub fn ty(&self) -> FieldType {
        match self {
            Value::Num(_) => FieldType::Num,
            Value::Unum(_) => FieldType::Unum,
            Value::Float(_) => FieldType::Float,
            Value::NulStr(_) => FieldType::NulStr,
            Value::Bytes(_) => FieldType::ByteStr,
            Value::List(_) => FieldType::List,
            Value::Stream(_) => FieldType::Stream,
        }
    }
}

/// Getter callback of a dynamic field. Invoked on every read until the field
/// is made static. The optional argument is the `:qualifier` of an expansion
/// reference, when one was given.
pub type Getter<'a> = Box<dyn Fn(&Field<'a>, Option<&str>) -> Result<Value<'a>, Error> + 'a>;

/// Setter callback of a dynamic field.
pub type Setter<'a> = Box<dyn Fn(&Field<'a>, Option<&str>, Value<'a>) -> Result<(), Error> + 'a>;

// Storage is the field's discipline: a value owned by the field, a typed
// slot into caller-owned storage, or getter/setter callbacks. The only legal
// discipline transition is Dynamic → Static, via make_static.
enum Storage<'a> {
    Static(Value<'a>),
    Alias(&'a RefCell<Value<'a>>),
    Dynamic {
        get: Getter<'a>,
        set: Option<Setter<'a>>,
    },
}

impl fmt::Debug for Storage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Storage::Alias(v) => f.debug_tuple("Alias").field(v).finish(),
            Storage::Dynamic { set, .. } => f
                .debug_struct("Dynamic")
                .field("set", &set.is_some())
                .finish(),
        }
    }
}

/// Field is a named, typed value cell. The name and type are fixed at
/// creation; the storage discipline determines where reads and writes land.
#[derive(Debug)]
pub struct Field<'a> {
    name: &'a str,
    ty: FieldType,
    storage: Storage<'a>,
}

impl<'a> Field<'a> {
    /// Build a static field over a value already resident in the arena.
    /// The name is copied in; the value is owned by the field.
    pub fn new(name: &str, value: Value<'a>, arena: &'a Arena) -> Field<'a> {
        Field {
            name: arena.alloc_str(name),
            ty: value.ty(),
            storage: Storage::Static(value),
        }
    }

    pub fn num(name: &str, v: i64, arena: &'a Arena) -> Field<'a> {
        Self::new(name, Value::Num(v), arena)
    }

    pub fn unum(name: &str, v: u64, arena: &'a Arena) -> Field<'a> {
        Self::new(name, Value::Unum(v), arena)
    }

    pub fn float(name: &str, v: f64, arena: &'a Arena) -> Field<'a> {
        Self::new(name, Value::Float(v), arena)
    }

    /// Static text field; the string is copied into the arena.
    pub fn nulstr(name: &str, v: &str, arena: &'a Arena) -> Field<'a> {
        Self::new(name, Value::NulStr(arena.alloc_str(v)), arena)
    }

    /// Static byte field; the bytes are copied into the arena.
    pub fn bytes(name: &str, v: &[u8], arena: &'a Arena) -> Field<'a> {
        Self::new(name, Value::Bytes(arena.alloc_slice_copy(v)), arena)
    }

    /// Static field holding a new, empty list.
    pub fn list(name: &str, arena: &'a Arena) -> Field<'a> {
        Self::new(name, Value::List(new_list(arena)), arena)
    }

    /// Static field holding a stream cursor over a copy of `bytes`.
    pub fn stream(name: &str, bytes: &[u8], arena: &'a Arena) -> Field<'a> {
        let cursor = arena.alloc(Stream::new(arena.alloc_slice_copy(bytes)));
        Self::new(name, Value::Stream(cursor), arena)
    }

    /// Parse `value` into the most specific type it admits: Num when it
    /// parses as a signed integer, Float when it parses as binary64,
    /// otherwise NulStr.
    pub fn from_string(name: &str, value: &str, arena: &'a Arena) -> Field<'a> {
        if let Ok(n) = value.parse::<i64>() {
            return Self::num(name, n, arena);
        }
        if let Ok(f) = value.parse::<f64>() {
            return Self::float(name, f, arena);
        }
        Self::nulstr(name, value, arena)
    }

    /// Build an alias field over a typed slot owned by the caller. Reads
    /// return the slot's current value; writes go through the slot, so both
    /// sides observe each other's mutations. The field's type is the type of
    /// the value currently in the slot.
    pub fn alias(name: &str, slot: &'a RefCell<Value<'a>>, arena: &'a Arena) -> Field<'a> {
        let ty = slot.borrow().ty();
        Field {
            name: arena.alloc_str(name),
            ty,
            storage: Storage::Alias(slot),
        }
    }

    /// Byte-string alias over an external buffer. Returns the field and the
    /// slot it aliases, so the caller can keep mutating the storage.
    pub fn bytes_alias(
        name: &str,
        buf: &'a [u8],
        arena: &'a Arena,
    ) -> (Field<'a>, &'a RefCell<Value<'a>>) {
        let slot: &'a RefCell<Value<'a>> = arena.alloc(RefCell::new(Value::Bytes(buf)));
        (Self::alias(name, slot, arena), slot)
    }

    /// Build a dynamic field. The getter runs on every read until
    /// make_static collapses the field; the setter is optional.
    pub fn dynamic(
        name: &str,
        ty: FieldType,
        get: Getter<'a>,
        set: Option<Setter<'a>>,
        arena: &'a Arena,
    ) -> Field<'a> {
        Field {
            name: arena.alloc_str(name),
            ty,
            storage: Storage::Dynamic { get, set },
        }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn ty(&self) -> FieldType {
        self.ty
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.storage, Storage::Dynamic { .. })
    }

    /// Read the field's current value.
    pub fn value(&self) -> Result<Value<'a>, Error> {
        self.value_ex(None)
    }

    /// Read with an argument, which is handed to a dynamic getter. Static
    /// and alias fields ignore the argument.
    pub fn value_ex(&self, arg: Option<&str>) -> Result<Value<'a>, Error> {
        match &self.storage {
            Storage::Static(v) => Ok(*v),
            Storage::Alias(slot) => Ok(*slot.borrow()),
            Storage::Dynamic { get, .. } => get(self, arg),
        }
    }

    /// Write a new value. The value's type must match the field's type.
    pub fn setv(&mut self, value: Value<'a>) -> Result<(), Error> {
        if value.ty() != self.ty {
            return Err(Error::TypeMismatch {
                expected: self.ty,
                actual: value.ty(),
            });
        }
        match &self.storage {
            Storage::Dynamic { set: Some(set), .. } => return set(self, None, value),
            Storage::Dynamic { set: None, .. } => {
                return Err(Error::Invalid(format!(
                    "dynamic field {:?} has no setter",
                    self.name
                )))
            }
            _ => (),
        }
        match &mut self.storage {
            Storage::Static(v) => *v = value,
            Storage::Alias(slot) => *slot.borrow_mut() = value,
            Storage::Dynamic { .. } => unreachable!("handled above"),
        }
        Ok(())
    }

    /// Collapse a dynamic field to static: invoke the getter one final time
    /// and own the produced value. Subsequent reads are O(1) and the getter
    /// is never called again. Fails on non-dynamic fields.
    pub fn make_static(&mut self) -> Result<(), Error> {
        let value = match &self.storage {
            Storage::Dynamic { get, .. } => get(self, None)?,
            _ => {
                return Err(Error::Invalid(format!(
                    "field {:?} is not dynamic",
                    self.name
                )))
            }
        };
        self.storage = Storage::Static(value);
        Ok(())
    }

    /// Deep-copy this field into another arena as a static field. A dynamic
    /// field contributes the value its getter currently produces.
    pub fn copy_into<'b>(&self, arena: &'b Arena) -> Result<Field<'b>, Error> {
        let value = copy_value(&self.value()?, arena)?;
        Ok(Field {
            name: arena.alloc_str(self.name),
            ty: self.ty,
            storage: Storage::Static(value),
        })
    }

    /// Render the field for diagnostics, returning the printed string and
    /// the field's type name. With `quote`, the output is wrapped in ASCII
    /// double-quotes and embedded quotes are escaped. With `escape_ctrl`,
    /// C0 control bytes and 0x7f are escaped as \f \t \n \r or \uXXXX.
    pub fn format(&self, quote: bool, escape_ctrl: bool) -> (String, &'static str) {
        let raw = match self.value() {
            Ok(v) => render_plain(&v),
            Err(_) => String::new(),
        };
        let mut out = String::with_capacity(raw.len() + 2);
        if quote {
            out.push('"');
        }
        for c in raw.chars() {
            match c {
                '"' if quote => out.push_str("\\\""),
                '\x0c' if escape_ctrl => out.push_str("\\f"),
                '\t' if escape_ctrl => out.push_str("\\t"),
                '\n' if escape_ctrl => out.push_str("\\n"),
                '\r' if escape_ctrl => out.push_str("\\r"),
                c if escape_ctrl && (c < '\x20' || c == '\x7f') => {
                    // write! to a String cannot fail.
                    let _ = write!(out, "\\u{:04x}", c as u32);
                }
                c => out.push(c),
            }
        }
        if quote {
            out.push('"');
        }
        (out, self.ty.name())
    }
}

// Plain (unescaped) rendering shared by the formatter. Numeric types use
// their canonical decimal form; Float relies on Rust's shortest round-trip
// formatting. The list form is diagnostic only.
fn render_plain(v: &Value<'_>) -> String {
    match v {
        Value::Num(n) => n.to_string(),
        Value::Unum(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::NulStr(s) => (*s).to_string(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::List(l) => {
            let mut out = String::from("[");
            for (i, f) in l.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Ok(v) = f.value() {
                    out.push_str(&render_plain(&v));
                }
            }
            out.push(']');
            out
        }
        Value::Stream(_) => "<stream>".to_string(),
    }
}

fn copy_value<'b>(v: &Value<'_>, arena: &'b Arena) -> Result<Value<'b>, Error> {
    Ok(match v {
        Value::Num(n) => Value::Num(*n),
        Value::Unum(n) => Value::Unum(*n),
        Value::Float(f) => Value::Float(*f),
        Value::NulStr(s) => Value::NulStr(arena.alloc_str(s)),
        Value::Bytes(b) => Value::Bytes(arena.alloc_slice_copy(b)),
        Value::List(l) => {
            let copy = new_list(arena);
            {
                let mut dst = copy.borrow_mut();
                for f in l.borrow().iter() {
                    dst.push(f.copy_into(arena)?);
                }
            }
            Value::List(copy)
        }
        Value::Stream(s) => {
            let cursor = arena.alloc(Stream::new(arena.alloc_slice_copy(s.as_bytes())));
            Value::Stream(cursor)
        }
    })
}
