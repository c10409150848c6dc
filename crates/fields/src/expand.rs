use crate::{Arena, Error, FieldMap, Value};

// Expansion scans left to right. A literal `%` not followed by `{`, and an
// unterminated `%{`, are copied verbatim. A reference to an unbound name
// emits nothing; absence is not an error.
pub(crate) fn expand<'a>(
    map: &FieldMap<'a>,
    template: &str,
    arena: &'a Arena,
) -> Result<&'a [u8], Error> {
    let bytes = template.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut at = 0;

    while at < bytes.len() {
        if bytes[at] == b'%' && bytes.get(at + 1) == Some(&b'{') {
            if let Some(close) = bytes[at + 2..].iter().position(|&b| b == b'}') {
                // A name that isn't UTF-8 cannot be bound, so the reference
                // expands to nothing, as any other unbound name does.
                if let Ok(name) = std::str::from_utf8(&bytes[at + 2..at + 2 + close]) {
                    render_reference(map, name, &mut out)?;
                }
                at += close + 3;
                continue;
            }
        }
        out.push(bytes[at]);
        at += 1;
    }

    Ok(arena.alloc_slice_copy(&out))
}

/// True iff `template` contains at least one well-formed `%{…}` reference.
/// Action creation uses this to decide whether an instance must re-expand
/// its parameter on every execution or may cache the literal.
pub fn expand_test(template: &str) -> bool {
    let bytes = template.as_bytes();
    let mut at = 0;
    while at + 1 < bytes.len() {
        if bytes[at] == b'%'
            && bytes[at + 1] == b'{'
            && bytes[at + 2..].iter().any(|&b| b == b'}')
        {
            return true;
        }
        at += 1;
    }
    false
}

// A reference names a field, optionally qualified as `name:sub`. The
// qualifier selects a sub-field of a list, or is handed as the argument to a
// dynamic getter. A qualifier against a scalar selects nothing.
fn render_reference(map: &FieldMap<'_>, name: &str, out: &mut Vec<u8>) -> Result<(), Error> {
    let (base, qualifier) = match name.split_once(':') {
        Some((base, q)) => (base, Some(q)),
        None => (name, None),
    };
    let Some(field) = map.get(base) else {
        return Ok(());
    };

    if field.is_dynamic() {
        render_value(&field.value_ex(qualifier)?, out);
        return Ok(());
    }

    match (field.value()?, qualifier) {
        (Value::List(l), Some(q)) => {
            let l = l.borrow();
            if let Some(sub) = l.iter().find(|f| f.name().eq_ignore_ascii_case(q)) {
                render_value(&sub.value()?, out);
            }
        }
        (_, Some(_)) => (),
        (v, None) => render_value(&v, out),
    }
    Ok(())
}

fn render_value(v: &Value<'_>, out: &mut Vec<u8>) {
    match v {
        Value::Num(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::Unum(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::Float(f) => out.extend_from_slice(f.to_string().as_bytes()),
        Value::NulStr(s) => out.extend_from_slice(s.as_bytes()),
        Value::Bytes(b) => out.extend_from_slice(b),
        // The bare-list form is diagnostic only; rule authors should always
        // qualify a list reference.
        Value::List(l) => {
            out.push(b'[');
            for (i, f) in l.borrow().iter().enumerate() {
                if i > 0 {
                    out.extend_from_slice(b", ");
                }
                if let Ok(v) = f.value() {
                    render_value(&v, out);
                }
            }
            out.push(b']');
        }
        Value::Stream(_) => out.extend_from_slice(b"<stream>"),
    }
}
