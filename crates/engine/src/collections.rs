use crate::{Error, Outcome};
use fields::{Arena, Field, FieldList, Value};
use kvstore::{Filesystem, Newest, Store};
use url::Url;

/// CollectionManager is a pluggable handler for a URI scheme. At
/// configuration time, a collection declared with a matching URI is offered
/// to the manager; the first manager that does not decline owns it.
pub trait CollectionManager: Send + Sync {
    fn name(&self) -> &str;

    fn scheme(&self) -> &str;

    /// Claim a collection. `None` declines, letting the next manager with
    /// the same scheme try. Errors abort configuration.
    fn register(
        &self,
        collection: &str,
        uri: &Url,
        params: &[String],
    ) -> Result<Option<Box<dyn ManagedCollection>>, Error>;

    /// Called once at engine shutdown, for managers holding external
    /// resources. Failures are logged, not fatal.
    fn unregister(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// ManagedCollection is one claimed collection: its populate hook runs at
/// transaction creation, its persist hook at transaction close.
pub trait ManagedCollection: Send + Sync {
    /// Seed the collection. Declining leaves it empty.
    fn populate<'a>(&self, arena: &'a Arena, collection: &'a FieldList<'a>)
        -> Result<Outcome, Error>;

    /// Persist the collection's final state. Declining skips persistence.
    fn persist(&self, collection: &FieldList<'_>) -> Result<Outcome, Error>;
}

/// Deep-copy every field of `source` into `collection` using the
/// transaction arena.
pub fn populate_from_list<'a>(
    arena: &'a Arena,
    source: &FieldList<'_>,
    collection: &FieldList<'a>,
) -> Result<(), Error> {
    let mut dst = collection.borrow_mut();
    for field in source.borrow().iter() {
        dst.push(field.copy_into(arena)?);
    }
    Ok(())
}

/// Vars populates a collection with constant fields parsed from its
/// registration parameters; it never persists anything.
#[derive(Debug, Default)]
pub struct Vars;

impl CollectionManager for Vars {
    fn name(&self) -> &str {
        "vars"
    }

    fn scheme(&self) -> &str {
        "vars"
    }

    fn register(
        &self,
        collection: &str,
        _uri: &Url,
        params: &[String],
    ) -> Result<Option<Box<dyn ManagedCollection>>, Error> {
        let mut vars = Vec::with_capacity(params.len());
        for param in params {
            let Some((name, value)) = param.split_once('=') else {
                return Err(Error::Invalid(format!(
                    "vars collection {collection:?}: parameter {param:?} is not name=value"
                )));
            };
            vars.push((name.to_string(), value.to_string()));
        }
        Ok(Some(Box::new(VarsCollection { vars })))
    }
}

struct VarsCollection {
    vars: Vec<(String, String)>,
}

impl ManagedCollection for VarsCollection {
    fn populate<'a>(
        &self,
        arena: &'a Arena,
        collection: &'a FieldList<'a>,
    ) -> Result<Outcome, Error> {
        let mut dst = collection.borrow_mut();
        for (name, value) in &self.vars {
            dst.push(Field::from_string(name, value, arena));
        }
        Ok(Outcome::Handled)
    }

    fn persist(&self, _collection: &FieldList<'_>) -> Result<Outcome, Error> {
        Ok(Outcome::Declined)
    }
}

/// KvPersist manages collections whose state lives in a filesystem kvstore:
/// the newest version of the key is loaded at transaction start and the
/// collection is written back as a new version at close.
///
/// URI form: `kvstore:<directory>?key=<key>[&expire=<seconds>]`. The key
/// defaults to the collection name; `expire` defaults to never.
#[derive(Debug, Default)]
pub struct KvPersist;

impl CollectionManager for KvPersist {
    fn name(&self) -> &str {
        "persist"
    }

    fn scheme(&self) -> &str {
        "kvstore"
    }

    fn register(
        &self,
        collection: &str,
        uri: &Url,
        _params: &[String],
    ) -> Result<Option<Box<dyn ManagedCollection>>, Error> {
        let dir = uri.path();
        if dir.is_empty() {
            return Err(Error::Invalid(format!(
                "collection {collection:?}: {uri} names no store directory"
            )));
        }

        let mut key = None;
        let mut expire = 0u32;
        for (k, v) in uri.query_pairs() {
            match k.as_ref() {
                "key" => key = Some(v.into_owned()),
                "expire" => {
                    expire = v.parse().map_err(|_| {
                        Error::Invalid(format!(
                            "collection {collection:?}: expire {v:?} is not seconds"
                        ))
                    })?;
                }
                other => {
                    return Err(Error::Invalid(format!(
                        "collection {collection:?}: unknown uri parameter {other:?}"
                    )))
                }
            }
        }

        std::fs::create_dir_all(dir)?;
        Ok(Some(Box::new(KvCollection {
            key: key.unwrap_or_else(|| collection.to_string()),
            expire,
            store: Store::with_merge_policy(Filesystem::new(dir), Newest),
        })))
    }
}

struct KvCollection {
    key: String,
    expire: u32,
    store: Store,
}

impl ManagedCollection for KvCollection {
    fn populate<'a>(
        &self,
        arena: &'a Arena,
        collection: &'a FieldList<'a>,
    ) -> Result<Outcome, Error> {
        let value = match self.store.get(&self.key) {
            Ok(value) => value,
            // No persisted state yet: decline, leaving the collection empty.
            Err(kvstore::Error::NotFound) => return Ok(Outcome::Declined),
            Err(err) => return Err(err.into()),
        };

        let state: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&value.data)?;
        let mut dst = collection.borrow_mut();
        for (name, json) in &state {
            match json_to_field(name, json, arena) {
                Some(field) => dst.push(field),
                None => tracing::warn!(
                    key = %self.key,
                    field = %name,
                    "persisted field has an unsupported shape; dropping it"
                ),
            }
        }
        Ok(Outcome::Handled)
    }

    fn persist(&self, collection: &FieldList<'_>) -> Result<Outcome, Error> {
        let mut state = serde_json::Map::new();
        for field in collection.borrow().iter() {
            match field_to_json(field) {
                Some(json) => {
                    state.insert(field.name().to_string(), json);
                }
                None => tracing::warn!(
                    key = %self.key,
                    field = field.name(),
                    "field has no persistent form; dropping it"
                ),
            }
        }

        let data = serde_json::to_vec(&serde_json::Value::Object(state))?;
        self.store
            .set(&self.key, &kvstore::Value::new(data, "json", self.expire))?;
        Ok(Outcome::Handled)
    }
}

fn json_to_field<'a>(name: &str, json: &serde_json::Value, arena: &'a Arena) -> Option<Field<'a>> {
    match json {
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(Field::num(name, v, arena))
            } else if let Some(v) = n.as_u64() {
                Some(Field::unum(name, v, arena))
            } else {
                n.as_f64().map(|v| Field::float(name, v, arena))
            }
        }
        serde_json::Value::String(s) => Some(Field::nulstr(name, s, arena)),
        _ => None,
    }
}

fn field_to_json(field: &Field<'_>) -> Option<serde_json::Value> {
    match field.value().ok()? {
        Value::Num(n) => Some(n.into()),
        Value::Unum(n) => Some(n.into()),
        Value::Float(f) => serde_json::Number::from_f64(f).map(serde_json::Value::Number),
        Value::NulStr(s) => Some(s.into()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned().into()),
        Value::List(_) | Value::Stream(_) => None,
    }
}
