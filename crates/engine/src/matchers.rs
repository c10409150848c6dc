use crate::Error;
use fields::{Field, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pattern compilation failure: a message and the byte offset at which the
/// engine reported it (zero when the engine doesn't say).
#[derive(thiserror::Error, Debug)]
#[error("{message} (at offset {offset})")]
pub struct CompileError {
    pub message: String,
    pub offset: usize,
}

/// A compiled pattern, ready to match byte inputs and Field inputs.
pub trait CompiledPattern: Send + Sync + std::fmt::Debug {
    fn match_buf(&self, data: &[u8]) -> Result<bool, Error>;

    /// Dispatch on the field's type: byte and text fields match their
    /// bytes. Other types are invalid; numeric matching is open for
    /// extension.
    fn match_field(&self, field: &Field<'_>) -> Result<bool, Error> {
        match field.value()? {
            Value::Bytes(b) => self.match_buf(b),
            Value::NulStr(s) => self.match_buf(s.as_bytes()),
            v => Err(Error::Invalid(format!(
                "cannot match against a {} field",
                v.ty()
            ))),
        }
    }
}

/// MatcherProvider is a pattern engine selected by string key.
pub trait MatcherProvider: Send + Sync {
    fn compile(&self, pattern: &str) -> Result<Box<dyn CompiledPattern>, CompileError>;

    /// Accumulate a pattern into an engine-held set. Engines that support
    /// set matching override this; the baseline does not.
    fn add_pattern(&self, _pattern: &str) -> Result<(), Error> {
        Err(Error::NotImpl)
    }
}

/// Registry of matcher providers, frozen once the engine is built.
#[derive(Default)]
pub struct MatcherRegistry {
    providers: BTreeMap<String, Arc<dyn MatcherProvider>>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, provider: Arc<dyn MatcherProvider>) -> Result<(), Error> {
        if self.providers.contains_key(key) {
            return Err(Error::Exists(format!("matcher {key:?}")));
        }
        self.providers.insert(key.to_string(), provider);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&Arc<dyn MatcherProvider>, Error> {
        self.providers
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("matcher {key:?}")))
    }
}

/// The shipped provider: regular expressions over raw bytes.
#[derive(Debug, Default)]
pub struct RegexMatcher;

impl MatcherProvider for RegexMatcher {
    fn compile(&self, pattern: &str) -> Result<Box<dyn CompiledPattern>, CompileError> {
        match regex::bytes::Regex::new(pattern) {
            Ok(re) => Ok(Box::new(CompiledRegex(re))),
            Err(err) => Err(CompileError {
                message: err.to_string(),
                offset: 0,
            }),
        }
    }
}

#[derive(Debug)]
struct CompiledRegex(regex::bytes::Regex);

impl CompiledPattern for CompiledRegex {
    fn match_buf(&self, data: &[u8]) -> Result<bool, Error> {
        Ok(self.0.is_match(data))
    }
}
