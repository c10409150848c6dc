use crate::events::{EventAction, EventKind, LogEvent};
use crate::rules::Rule;
use crate::tx::{BlockMode, Transaction, TxFlags};
use crate::Error;
use bytes::Bytes;
use fields::{expand_test, Field, Value};
use std::collections::BTreeMap;

/// Per-instance flag word, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstFlags(u32);

impl InstFlags {
    pub const NONE: InstFlags = InstFlags(0);
    /// The instance's parameter contains `%{…}` references and must be
    /// re-expanded against the DPI on every execution. Set by the creation
    /// function; literal parameters are cached instead.
    pub const EXPAND: InstFlags = InstFlags(1 << 0);

    pub fn set(&mut self, flags: InstFlags) {
        self.0 |= flags.0;
    }

    pub fn contains(&self, flags: InstFlags) -> bool {
        self.0 & flags.0 == flags.0
    }
}

/// Action is the execute half of a registered action: a capability invoked
/// against the firing rule and the current transaction.
pub trait Action: Send + Sync {
    fn execute(
        &self,
        rule: &Rule,
        tx: &mut Transaction<'_>,
        flags: InstFlags,
    ) -> Result<(), Error>;
}

/// ActionInst pairs an Action with the state its creation function derived
/// from the rule parameters, plus the instance flag word.
pub struct ActionInst {
    name: &'static str,
    exec: Box<dyn Action>,
    flags: InstFlags,
}

impl ActionInst {
    pub fn new(name: &'static str, exec: Box<dyn Action>, flags: InstFlags) -> Self {
        Self { name, exec, flags }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> InstFlags {
        self.flags
    }

    pub fn execute(&self, rule: &Rule, tx: &mut Transaction<'_>) -> Result<(), Error> {
        self.exec.execute(rule, tx, self.flags)
    }
}

type Factory = Box<dyn Fn(Option<&str>) -> Result<ActionInst, Error> + Send + Sync>;

/// ActionRegistry maps action names to creation functions. It is mutated
/// only during configuration; building the engine freezes it.
#[derive(Default)]
pub struct ActionRegistry {
    factories: BTreeMap<String, Factory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name`. Duplicate names are rejected.
    pub fn register<F>(&mut self, name: &str, create: F) -> Result<(), Error>
    where
        F: Fn(Option<&str>) -> Result<ActionInst, Error> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(Error::Exists(format!("action {name:?}")));
        }
        self.factories.insert(name.to_string(), Box::new(create));
        Ok(())
    }

    /// Create an instance of the named action from its rule parameters.
    pub fn create(&self, name: &str, params: Option<&str>) -> Result<ActionInst, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("action {name:?}")))?;
        factory(params)
    }
}

/// Register the five core actions.
pub fn register_core_actions(registry: &mut ActionRegistry) -> Result<(), Error> {
    registry.register("setflag", setflag_create)?;
    registry.register("setvar", setvar_create)?;
    registry.register("event", event_create)?;
    registry.register("block", block_create)?;
    registry.register("status", status_create)?;
    Ok(())
}

// ---- setflag ----

struct Setflag {
    flag: String,
}

fn setflag_create(params: Option<&str>) -> Result<ActionInst, Error> {
    let flag = params.ok_or_else(|| Error::Invalid("setflag requires a flag name".to_string()))?;
    Ok(ActionInst::new(
        "setflag",
        Box::new(Setflag {
            flag: flag.to_string(),
        }),
        InstFlags::NONE,
    ))
}

impl Action for Setflag {
    fn execute(&self, _rule: &Rule, tx: &mut Transaction<'_>, _flags: InstFlags) -> Result<(), Error> {
        // Flag names are validated here, not at creation.
        if self.flag.eq_ignore_ascii_case("suspicious") {
            tx.set_flags(TxFlags::SUSPICIOUS);
            Ok(())
        } else {
            Err(Error::Invalid(format!(
                "setflag: unknown flag {:?}",
                self.flag
            )))
        }
    }
}

// ---- setvar ----

enum SetvarOp {
    /// Bind a byte string, replacing any existing binding.
    StrSet(String),
    /// Bind a number, replacing any existing binding.
    NumSet(i64),
    /// Add to an existing numeric binding.
    NumAdd(i64),
}

struct Setvar {
    name: String,
    op: SetvarOp,
}

fn setvar_create(params: Option<&str>) -> Result<ActionInst, Error> {
    let params =
        params.ok_or_else(|| Error::Invalid("setvar requires name=value".to_string()))?;
    let (name, value) = match params.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() && !value.contains('=') => {
            (name, value)
        }
        _ => {
            return Err(Error::Invalid(format!(
                "setvar: parameter {params:?} is not name=value"
            )))
        }
    };

    // A value that parses as an integer selects a numeric operation: a
    // leading sign means "add", no sign means "set". Anything else is a
    // string set.
    if let Ok(n) = value.parse::<i64>() {
        let op = if value.starts_with('+') || value.starts_with('-') {
            SetvarOp::NumAdd(n)
        } else {
            SetvarOp::NumSet(n)
        };
        return Ok(ActionInst::new(
            "setvar",
            Box::new(Setvar {
                name: name.to_string(),
                op,
            }),
            InstFlags::NONE,
        ));
    }

    let mut flags = InstFlags::NONE;
    if expand_test(value) {
        flags.set(InstFlags::EXPAND);
    }
    Ok(ActionInst::new(
        "setvar",
        Box::new(Setvar {
            name: name.to_string(),
            op: SetvarOp::StrSet(value.to_string()),
        }),
        flags,
    ))
}

impl Action for Setvar {
    fn execute(&self, _rule: &Rule, tx: &mut Transaction<'_>, flags: InstFlags) -> Result<(), Error> {
        let arena = tx.arena();
        match &self.op {
            SetvarOp::StrSet(template) => {
                let expanded: &[u8] = if flags.contains(InstFlags::EXPAND) {
                    tx.data.expand(template, arena)?
                } else {
                    arena.alloc_slice_copy(template.as_bytes())
                };
                tx.data.remove(&self.name);
                tx.data
                    .add(Field::new(&self.name, Value::Bytes(expanded), arena))?;
            }
            SetvarOp::NumSet(n) => {
                tx.data.remove(&self.name);
                tx.data.add_num(&self.name, *n, arena)?;
            }
            SetvarOp::NumAdd(delta) => {
                let field = tx.data.get_mut(&self.name).ok_or_else(|| {
                    Error::Invalid(format!(
                        "setvar: {:?} does not exist for numeric add",
                        self.name
                    ))
                })?;
                match field.value()? {
                    Value::Num(n) => field.setv(Value::Num(n.wrapping_add(*delta)))?,
                    // Read the current unsigned value, then add with
                    // unsigned wrapping semantics.
                    Value::Unum(n) => field.setv(Value::Unum(n.wrapping_add(*delta as u64)))?,
                    v => {
                        return Err(Error::Invalid(format!(
                            "setvar: {} field {:?} invalid for numeric add",
                            v.ty(),
                            self.name
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

// ---- event ----

struct Event;

fn event_create(_params: Option<&str>) -> Result<ActionInst, Error> {
    Ok(ActionInst::new("event", Box::new(Event), InstFlags::NONE))
}

impl Action for Event {
    fn execute(&self, rule: &Rule, tx: &mut Transaction<'_>, _flags: InstFlags) -> Result<(), Error> {
        let arena = tx.arena();

        let msg = match (rule.msg(), rule.expand_msg()) {
            (Some(msg), true) => {
                String::from_utf8_lossy(tx.data.expand(msg, arena)?).into_owned()
            }
            (Some(msg), false) => msg.to_string(),
            (None, _) => String::new(),
        };
        let data = match (rule.data(), rule.expand_data()) {
            (Some(data), true) => Some(Bytes::copy_from_slice(tx.data.expand(data, arena)?)),
            (Some(data), false) => Some(Bytes::copy_from_slice(data.as_bytes())),
            (None, _) => None,
        };

        tx.push_event(LogEvent {
            rule_id: rule.id().to_string(),
            kind: EventKind::Observation,
            rec_action: EventAction::Unknown,
            action: EventAction::Unknown,
            confidence: rule.confidence(),
            severity: rule.severity(),
            msg,
            data,
            tags: rule.tags(),
        });
        Ok(())
    }
}

// ---- block ----

struct Block {
    mode: BlockMode,
}

fn block_create(params: Option<&str>) -> Result<ActionInst, Error> {
    // Absent or unrecognized modes fall back to advisory blocking.
    let mode = match params {
        Some(p) if p.eq_ignore_ascii_case("phase") => BlockMode::Phase,
        Some(p) if p.eq_ignore_ascii_case("immediate") => BlockMode::Immediate,
        _ => BlockMode::Advisory,
    };
    Ok(ActionInst::new(
        "block",
        Box::new(Block { mode }),
        InstFlags::NONE,
    ))
}

impl Action for Block {
    fn execute(&self, _rule: &Rule, tx: &mut Transaction<'_>, _flags: InstFlags) -> Result<(), Error> {
        tx.block(self.mode)
    }
}

// ---- status ----

struct Status {
    code: u16,
}

fn status_create(params: Option<&str>) -> Result<ActionInst, Error> {
    let params = params.ok_or_else(|| {
        Error::Invalid("status requires a code x where 200 <= x < 600".to_string())
    })?;
    let code: u16 = params.trim().parse().map_err(|_| {
        Error::Invalid(format!("status: {params:?} is not a status code"))
    })?;
    if !(200..600).contains(&code) {
        return Err(Error::Invalid(format!(
            "status: {code} is outside 200 <= x < 600"
        )));
    }
    Ok(ActionInst::new(
        "status",
        Box::new(Status { code }),
        InstFlags::NONE,
    ))
}

impl Action for Status {
    fn execute(&self, _rule: &Rule, tx: &mut Transaction<'_>, _flags: InstFlags) -> Result<(), Error> {
        // Range validation happened at creation.
        tx.set_block_status(self.code);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{register_core_actions, ActionRegistry, InstFlags};
    use crate::rules::Rule;
    use crate::tx::{Intervention, Transaction, TxFlags};
    use crate::Error;
    use fields::{Arena, Field, Value};

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        register_core_actions(&mut registry).unwrap();
        registry
    }

    fn rule() -> Rule {
        Rule::new("test-rule", 1)
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        let err = registry
            .register("setvar", |_| unreachable!("never created"))
            .unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn test_unknown_action() {
        assert!(matches!(
            registry().create("nope", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_setflag() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);

        let inst = registry.create("setflag", Some("suspicious")).unwrap();
        inst.execute(&rule(), &mut tx).unwrap();
        assert!(tx.flags().contains(TxFlags::SUSPICIOUS));
        assert!(tx.data.is_empty());

        // Unknown flags are created fine but fail at execute, leaving the
        // flags unchanged.
        let inst = registry.create("setflag", Some("xyzzy")).unwrap();
        let before = tx.flags();
        assert!(matches!(
            inst.execute(&rule(), &mut tx),
            Err(Error::Invalid(_))
        ));
        assert_eq!(tx.flags(), before);
    }

    #[test]
    fn test_setvar_creation_validation() {
        let registry = registry();
        for bad in ["", "noequals", "=value", "name=", "a=b=c"] {
            assert!(
                matches!(registry.create("setvar", Some(bad)), Err(Error::Invalid(_))),
                "accepted {bad:?}"
            );
        }
        assert!(matches!(
            registry.create("setvar", None),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_setvar_numeric() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);

        // An unsigned literal sets; a signed literal adds.
        let set = registry.create("setvar", Some("counter=0")).unwrap();
        let add = registry.create("setvar", Some("counter=+1")).unwrap();

        set.execute(&rule(), &mut tx).unwrap();
        for _ in 0..3 {
            add.execute(&rule(), &mut tx).unwrap();
        }
        assert!(matches!(
            tx.data.get("counter").unwrap().value().unwrap(),
            Value::Num(3)
        ));

        // NUMSET replaces an existing binding.
        let set5 = registry.create("setvar", Some("counter=5")).unwrap();
        set5.execute(&rule(), &mut tx).unwrap();
        let sub = registry.create("setvar", Some("counter=-2")).unwrap();
        sub.execute(&rule(), &mut tx).unwrap();
        assert!(matches!(
            tx.data.get("counter").unwrap().value().unwrap(),
            Value::Num(3)
        ));
    }

    #[test]
    fn test_setvar_numadd_requires_numeric_binding() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);

        // No binding at all.
        let add = registry.create("setvar", Some("missing=+1")).unwrap();
        assert!(matches!(
            add.execute(&rule(), &mut tx),
            Err(Error::Invalid(_))
        ));

        // A string binding is no better.
        tx.data.add_nulstr("s", "text", &arena).unwrap();
        let add = registry.create("setvar", Some("s=+1")).unwrap();
        assert!(matches!(
            add.execute(&rule(), &mut tx),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_setvar_numadd_unsigned_wraps() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);

        tx.data.add(Field::unum("u", u64::MAX, &arena)).unwrap();
        let add = registry.create("setvar", Some("u=+2")).unwrap();
        add.execute(&rule(), &mut tx).unwrap();
        assert!(matches!(
            tx.data.get("u").unwrap().value().unwrap(),
            Value::Unum(1)
        ));
    }

    #[test]
    fn test_setvar_string_replaces() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);

        let hello = registry.create("setvar", Some("X=hello")).unwrap();
        let world = registry.create("setvar", Some("X=world")).unwrap();
        assert_eq!(hello.flags(), InstFlags::NONE);

        hello.execute(&rule(), &mut tx).unwrap();
        world.execute(&rule(), &mut tx).unwrap();
        match tx.data.get("X").unwrap().value().unwrap() {
            Value::Bytes(b) => assert_eq!(b, b"world"),
            v => panic!("unexpected value {v:?}"),
        }
    }

    #[test]
    fn test_setvar_string_expansion() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);
        tx.data.add_nulstr("user", "alice", &arena).unwrap();

        let inst = registry
            .create("setvar", Some("greeting=hello %{user}"))
            .unwrap();
        assert!(inst.flags().contains(InstFlags::EXPAND));

        inst.execute(&rule(), &mut tx).unwrap();
        match tx.data.get("greeting").unwrap().value().unwrap() {
            Value::Bytes(b) => assert_eq!(b, b"hello alice"),
            v => panic!("unexpected value {v:?}"),
        }
    }

    #[test]
    fn test_event_expands_per_rule_flags() {
        let registry = registry();
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);
        tx.data.add_nulstr("user", "mallory", &arena).unwrap();

        let rule = Rule::new("r-42", 1)
            .with_msg("bad login by %{user}")
            .with_data("literal %no-expansion")
            .with_confidence(75)
            .with_severity(50)
            .with_tags(vec!["auth".to_string()]);

        let inst = registry.create("event", None).unwrap();
        inst.execute(&rule, &mut tx).unwrap();

        let event = &tx.events()[0];
        assert_eq!(event.rule_id, "r-42");
        assert_eq!(event.msg, "bad login by mallory");
        assert_eq!(event.data.as_deref(), Some(&b"literal %no-expansion"[..]));
        assert_eq!(event.confidence, 75);
        assert_eq!(event.severity, 50);
        assert_eq!(&*event.tags, ["auth".to_string()]);
    }

    #[test]
    fn test_block_mode_parsing() {
        let registry = registry();
        let arena = Arena::new();

        for (params, flag) in [
            (None, TxFlags::BLOCK_ADVISORY),
            (Some("advisory"), TxFlags::BLOCK_ADVISORY),
            (Some("phase"), TxFlags::BLOCK_PHASE),
            (Some("IMMEDIATE"), TxFlags::BLOCK_IMMEDIATE),
            // Unrecognized modes fall back to advisory.
            (Some("whatever"), TxFlags::BLOCK_ADVISORY),
        ] {
            let mut tx = Transaction::new(1, &arena);
            let inst = registry.create("block", params).unwrap();
            inst.execute(&rule(), &mut tx).unwrap();
            assert!(tx.flags().contains(flag), "params {params:?}");
        }
    }

    #[test]
    fn test_status_bounds() {
        let registry = registry();

        assert!(registry.create("status", Some("404")).is_ok());
        assert!(registry.create("status", Some("599")).is_ok());
        for bad in ["199", "600", "0", "-1", "junk"] {
            assert!(
                matches!(registry.create("status", Some(bad)), Err(Error::Invalid(_))),
                "accepted {bad:?}"
            );
        }

        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);
        let inst = registry.create("status", Some("404")).unwrap();
        inst.execute(&rule(), &mut tx).unwrap();
        assert_eq!(tx.block_status(), 404);

        // The status only surfaces through a block.
        assert_eq!(tx.intervention(), Intervention::None);
        let block = registry.create("block", Some("phase")).unwrap();
        block.execute(&rule(), &mut tx).unwrap();
        assert_eq!(tx.intervention(), Intervention::Block(404));
    }
}
