use crate::actions::{register_core_actions, ActionInst, ActionRegistry};
use crate::collections::{CollectionManager, KvPersist, ManagedCollection, Vars};
use crate::events::LogEvent;
use crate::matchers::{MatcherRegistry, RegexMatcher};
use crate::rules::{Phase, Rule};
use crate::tx::{Intervention, Transaction, TxFlags};
use crate::{Error, Outcome};
use fields::Arena;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

/// Connection endpoints reported by the host adapter.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// Connection is the host-visible handle for one client connection; its
/// transactions seed their DPI from it.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    info: ConnInfo,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }
}

// One claimed managed collection.
struct ManagedEntry {
    name: String,
    manager: String,
    instance: Box<dyn ManagedCollection>,
}

/// EngineBuilder is the registration surface: actions, matcher providers,
/// collection managers, managed collections, and rules are all declared
/// here. Building the engine freezes every registry; there is no way to
/// register late, by construction.
pub struct EngineBuilder {
    actions: ActionRegistry,
    matchers: MatcherRegistry,
    managers: Vec<Arc<dyn CollectionManager>>,
    managed: Vec<ManagedEntry>,
    rules: Vec<Rule>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// A builder with the core vocabulary pre-registered: the five core
    /// actions, the regex matcher, and the vars and kvstore collection
    /// managers.
    pub fn new() -> Self {
        let mut actions = ActionRegistry::new();
        register_core_actions(&mut actions).expect("core action names are distinct");

        let mut matchers = MatcherRegistry::new();
        matchers
            .register("regex", Arc::new(RegexMatcher::default()))
            .expect("the registry is empty");

        Self {
            actions,
            matchers,
            managers: vec![
                Arc::new(Vars::default()) as Arc<dyn CollectionManager>,
                Arc::new(KvPersist::default()),
            ],
            managed: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Register a custom action.
    pub fn register_action<F>(&mut self, name: &str, create: F) -> Result<(), Error>
    where
        F: Fn(Option<&str>) -> Result<ActionInst, Error> + Send + Sync + 'static,
    {
        self.actions.register(name, create)
    }

    /// Register a custom matcher provider under `key`.
    pub fn register_matcher(
        &mut self,
        key: &str,
        provider: Arc<dyn crate::matchers::MatcherProvider>,
    ) -> Result<(), Error> {
        self.matchers.register(key, provider)
    }

    /// Register a collection manager. Registration is append-only; several
    /// managers may serve the same scheme, and the first to accept a
    /// collection wins.
    pub fn register_collection_manager(&mut self, manager: Arc<dyn CollectionManager>) {
        self.managers.push(manager);
    }

    /// Create an action instance from the registry, for building rules.
    pub fn action(&self, name: &str, params: Option<&str>) -> Result<ActionInst, Error> {
        self.actions.create(name, params)
    }

    /// Compile `pattern` with the matcher registered under `key`, for
    /// building rule operators.
    pub fn compile(
        &self,
        key: &str,
        pattern: &str,
    ) -> Result<Box<dyn crate::matchers::CompiledPattern>, Error> {
        Ok(self.matchers.get(key)?.compile(pattern)?)
    }

    /// Declare a managed collection. The URI's scheme selects the
    /// manager(s); the first that does not decline claims the collection.
    pub fn manage_collection(
        &mut self,
        name: &str,
        uri: &str,
        params: &[String],
    ) -> Result<(), Error> {
        if self.managed.iter().any(|m| m.name.eq_ignore_ascii_case(name)) {
            return Err(Error::Exists(format!("collection {name:?}")));
        }
        let uri = Url::parse(uri)
            .map_err(|err| Error::Invalid(format!("collection {name:?}: bad uri {uri:?}: {err}")))?;

        for manager in &self.managers {
            if manager.scheme() != uri.scheme() {
                continue;
            }
            match manager.register(name, &uri, params)? {
                Some(instance) => {
                    tracing::debug!(
                        collection = name,
                        manager = manager.name(),
                        %uri,
                        "collection manager claimed collection"
                    );
                    self.managed.push(ManagedEntry {
                        name: name.to_string(),
                        manager: manager.name().to_string(),
                        instance,
                    });
                    return Ok(());
                }
                None => continue,
            }
        }
        Err(Error::NotFound(format!(
            "no collection manager accepted scheme {:?} for collection {name:?}",
            uri.scheme()
        )))
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Freeze the registries and produce the runnable engine.
    pub fn build(self) -> Engine {
        tracing::info!(
            rules = self.rules.len(),
            collections = self.managed.len(),
            "engine configured"
        );
        Engine {
            managers: self.managers,
            managed: self.managed,
            rules: self.rules,
            conn_seq: AtomicU64::new(1),
            tx_seq: AtomicU64::new(1),
        }
    }
}

/// Engine is the frozen configuration plus the transaction machinery. It is
/// shared across threads without locking; per-transaction state lives on
/// the Transaction, never here.
pub struct Engine {
    managers: Vec<Arc<dyn CollectionManager>>,
    managed: Vec<ManagedEntry>,
    rules: Vec<Rule>,
    conn_seq: AtomicU64,
    tx_seq: AtomicU64,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn connection_opened(&self, info: ConnInfo) -> Connection {
        let id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, remote = %info.remote, "connection opened");
        Connection { id, info }
    }

    /// Open a transaction on the caller-owned arena: seed the DPI from the
    /// connection and run every collection populate hook.
    pub fn transaction_started<'a>(
        &self,
        conn: &Connection,
        arena: &'a Arena,
    ) -> Result<Transaction<'a>, Error> {
        let id = self.tx_seq.fetch_add(1, Ordering::Relaxed);
        let mut tx = Transaction::new(id, arena);

        tx.data
            .add_nulstr("remote_addr", &conn.info.remote.ip().to_string(), arena)?;
        tx.data
            .add_num("remote_port", i64::from(conn.info.remote.port()), arena)?;
        tx.data
            .add_nulstr("local_addr", &conn.info.local.ip().to_string(), arena)?;
        tx.data
            .add_num("local_port", i64::from(conn.info.local.port()), arena)?;

        for entry in &self.managed {
            let list = fields::new_list(arena);
            tx.data.add_list(&entry.name, list, arena)?;
            match entry.instance.populate(arena, list) {
                Ok(Outcome::Handled) => {}
                Ok(Outcome::Declined) => tracing::debug!(
                    tx = id,
                    collection = %entry.name,
                    "populate declined; collection left empty"
                ),
                // Populate failures leave the collection empty; the
                // transaction proceeds.
                Err(err) => tracing::error!(
                    tx = id,
                    collection = %entry.name,
                    manager = %entry.manager,
                    error = %err,
                    "collection populate failed"
                ),
            }
        }

        tracing::debug!(tx = id, conn = conn.id, "transaction started");
        Ok(tx)
    }

    /// Run every rule of `phase`, in declaration order, and resolve the
    /// intervention at the phase boundary.
    pub fn run_phase(&self, tx: &mut Transaction<'_>, phase: Phase) -> Intervention {
        // An already-resolved block (immediate or end-of-phase) skips all
        // further rules in the transaction.
        if !matches!(tx.intervention(), Intervention::Block(_)) {
            for rule in self.rules.iter().filter(|r| r.phase() == phase) {
                // The intervention state is re-checked at the start of each
                // rule: an immediate block stops everything after it.
                if tx.flags().contains(TxFlags::BLOCK_IMMEDIATE) {
                    tracing::debug!(tx = tx.id(), rule = rule.id(), "skipped by immediate block");
                    break;
                }
                if !rule_fires(rule, tx) {
                    continue;
                }
                for inst in rule.actions() {
                    if let Err(err) = inst.execute(rule, tx) {
                        // A malformed action is a no-op; co-declared actions
                        // still run.
                        tracing::warn!(
                            tx = tx.id(),
                            rule = rule.id(),
                            action = inst.name(),
                            error = %err,
                            "action failed"
                        );
                    }
                }
            }
        }
        tx.intervention()
    }

    /// Close the transaction: run persist hooks and report the final
    /// intervention together with the buffered log events.
    pub fn transaction_finished(&self, mut tx: Transaction<'_>) -> (Intervention, Vec<LogEvent>) {
        for entry in &self.managed {
            let list = match tx.data.get(&entry.name).map(|f| f.value()) {
                Some(Ok(fields::Value::List(list))) => list,
                // A rule may have removed or rebound the collection; there
                // is nothing left to persist.
                _ => {
                    tracing::debug!(
                        tx = tx.id(),
                        collection = %entry.name,
                        "collection is gone from the DPI; skipping persist"
                    );
                    continue;
                }
            };
            match entry.instance.persist(list) {
                Ok(Outcome::Handled) => {}
                Ok(Outcome::Declined) => {
                    tracing::debug!(tx = tx.id(), collection = %entry.name, "persist declined")
                }
                // Persist failures are logged; the transaction still
                // completes normally.
                Err(err) => tracing::error!(
                    tx = tx.id(),
                    collection = %entry.name,
                    manager = %entry.manager,
                    error = %err,
                    "collection persist failed"
                ),
            }
        }

        let events = tx.take_events();
        let intervention = tx.intervention();
        tracing::debug!(tx = tx.id(), ?intervention, events = events.len(), "transaction finished");
        (intervention, events)
    }

    /// Shut the engine down, unregistering every collection manager.
    pub fn shutdown(self) {
        for manager in &self.managers {
            if let Err(err) = manager.unregister() {
                tracing::error!(manager = manager.name(), error = %err, "unregister failed");
            }
        }
    }
}

fn rule_fires(rule: &Rule, tx: &Transaction<'_>) -> bool {
    let Some(operator) = rule.operator() else {
        return true;
    };
    let Some(field) = tx.data.get(operator.target()) else {
        return false;
    };
    match operator.pattern().match_field(field) {
        Ok(matched) => matched,
        Err(err) => {
            tracing::warn!(
                tx = tx.id(),
                rule = rule.id(),
                target = operator.target(),
                error = %err,
                "operator failed; treating as no match"
            );
            false
        }
    }
}
