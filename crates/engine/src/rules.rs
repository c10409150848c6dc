use crate::actions::ActionInst;
use crate::matchers::CompiledPattern;
use fields::expand_test;
use std::sync::Arc;

/// Phase identifies a stage of the host-driven pipeline. The host defines
/// the set and the order; the engine only groups rules by it.
pub type Phase = u32;

/// Operator is a rule's match condition: a compiled pattern applied to a
/// named DPI field.
pub struct Operator {
    target: String,
    pattern: Box<dyn CompiledPattern>,
}

impl Operator {
    pub fn new(target: impl Into<String>, pattern: Box<dyn CompiledPattern>) -> Self {
        Self {
            target: target.into(),
            pattern,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn pattern(&self) -> &dyn CompiledPattern {
        &*self.pattern
    }
}

/// Rule is a declarative unit: an id, metadata, an optional operator, and
/// the actions to execute when it fires. A rule without an operator always
/// fires.
///
/// Whether the message and data templates need expansion is decided once,
/// here at load time, not re-detected at execute time.
pub struct Rule {
    id: String,
    phase: Phase,
    operator: Option<Operator>,
    msg: Option<String>,
    data: Option<String>,
    expand_msg: bool,
    expand_data: bool,
    confidence: u8,
    severity: u8,
    tags: Arc<[String]>,
    actions: Vec<ActionInst>,
}

impl Rule {
    pub fn new(id: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: id.into(),
            phase,
            operator: None,
            msg: None,
            data: None,
            expand_msg: false,
            expand_data: false,
            confidence: 0,
            severity: 0,
            tags: Vec::new().into(),
            actions: Vec::new(),
        }
    }

    pub fn with_operator(mut self, operator: Operator) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        self.expand_msg = expand_test(&msg);
        self.msg = Some(msg);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        let data = data.into();
        self.expand_data = expand_test(&data);
        self.data = Some(data);
        self
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags.into();
        self
    }

    pub fn with_action(mut self, action: ActionInst) -> Self {
        self.actions.push(action);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn operator(&self) -> Option<&Operator> {
        self.operator.as_ref()
    }

    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn expand_msg(&self) -> bool {
        self.expand_msg
    }

    pub fn expand_data(&self) -> bool {
        self.expand_data
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn severity(&self) -> u8 {
        self.severity
    }

    /// Tags, shared by reference with every event the rule emits.
    pub fn tags(&self) -> Arc<[String]> {
        self.tags.clone()
    }

    pub fn actions(&self) -> &[ActionInst] {
        &self.actions
    }
}
