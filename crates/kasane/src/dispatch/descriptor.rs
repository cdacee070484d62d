use crate::event::EventType;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Create,
    Apply,
    ShouldDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodStyle {
    Constructor,
    Static,
    Instance,
}

/// Where a handler is declared: on the aggregate itself or on the projection that builds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodSource {
    Aggregate,
    Projection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// The event payload.
    EventData,
    /// The full event envelope.
    WrappedEvent,
    /// The current snapshot.
    Aggregate,
    Session,
    Cancellation,
    /// Anything the dispatcher cannot supply. Reported by validation.
    Unsupported { name: String, type_name: String },
}

impl Parameter {
    pub fn unsupported(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::Unsupported {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Self::EventData | Self::WrappedEvent)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventData => f.write_str("data"),
            Self::WrappedEvent => f.write_str("event"),
            Self::Aggregate => f.write_str("snapshot"),
            Self::Session => f.write_str("session"),
            Self::Cancellation => f.write_str("cancel"),
            Self::Unsupported { name, type_name } => write!(f, "{name}: {type_name}"),
        }
    }
}

/// Shape of one registered handler, used for resolution order and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub kind: MethodKind,
    pub style: MethodStyle,
    pub source: MethodSource,
    pub name: String,
    pub event_type: EventType,
    pub params: Vec<Parameter>,
}

impl MethodDescriptor {
    pub fn new(kind: MethodKind, style: MethodStyle, source: MethodSource, event_type: EventType) -> Self {
        let name = match (kind, style) {
            (_, MethodStyle::Constructor) => "new",
            (MethodKind::Create, _) => "create",
            (MethodKind::Apply, _) => "apply",
            (MethodKind::ShouldDelete, _) => "should_delete",
        };
        Self {
            kind,
            style,
            source,
            name: name.to_string(),
            event_type,
            params: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Parameter>) -> Self {
        self.params.extend(params);
        self
    }

    /// Problems that make this handler unusable, one message each.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for param in &self.params {
            if let Parameter::Unsupported { name, type_name } = param {
                problems.push(format!(
                    "{self}: parameter `{name}` of type `{type_name}` is not the event, snapshot, session or cancellation"
                ));
            }
        }
        if !self.params.iter().any(Parameter::is_event) {
            problems.push(format!("{self}: no event parameter"));
        }
        let takes_snapshot = self.params.contains(&Parameter::Aggregate);
        match self.kind {
            MethodKind::Create if takes_snapshot => {
                problems.push(format!("{self}: create handlers cannot take the snapshot"));
            }
            MethodKind::Apply | MethodKind::ShouldDelete
                if !takes_snapshot && self.source == MethodSource::Projection =>
            {
                problems.push(format!("{self}: projection handlers must take the snapshot"));
            }
            _ => {}
        }
        problems
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.params.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        write!(f, "{:?}::{}({params}) for {}", self.source, self.name, self.event_type)
    }
}
