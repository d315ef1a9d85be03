//! Backend-neutral command and reply representations.
//!
//! The pipeline driver and the reply processors speak these types; only
//! the node pool translates them to and from the wire client. Keeping
//! the boundary here lets the functional tests drive the whole lease
//! machinery against an in-memory backend.

use fred::types::Value;

/// A single Redis command: name plus binary-safe arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A decoded Redis reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Integer(i64),
    Bulk(Vec<u8>),
    Simple(String),
    Array(Vec<Reply>),
    /// A per-command error reply that was not a cluster redirect.
    Error(String),
}

impl Reply {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(elements) => Some(elements),
            _ => None,
        }
    }

    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk string",
            Reply::Simple(_) => "status",
            Reply::Array(_) => "array",
            Reply::Error(_) => "error",
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Reply::Nil,
            Value::Queued => Reply::Simple("QUEUED".to_string()),
            Value::Integer(n) => Reply::Integer(n),
            Value::Boolean(b) => Reply::Integer(i64::from(b)),
            Value::Double(d) => Reply::Bulk(d.to_string().into_bytes()),
            Value::String(s) => Reply::Bulk(s.as_bytes().to_vec()),
            Value::Bytes(b) => Reply::Bulk(b.to_vec()),
            Value::Array(values) => Reply::Array(values.into_iter().map(Reply::from).collect()),
            Value::Map(map) => Reply::Array(
                map.inner()
                    .into_iter()
                    .flat_map(|(k, v)| [Reply::Bulk(k.as_bytes().to_vec()), Reply::from(v)])
                    .collect(),
            ),
            #[allow(unreachable_patterns)]
            other => Reply::Error(format!("unsupported reply type: {other:?}")),
        }
    }
}

/// Which kind of slot redirect the server issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// The slot permanently moved; update the topology.
    Moved,
    /// The slot is migrating; retry once against the target with ASKING.
    Ask,
}

/// A parsed `MOVED`/`ASK` error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub host: String,
    pub port: u16,
}

impl Redirect {
    /// Parse `MOVED <slot> <host>:<port>` or `ASK <slot> <host>:<port>`.
    pub fn parse(message: &str) -> Option<Self> {
        let mut parts = message.split_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot: u16 = parts.next()?.parse().ok()?;
        let (host, port_text) = parts.next()?.rsplit_once(':')?;
        let port: u16 = port_text.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            slot,
            host: host.trim_matches(['[', ']']).to_string(),
            port,
        })
    }
}
