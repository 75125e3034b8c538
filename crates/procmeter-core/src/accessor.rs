//! Fault-tolerant, memoizing attribute access over a process-information source.
//!
//! A source exposes named attributes that are either scalars or nested
//! records (`cpu_times`, `memory_info`, ...). [`Accessor`] wraps a source and
//! resolves dotted paths such as `cpu_times.system`:
//!
//! - a missing, unreadable or unparsable attribute becomes [`Field::Unavailable`],
//! - a permission error becomes [`Field::AccessDenied`], also for every path
//!   below a denied record,
//! - only [`CollectError::ProcessGone`] is returned to the caller.
//!
//! Each attribute is resolved at most once per node, so reading
//! `cpu_times.user` and then `cpu_times.system` queries `cpu_times` once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use crate::collector::CollectError;

/// Cell text for an attribute that could not be determined.
pub const NOT_AVAILABLE: &str = "not available";
/// Cell text for an attribute whose read was refused by the kernel.
pub const TRANSIENT_ERROR: &str = "Transient Error";

/// A terminal attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            // whole floats keep their decimal point
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{:.1}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Outcome of reading one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Present(Value),
    Unavailable,
    AccessDenied,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Present(v) => v.fmt(f),
            Field::Unavailable => f.write_str(NOT_AVAILABLE),
            Field::AccessDenied => f.write_str(TRANSIENT_ERROR),
        }
    }
}

/// What a source returns for an attribute it has.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Scalar(Value),
    Nested(Nested),
}

impl From<Value> for Resolved {
    fn from(v: Value) -> Self {
        Resolved::Scalar(v)
    }
}

impl From<Nested> for Resolved {
    fn from(v: Nested) -> Self {
        Resolved::Nested(v)
    }
}

macro_rules! scalar_into_resolved {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Resolved {
                fn from(v: $t) -> Self {
                    Resolved::Scalar(v.into())
                }
            }
        )*
    };
}

scalar_into_resolved!(i64, u64, u32, i32, f64, String, &str);

/// An already-read structured result, e.g. the user/system pair of `cpu_times`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nested {
    fields: Vec<(&'static str, Resolved)>,
}

impl Nested {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, preserving order.
    pub fn with(mut self, name: &'static str, value: impl Into<Resolved>) -> Self {
        self.fields.push((name, value.into()));
        self
    }

    /// Like [`Nested::with`] but skips `None`.
    pub fn with_opt<V: Into<Resolved>>(self, name: &'static str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }
}

impl AttributeSource for Nested {
    fn resolve(&self, name: &str) -> Result<Option<Resolved>, CollectError> {
        Ok(self
            .fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value.clone()))
    }
}

/// Scope in which a source may batch and cache its underlying reads.
///
/// Dropping the guard releases the cache on every exit path.
#[must_use = "the batch ends as soon as the guard is dropped"]
pub struct Oneshot<'a> {
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Oneshot<'a> {
    /// A guard for sources that have nothing to batch.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// A guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + 'a) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for Oneshot<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A process-information object with named attributes.
pub trait AttributeSource {
    /// Resolves `name`. `Ok(None)` means the attribute does not exist for
    /// this source.
    fn resolve(&self, name: &str) -> Result<Option<Resolved>, CollectError>;

    /// Enters a batched-read scope. The default is a no-op.
    fn oneshot(&self) -> Oneshot<'_> {
        Oneshot::noop()
    }
}

enum Backing<'a> {
    Live(&'a dyn AttributeSource),
    Nested(Nested),
    Absent,
}

enum Slot<'a> {
    Leaf(Field),
    Node(Accessor<'a>),
}

/// Memoizing accessor node over a live source, a nested result, or nothing.
///
/// Borrows the source for one sampling call; the accessor is dropped with it.
pub struct Accessor<'a> {
    backing: Backing<'a>,
    cache: HashMap<String, Slot<'a>>,
}

impl<'a> Accessor<'a> {
    pub fn new(source: &'a dyn AttributeSource) -> Self {
        Self::with_backing(Backing::Live(source))
    }

    /// A node with no backing object; every path through it is unavailable.
    pub fn absent() -> Self {
        Self::with_backing(Backing::Absent)
    }

    fn with_backing(backing: Backing<'a>) -> Self {
        Self {
            backing,
            cache: HashMap::new(),
        }
    }

    /// Reads a dotted attribute path.
    ///
    /// A path that ends on a nested record, or continues past a scalar,
    /// is unavailable: only scalars are ever returned as present.
    pub fn get(&mut self, path: &str) -> Result<Field, CollectError> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        match (self.attr(head)?, rest) {
            (Slot::Leaf(field), None) => Ok(field.clone()),
            (Slot::Node(node), Some(rest)) => node.get(rest),
            (Slot::Leaf(Field::AccessDenied), Some(_)) => Ok(Field::AccessDenied),
            (Slot::Leaf(_), Some(_)) | (Slot::Node(_), None) => Ok(Field::Unavailable),
        }
    }

    fn attr(&mut self, name: &str) -> Result<&mut Slot<'a>, CollectError> {
        match self.cache.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let slot = resolve_slot(&self.backing, name)?;
                Ok(entry.insert(slot))
            }
        }
    }
}

fn resolve_slot<'a>(backing: &Backing<'a>, name: &str) -> Result<Slot<'a>, CollectError> {
    let source: &dyn AttributeSource = match backing {
        Backing::Live(source) => *source,
        Backing::Nested(nested) => nested,
        Backing::Absent => return Ok(Slot::Node(Accessor::absent())),
    };

    match source.resolve(name) {
        Ok(Some(Resolved::Scalar(value))) => Ok(Slot::Leaf(Field::Present(value))),
        Ok(Some(Resolved::Nested(nested))) => {
            Ok(Slot::Node(Accessor::with_backing(Backing::Nested(nested))))
        }
        Ok(None) => Ok(Slot::Leaf(Field::Unavailable)),
        Err(CollectError::AccessDenied(path)) => {
            tracing::trace!("attribute {} denied ({})", name, path);
            Ok(Slot::Leaf(Field::AccessDenied))
        }
        Err(e @ CollectError::ProcessGone(_)) => Err(e),
        Err(e) => {
            tracing::trace!("attribute {} unreadable: {}", name, e);
            Ok(Slot::Leaf(Field::Unavailable))
        }
    }
}
