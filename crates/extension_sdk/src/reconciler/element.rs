use std::{collections::BTreeMap, fmt, sync::Arc};

use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::bus::{Callback, Incoming};

/// A property value in a declarative snapshot.
///
/// Callbacks are only meaningful as top-level props; one nested inside a
/// `Map` or `List` serialises as `null`.
#[derive(Clone)]
pub enum Prop {
    Null,
    String(String),
    /// Kept as JSON number so integers outside the `f64` range stay exact.
    Number(Number),
    Bool(bool),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, Prop>),
    List(Vec<Prop>),
    Callback(Callback),
}

impl Prop {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        Prop::Callback(Arc::new(f))
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Prop::Callback(_))
    }

    /// Structural equality. Callbacks are never compared by identity: two
    /// callbacks are always "the same" since they sit behind a stable handler id.
    pub fn same_value(&self, other: &Prop) -> bool {
        match (self, other) {
            (Prop::Null, Prop::Null) => true,
            (Prop::String(a), Prop::String(b)) => a == b,
            (Prop::Number(a), Prop::Number(b)) => a == b,
            (Prop::Bool(a), Prop::Bool(b)) => a == b,
            (Prop::Bytes(a), Prop::Bytes(b)) => a == b,
            (Prop::Map(a), Prop::Map(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| ka == kb && va.same_value(vb))
            }
            (Prop::List(a), Prop::List(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_value(y)),
            (Prop::Callback(_), Prop::Callback(_)) => true,
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Prop::Null => Value::Null,
            Prop::String(s) => Value::String(s.clone()),
            Prop::Number(n) => Value::Number(n.clone()),
            Prop::Bool(b) => Value::Bool(*b),
            Prop::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Prop::Map(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>()),
            Prop::List(items) => Value::Array(items.iter().map(Prop::to_json).collect()),
            Prop::Callback(_) => {
                warn!("nested callback prop cannot be serialised, sending null");
                Value::Null
            }
        }
    }
}

impl fmt::Debug for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prop::Null => f.write_str("Null"),
            Prop::String(s) => f.debug_tuple("String").field(s).finish(),
            Prop::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Prop::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Prop::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Prop::Map(m) => f.debug_map().entries(m.iter()).finish(),
            Prop::List(l) => f.debug_list().entries(l.iter()).finish(),
            Prop::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<&str> for Prop {
    fn from(s: &str) -> Self {
        Prop::String(s.to_string())
    }
}

impl From<String> for Prop {
    fn from(s: String) -> Self {
        Prop::String(s)
    }
}

/// NaN and the infinities have no JSON form and become `Null`.
impl From<f64> for Prop {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Prop::Number).unwrap_or(Prop::Null)
    }
}

impl From<i64> for Prop {
    fn from(n: i64) -> Self {
        Prop::Number(n.into())
    }
}

impl From<u64> for Prop {
    fn from(n: u64) -> Self {
        Prop::Number(n.into())
    }
}

impl From<i32> for Prop {
    fn from(n: i32) -> Self {
        Prop::Number(n.into())
    }
}

impl From<bool> for Prop {
    fn from(b: bool) -> Self {
        Prop::Bool(b)
    }
}

impl From<Vec<u8>> for Prop {
    fn from(bytes: Vec<u8>) -> Self {
        Prop::Bytes(bytes)
    }
}

impl From<Vec<Prop>> for Prop {
    fn from(items: Vec<Prop>) -> Self {
        Prop::List(items)
    }
}

impl From<Value> for Prop {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Prop::Null,
            Value::Bool(b) => Prop::Bool(b),
            Value::Number(n) => Prop::Number(n),
            Value::String(s) => Prop::String(s),
            Value::Array(items) => Prop::List(items.into_iter().map(Prop::from).collect()),
            Value::Object(map) => Prop::Map(map.into_iter().map(|(k, v)| (k, Prop::from(v))).collect()),
        }
    }
}

/// One node of a declarative UI snapshot, rebuilt from scratch on every render.
#[derive(Clone, Debug)]
pub struct Element {
    pub kind: String,
    pub props: BTreeMap<String, Prop>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), props: BTreeMap::new(), children: Vec::new() }
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Prop>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Attach a callback prop, e.g. `onAction`.
    pub fn on<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        self.props.insert(key.into(), Prop::callback(f));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn callbacks_compare_equal_values_structurally() {
        assert!(Prop::callback(|_| {}).same_value(&Prop::callback(|_| {})));
        assert!(Prop::from("a").same_value(&Prop::from("a")));
        assert!(!Prop::from("a").same_value(&Prop::from(1)));
        assert!(Prop::from(f64::NAN).same_value(&Prop::Null));
        let nested = Prop::from(json!({"a": [1, 2], "b": true}));
        assert!(nested.same_value(&Prop::from(json!({"a": [1, 2], "b": true}))));
        assert!(!nested.same_value(&Prop::from(json!({"a": [1, 3], "b": true}))));
    }

    #[test]
    fn to_json_converts_every_variant() {
        let prop = Prop::List(vec![
            Prop::Null,
            Prop::from("s"),
            Prop::from(1.5),
            Prop::from(false),
            Prop::Bytes(vec![1, 2]),
            Prop::callback(|_| {}),
        ]);
        assert_eq!(prop.to_json(), json!([null, "s", 1.5, false, [1, 2], null]));
    }

    #[test]
    fn large_integers_serialise_exactly() {
        let big = (1i64 << 53) + 1;
        assert_eq!(Prop::from(big).to_json(), json!(9_007_199_254_740_993i64));
        assert_eq!(Prop::from(u64::MAX).to_json(), json!(u64::MAX));
        assert_eq!(Prop::from(json!(-42)).to_json(), json!(-42));
        assert!(!Prop::from(big).same_value(&Prop::from(big - 1)));
    }

    #[test]
    fn builder_collects_children_in_order() {
        let el = Element::new("List")
            .prop("title", "Results")
            .child(Element::new("Item").prop("title", "a"))
            .children(vec![Element::new("Item"), Element::new("Section")]);
        let kinds: Vec<_> = el.children.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(kinds, ["Item", "Item", "Section"]);
    }
}
