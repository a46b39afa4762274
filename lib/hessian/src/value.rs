use std::fmt;

/// A single value in the Hessian type universe.
///
/// Aggregates preserve wire order: object fields and map entries round-trip
/// in the order they were written, which is significant for the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    List(List),
    Map(Map),
    Object(Object),
}

impl Value {
    /// An untyped list.
    pub fn list<I: IntoIterator<Item = Value>>(elements: I) -> Value {
        Value::List(List {
            type_tag: None,
            elements: elements.into_iter().collect(),
        })
    }

    /// A list carrying an element-type tag.
    pub fn typed_list<S: Into<String>, I: IntoIterator<Item = Value>>(tag: S, elements: I) -> Value {
        Value::List(List {
            type_tag: Some(tag.into()),
            elements: elements.into_iter().collect(),
        })
    }

    /// An untyped map from the given entries, preserving their order.
    pub fn map<I: IntoIterator<Item = (Value, Value)>>(entries: I) -> Value {
        Value::Map(Map {
            type_tag: None,
            entries: entries.into_iter().collect(),
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Date(_) => "date",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }
}

/// A sequence of values with an optional element-type tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct List {
    pub type_tag: Option<String>,
    pub elements: Vec<Value>,
}

/// Key/value pairs in wire order with an optional type tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Map {
    pub type_tag: Option<String>,
    pub entries: Vec<(Value, Value)>,
}

impl Map {
    /// Returns the value for the first entry whose key is the given string.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

/// A typed object: a Java class path plus its fields in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Object {
    pub path: String,
    pub fields: Vec<(String, Value)>,
}

impl Object {
    pub fn new<S: Into<String>>(path: S) -> Object {
        Object {
            path: path.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field, returning self for chained construction.
    pub fn field<S: Into<String>>(mut self, name: S, value: Value) -> Object {
        self.fields.push((name.into(), value));
        self
    }

    /// A Java enum constant: an object with the single field `name`.
    pub fn enum_value<P: Into<String>, N: Into<String>>(path: P, name: N) -> Object {
        Object::new(path).field("name", Value::String(name.into()))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{{", self.path)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {:?}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    /// Integers that fit 32 bits travel as ints; the rest are longs.
    fn from(v: i64) -> Value {
        if v >= i64::from(i32::min_value()) && v <= i64::from(i32::max_value()) {
            Value::Int(v as i32)
        } else {
            Value::Long(v)
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Value {
        Value::Object(v)
    }
}
