use crate::codes::*;
use crate::value::{List, Map, Object, Value};
use bytes::{BufMut, BytesMut};
use hashbrown::HashMap;

/// Serializes one message worth of values, choosing the tightest encoding
/// each value permits.
///
/// The encoder owns the per-message interning state: the class table (class
/// paths already defined) and the type table (list/map element-type tags
/// already written). Create a fresh instance per message and discard it
/// afterwards; the tables must never be shared across messages.
pub struct Encoder {
    buf: BytesMut,
    class_refs: HashMap<String, usize>,
    type_refs: HashMap<String, usize>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            buf: BytesMut::with_capacity(256),
            class_refs: HashMap::new(),
            type_refs: HashMap::new(),
        }
    }

    /// Consumes the encoder and returns the accumulated bytes.
    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.write_null(),
            Value::Bool(v) => self.write_bool(*v),
            Value::Int(v) => self.write_int(*v),
            Value::Long(v) => self.write_long(*v),
            Value::Double(v) => self.write_double(*v),
            Value::String(v) => self.write_string(v),
            Value::Binary(v) => self.write_binary(v),
            Value::Date(v) => self.write_date(*v),
            Value::List(v) => self.write_list(v),
            Value::Map(v) => self.write_map(v),
            Value::Object(v) => self.write_object(v),
        }
    }

    pub fn write_null(&mut self) {
        self.buf.put_u8(BC_NULL);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(if value { BC_TRUE } else { BC_FALSE });
    }

    pub fn write_int(&mut self, value: i32) {
        if value >= INT_DIRECT_MIN && value <= INT_DIRECT_MAX {
            self.buf.put_u8((i32::from(BC_INT_ZERO) + value) as u8);
        } else if value >= INT_BYTE_MIN && value <= INT_BYTE_MAX {
            self.buf.put_u8((i32::from(BC_INT_BYTE_ZERO) + (value >> 8)) as u8);
            self.buf.put_u8(value as u8);
        } else if value >= INT_SHORT_MIN && value <= INT_SHORT_MAX {
            self.buf.put_u8((i32::from(BC_INT_SHORT_ZERO) + (value >> 16)) as u8);
            self.buf.put_u8((value >> 8) as u8);
            self.buf.put_u8(value as u8);
        } else {
            self.buf.put_u8(BC_INT);
            self.buf.put_i32(value);
        }
    }

    pub fn write_long(&mut self, value: i64) {
        if value >= LONG_DIRECT_MIN && value <= LONG_DIRECT_MAX {
            self.buf.put_u8((i64::from(BC_LONG_ZERO) + value) as u8);
        } else if value >= LONG_BYTE_MIN && value <= LONG_BYTE_MAX {
            self.buf.put_u8((i64::from(BC_LONG_BYTE_ZERO) + (value >> 8)) as u8);
            self.buf.put_u8(value as u8);
        } else if value >= LONG_SHORT_MIN && value <= LONG_SHORT_MAX {
            self.buf.put_u8((i64::from(BC_LONG_SHORT_ZERO) + (value >> 16)) as u8);
            self.buf.put_u8((value >> 8) as u8);
            self.buf.put_u8(value as u8);
        } else if value >= i64::from(i32::min_value()) && value <= i64::from(i32::max_value()) {
            self.buf.put_u8(BC_LONG_INT);
            self.buf.put_i32(value as i32);
        } else {
            self.buf.put_u8(BC_LONG);
            self.buf.put_i64(value);
        }
    }

    pub fn write_double(&mut self, value: f64) {
        if value == 0.0 {
            self.buf.put_u8(BC_DOUBLE_ZERO);
            return;
        }
        if value == 1.0 {
            self.buf.put_u8(BC_DOUBLE_ONE);
            return;
        }

        let truncated = value as i64;
        if truncated as f64 == value {
            if truncated >= -0x80 && truncated < 0x80 {
                self.buf.put_u8(BC_DOUBLE_BYTE);
                self.buf.put_i8(truncated as i8);
                return;
            }
            if truncated >= -0x8000 && truncated < 0x8000 {
                self.buf.put_u8(BC_DOUBLE_SHORT);
                self.buf.put_i16(truncated as i16);
                return;
            }
        }

        let mills = (value * 1000.0) as i64;
        if 0.001 * mills as f64 == value
            && mills >= i64::from(i32::min_value())
            && mills <= i64::from(i32::max_value())
        {
            self.buf.put_u8(BC_DOUBLE_MILL);
            self.buf.put_i32(mills as i32);
            return;
        }

        let bits = if value.is_nan() { NAN_BITS } else { value.to_bits() };
        self.buf.put_u8(BC_DOUBLE);
        self.buf.put_u64(bits);
    }

    /// Length prefixes count characters, not bytes; strings beyond the chunk
    /// size are split into 0x8000-character chunks.
    pub fn write_string(&mut self, value: &str) {
        let mut remaining = value;
        let mut char_count = remaining.chars().count();

        while char_count > STRING_CHUNK_SIZE {
            let split = remaining
                .char_indices()
                .nth(STRING_CHUNK_SIZE)
                .map(|(at, _)| at)
                .unwrap_or_else(|| remaining.len());
            let (chunk, rest) = remaining.split_at(split);

            self.buf.put_u8(BC_STRING_CHUNK);
            self.buf.put_u16(STRING_CHUNK_SIZE as u16);
            self.buf.put_slice(chunk.as_bytes());

            remaining = rest;
            char_count -= STRING_CHUNK_SIZE;
        }

        if char_count <= STRING_DIRECT_MAX {
            self.buf.put_u8(char_count as u8);
        } else if char_count <= STRING_SHORT_MAX {
            self.buf.put_u8(BC_STRING_SHORT + (char_count >> 8) as u8);
            self.buf.put_u8(char_count as u8);
        } else {
            self.buf.put_u8(BC_STRING);
            self.buf.put_u16(char_count as u16);
        }
        self.buf.put_slice(remaining.as_bytes());
    }

    pub fn write_binary(&mut self, value: &[u8]) {
        let mut remaining = value;
        while remaining.len() > BINARY_CHUNK_SIZE {
            let (chunk, rest) = remaining.split_at(BINARY_CHUNK_SIZE);
            self.buf.put_u8(BC_BINARY_CHUNK);
            self.buf.put_u16(BINARY_CHUNK_SIZE as u16);
            self.buf.put_slice(chunk);
            remaining = rest;
        }

        if remaining.len() <= BINARY_DIRECT_MAX {
            self.buf.put_u8(BC_BINARY_DIRECT + remaining.len() as u8);
        } else {
            self.buf.put_u8(BC_BINARY);
            self.buf.put_u16(remaining.len() as u16);
        }
        self.buf.put_slice(remaining);
    }

    pub fn write_date(&mut self, millis: i64) {
        self.buf.put_u8(BC_DATE_MILLIS);
        self.buf.put_i64(millis);
    }

    pub fn write_list(&mut self, list: &List) {
        let length = list.elements.len();
        match (&list.type_tag, length <= LIST_DIRECT_MAX) {
            (Some(tag), true) => {
                self.buf.put_u8(BC_LIST_DIRECT_TYPED + length as u8);
                self.write_type(tag);
            }
            (None, true) => {
                self.buf.put_u8(BC_LIST_DIRECT_UNTYPED + length as u8);
            }
            (Some(tag), false) => {
                self.buf.put_u8(BC_LIST_FIXED_TYPED);
                self.write_type(tag);
                self.write_int(length as i32);
            }
            (None, false) => {
                self.buf.put_u8(BC_LIST_FIXED_UNTYPED);
                self.write_int(length as i32);
            }
        }
        for element in &list.elements {
            self.write_value(element);
        }
    }

    pub fn write_map(&mut self, map: &Map) {
        match &map.type_tag {
            Some(tag) => {
                self.buf.put_u8(BC_MAP_TYPED);
                self.write_type(tag);
            }
            None => self.buf.put_u8(BC_MAP_UNTYPED),
        }
        for (key, value) in &map.entries {
            self.write_value(key);
            self.write_value(value);
        }
        self.buf.put_u8(BC_END);
    }

    pub fn write_object(&mut self, object: &Object) {
        let index = match self.class_refs.get(&object.path) {
            Some(&index) => index,
            None => {
                self.buf.put_u8(BC_CLASS_DEF);
                self.write_string(&object.path);
                self.write_int(object.fields.len() as i32);
                for (name, _) in &object.fields {
                    self.write_string(name);
                }
                let index = self.class_refs.len();
                self.class_refs.insert(object.path.clone(), index);
                index
            }
        };

        if index <= OBJECT_DIRECT_MAX {
            self.buf.put_u8(BC_OBJECT_DIRECT + index as u8);
        } else {
            self.buf.put_u8(BC_OBJECT);
            self.write_int(index as i32);
        }
        for (_, value) in &object.fields {
            self.write_value(value);
        }
    }

    /// First occurrence of a tag goes out as a string and joins the type
    /// table; later occurrences are written as the table index.
    fn write_type(&mut self, tag: &str) {
        match self.type_refs.get(tag) {
            Some(&index) => self.write_int(index as i32),
            None => {
                let index = self.type_refs.len();
                self.type_refs.insert(tag.to_string(), index);
                self.write_string(tag);
            }
        }
    }
}

/// Encodes a single standalone value.
pub fn encode_value(value: &Value) -> BytesMut {
    let mut encoder = Encoder::new();
    encoder.write_value(value);
    encoder.into_bytes()
}
