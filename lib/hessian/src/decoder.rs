use crate::codes::*;
use crate::error::DecodeError;
use crate::value::{List, Map, Object, Value};
use byteorder::{BigEndian, ReadBytesExt};

type Result<T> = std::result::Result<T, DecodeError>;

/// A class definition interned from a `C` record: the class path plus its
/// field names in declaration order.
#[derive(Debug, Clone)]
struct ClassDef {
    path: String,
    field_names: Vec<String>,
}

/// Decodes one message worth of values by dispatching on the leading opcode
/// of each value.
///
/// Holds the per-message tables: interned class definitions, list/map type
/// tags, and the object table that `0x51` back-references index into. Like
/// the encoder, an instance must not outlive the message it was created for.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    types: Vec<String>,
    class_defs: Vec<ClassDef>,
    objects: Vec<Value>,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder {
            data,
            pos: 0,
            types: Vec::new(),
            class_defs: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Number of bytes left in the message.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Decodes the next value, whatever its type.
    pub fn read_value(&mut self) -> Result<Value> {
        match self.peek_byte()? {
            BC_TRUE | BC_FALSE => self.read_bool().map(Value::Bool),
            0x80..=0xd7 | BC_INT => self.read_int().map(Value::Int),
            0xd8..=0xff | 0x38..=0x3f | BC_LONG_INT | BC_LONG => self.read_long().map(Value::Long),
            0x5b..=0x5f | BC_DOUBLE => self.read_double().map(Value::Double),
            0x00..=0x1f | 0x30..=0x33 | BC_STRING_CHUNK | BC_STRING => {
                self.read_string().map(Value::String)
            }
            0x20..=0x2f | BC_BINARY_CHUNK | BC_BINARY => self.read_binary().map(Value::Binary),
            BC_NULL => self.read_null().map(|_| Value::Null),
            BC_DATE_MILLIS | BC_DATE_MINUTES => self.read_date().map(Value::Date),
            0x70..=0x7f | 0x55..=0x58 => self.read_list(),
            BC_MAP_TYPED | BC_MAP_UNTYPED => self.read_map(),
            BC_CLASS_DEF => self.read_class(),
            0x60..=0x6f | BC_OBJECT => self.read_object(),
            BC_REF => self.read_ref(),
            opcode => Err(DecodeError::new(format!(
                "unknown opcode 0x{:02x} at offset {}",
                opcode, self.pos
            ))),
        }
    }

    fn peek_byte(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| DecodeError::new("unexpected end of input"))
    }

    fn read_byte(&mut self) -> Result<u8> {
        let value = self.peek_byte()?;
        self.pos += 1;
        Ok(value)
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(DecodeError::new(format!(
                "need {} bytes at offset {}, have {}",
                count,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_i16(&mut self) -> Result<i16> {
        let mut bytes = self.read_bytes(2)?;
        bytes
            .read_i16::<BigEndian>()
            .map_err(|_| DecodeError::new("short i16"))
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut bytes = self.read_bytes(2)?;
        bytes
            .read_u16::<BigEndian>()
            .map_err(|_| DecodeError::new("short u16"))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut bytes = self.read_bytes(4)?;
        bytes
            .read_i32::<BigEndian>()
            .map_err(|_| DecodeError::new("short i32"))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut bytes = self.read_bytes(8)?;
        bytes
            .read_i64::<BigEndian>()
            .map_err(|_| DecodeError::new("short i64"))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_byte()? {
            BC_TRUE => Ok(true),
            BC_FALSE => Ok(false),
            opcode => Err(DecodeError::new(format!(
                "0x{:02x} is not a boolean",
                opcode
            ))),
        }
    }

    pub fn read_null(&mut self) -> Result<()> {
        match self.read_byte()? {
            BC_NULL => Ok(()),
            opcode => Err(DecodeError::new(format!("0x{:02x} is not null", opcode))),
        }
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let opcode = self.read_byte()?;
        match opcode {
            0x80..=0xbf => Ok(i32::from(opcode) - i32::from(BC_INT_ZERO)),
            0xc0..=0xcf => {
                let low = self.read_byte()?;
                Ok(((i32::from(opcode) - i32::from(BC_INT_BYTE_ZERO)) << 8) | i32::from(low))
            }
            0xd0..=0xd7 => {
                let mid = self.read_byte()?;
                let low = self.read_byte()?;
                Ok(((i32::from(opcode) - i32::from(BC_INT_SHORT_ZERO)) << 16)
                    | (i32::from(mid) << 8)
                    | i32::from(low))
            }
            BC_INT => self.read_i32(),
            _ => Err(DecodeError::new(format!(
                "0x{:02x} is not an int",
                opcode
            ))),
        }
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let opcode = self.read_byte()?;
        match opcode {
            0xd8..=0xef => Ok(i64::from(opcode) - i64::from(BC_LONG_ZERO)),
            0xf0..=0xff => {
                let low = self.read_byte()?;
                Ok(((i64::from(opcode) - i64::from(BC_LONG_BYTE_ZERO)) << 8) | i64::from(low))
            }
            0x38..=0x3f => {
                let mid = self.read_byte()?;
                let low = self.read_byte()?;
                Ok(((i64::from(opcode) - i64::from(BC_LONG_SHORT_ZERO)) << 16)
                    | (i64::from(mid) << 8)
                    | i64::from(low))
            }
            BC_LONG_INT => Ok(i64::from(self.read_i32()?)),
            BC_LONG => self.read_i64(),
            _ => Err(DecodeError::new(format!(
                "0x{:02x} is not a long",
                opcode
            ))),
        }
    }

    pub fn read_double(&mut self) -> Result<f64> {
        let opcode = self.read_byte()?;
        match opcode {
            BC_DOUBLE_ZERO => Ok(0.0),
            BC_DOUBLE_ONE => Ok(1.0),
            BC_DOUBLE_BYTE => Ok(f64::from(self.read_byte()? as i8)),
            BC_DOUBLE_SHORT => Ok(f64::from(self.read_i16()?)),
            BC_DOUBLE_MILL => Ok(f64::from(self.read_i32()?) * 0.001),
            BC_DOUBLE => Ok(f64::from_bits(self.read_i64()? as u64)),
            _ => Err(DecodeError::new(format!(
                "0x{:02x} is not a double",
                opcode
            ))),
        }
    }

    pub fn read_date(&mut self) -> Result<i64> {
        let opcode = self.read_byte()?;
        match opcode {
            BC_DATE_MILLIS => self.read_i64(),
            BC_DATE_MINUTES => Ok(i64::from(self.read_i32()?) * 60_000),
            _ => Err(DecodeError::new(format!(
                "0x{:02x} is not a date",
                opcode
            ))),
        }
    }

    /// Reads a string, reassembling 0x8000-character chunks.
    pub fn read_string(&mut self) -> Result<String> {
        let mut value = String::new();
        let mut opcode = self.read_byte()?;

        while opcode == BC_STRING_CHUNK {
            let length = self.read_u16()? as usize;
            self.read_utf8(length, &mut value)?;
            opcode = self.read_byte()?;
        }

        let length = match opcode {
            BC_STRING => self.read_u16()? as usize,
            0x00..=0x1f => opcode as usize,
            0x30..=0x33 => {
                let low = self.read_byte()?;
                (((opcode - BC_STRING_SHORT) as usize) << 8) | low as usize
            }
            _ => {
                return Err(DecodeError::new(format!(
                    "0x{:02x} is not a string",
                    opcode
                )))
            }
        };
        self.read_utf8(length, &mut value)?;
        Ok(value)
    }

    /// Reads `length` characters of 1-3 byte UTF-8. Four-byte sequences are
    /// outside the BMP and rejected.
    fn read_utf8(&mut self, length: usize, out: &mut String) -> Result<()> {
        out.reserve(length);
        for _ in 0..length {
            let lead = self.read_byte()?;
            let code_point = if lead < 0x80 {
                u32::from(lead)
            } else if lead & 0xe0 == 0xc0 {
                let b1 = self.read_byte()?;
                ((u32::from(lead) & 0x1f) << 6) | (u32::from(b1) & 0x3f)
            } else if lead & 0xf0 == 0xe0 {
                let b1 = self.read_byte()?;
                let b2 = self.read_byte()?;
                ((u32::from(lead) & 0x0f) << 12)
                    | ((u32::from(b1) & 0x3f) << 6)
                    | (u32::from(b2) & 0x3f)
            } else {
                return Err(DecodeError::new(format!(
                    "invalid utf-8 lead byte 0x{:02x}",
                    lead
                )));
            };
            match std::char::from_u32(code_point) {
                Some(ch) => out.push(ch),
                None => {
                    return Err(DecodeError::new(format!(
                        "invalid code point {:#x}",
                        code_point
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn read_binary(&mut self) -> Result<Vec<u8>> {
        let mut value = Vec::new();
        let mut opcode = self.read_byte()?;

        while opcode == BC_BINARY_CHUNK {
            let length = self.read_u16()? as usize;
            value.extend_from_slice(self.read_bytes(length)?);
            opcode = self.read_byte()?;
        }

        let length = match opcode {
            BC_BINARY => self.read_u16()? as usize,
            0x20..=0x2f => (opcode - BC_BINARY_DIRECT) as usize,
            _ => {
                return Err(DecodeError::new(format!(
                    "0x{:02x} is not binary",
                    opcode
                )))
            }
        };
        value.extend_from_slice(self.read_bytes(length)?);
        Ok(value)
    }

    /// Reads a list/map element-type tag, which is either a fresh string or
    /// an index into the type table.
    fn read_type(&mut self) -> Result<String> {
        match self.read_value()? {
            Value::String(tag) => {
                self.types.push(tag.clone());
                Ok(tag)
            }
            Value::Int(index) => self
                .types
                .get(index as usize)
                .cloned()
                .ok_or_else(|| DecodeError::new(format!("type ref {} out of range", index))),
            other => Err(DecodeError::new(format!(
                "{} is not a type tag",
                other.kind()
            ))),
        }
    }

    pub fn read_list(&mut self) -> Result<Value> {
        let opcode = self.read_byte()?;

        // The aggregate joins the object table before its children so that
        // back-references see the right index.
        let slot = self.objects.len();
        self.objects.push(Value::List(List::default()));

        let (type_tag, length) = match opcode {
            0x70..=0x77 => {
                let tag = self.read_type()?;
                (Some(tag), Some((opcode - BC_LIST_DIRECT_TYPED) as usize))
            }
            0x78..=0x7f => (None, Some((opcode - BC_LIST_DIRECT_UNTYPED) as usize)),
            BC_LIST_FIXED_TYPED => {
                let tag = self.read_type()?;
                let length = self.read_int()? as usize;
                (Some(tag), Some(length))
            }
            BC_LIST_FIXED_UNTYPED => {
                let length = self.read_int()? as usize;
                (None, Some(length))
            }
            BC_LIST_VARIABLE_TYPED => (Some(self.read_type()?), None),
            BC_LIST_VARIABLE_UNTYPED => (None, None),
            _ => {
                return Err(DecodeError::new(format!(
                    "0x{:02x} is not a list",
                    opcode
                )))
            }
        };

        let mut elements = Vec::new();
        match length {
            Some(length) => {
                for _ in 0..length {
                    elements.push(self.read_value()?);
                }
            }
            // Variable-length lists run to the end marker.
            None => {
                while self.peek_byte()? != BC_END {
                    elements.push(self.read_value()?);
                }
                self.read_byte()?;
            }
        }

        let list = Value::List(List { type_tag, elements });
        self.objects[slot] = list.clone();
        Ok(list)
    }

    pub fn read_map(&mut self) -> Result<Value> {
        let opcode = self.read_byte()?;

        let slot = self.objects.len();
        self.objects.push(Value::Map(Map::default()));

        let type_tag = match opcode {
            BC_MAP_TYPED => Some(self.read_type()?),
            BC_MAP_UNTYPED => None,
            _ => {
                return Err(DecodeError::new(format!(
                    "0x{:02x} is not a map",
                    opcode
                )))
            }
        };

        let mut entries = Vec::new();
        while self.peek_byte()? != BC_END {
            let key = self.read_value()?;
            let value = self.read_value()?;
            entries.push((key, value));
        }
        self.read_byte()?;

        let map = Value::Map(Map { type_tag, entries });
        self.objects[slot] = map.clone();
        Ok(map)
    }

    /// Reads a `C` class definition and then the object instance that
    /// follows it. Definitions intern into the class table but do not join
    /// the object table; the instances they describe do.
    fn read_class(&mut self) -> Result<Value> {
        self.read_byte()?;
        let path = self.read_string()?;
        let field_count = self.read_int()?;
        if field_count < 0 {
            return Err(DecodeError::new(format!(
                "negative field count {}",
                field_count
            )));
        }
        let mut field_names = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            field_names.push(self.read_string()?);
        }
        self.class_defs.push(ClassDef { path, field_names });
        self.read_value()
    }

    pub fn read_object(&mut self) -> Result<Value> {
        let opcode = self.read_byte()?;
        let index = match opcode {
            0x60..=0x6f => (opcode - BC_OBJECT_DIRECT) as usize,
            BC_OBJECT => self.read_int()? as usize,
            _ => {
                return Err(DecodeError::new(format!(
                    "0x{:02x} is not an object",
                    opcode
                )))
            }
        };
        let def = self
            .class_defs
            .get(index)
            .cloned()
            .ok_or_else(|| DecodeError::new(format!("class ref {} out of range", index)))?;

        let slot = self.objects.len();
        self.objects.push(Value::Object(Object::new(def.path.clone())));

        let mut fields = Vec::with_capacity(def.field_names.len());
        for name in &def.field_names {
            fields.push((name.clone(), self.read_value()?));
        }

        let value = Self::narrow_numeric(Object {
            path: def.path,
            fields,
        })?;
        self.objects[slot] = value.clone();
        Ok(value)
    }

    /// BigDecimal and BigInteger wrappers collapse to the number carried in
    /// their `value` field, in the result and in the object table alike.
    fn narrow_numeric(object: Object) -> Result<Value> {
        match object.path.as_str() {
            "java.math.BigDecimal" => {
                let text = Self::value_field(&object)?;
                let number = text
                    .parse::<f64>()
                    .map_err(|_| DecodeError::new(format!("bad BigDecimal literal {:?}", text)))?;
                Ok(Value::Double(number))
            }
            "java.math.BigInteger" => {
                let text = Self::value_field(&object)?;
                let number = text
                    .parse::<i64>()
                    .map_err(|_| DecodeError::new(format!("bad BigInteger literal {:?}", text)))?;
                Ok(Value::Long(number))
            }
            _ => Ok(Value::Object(object)),
        }
    }

    fn value_field(object: &Object) -> Result<&str> {
        object
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::new(format!("{} without a value field", object.path)))
    }

    /// `0x51 <index>`: a previously decoded aggregate, by object-table
    /// position.
    fn read_ref(&mut self) -> Result<Value> {
        self.read_byte()?;
        let index = self.read_int()?;
        self.objects
            .get(index as usize)
            .cloned()
            .ok_or_else(|| DecodeError::new(format!("object ref {} out of range", index)))
    }
}

/// Decodes a single standalone value.
pub fn decode_value(data: &[u8]) -> Result<Value> {
    Decoder::new(data).read_value()
}
