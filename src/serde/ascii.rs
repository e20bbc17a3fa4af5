//! Space separated text rendering of records, one value per field.
//!
//! Handles (processors, memories, instances and events) are printed in hex
//! so they line up with what Legion Spy emits; everything else is decimal.

use std::fmt::Write;

use serde::ser::{self, Impossible, Serialize};

use super::error::{Error, Result};

const HEX_TYPES: &[&str] = &["ProcID", "MemID", "InstID", "EventID"];

pub struct Serializer {
    output: String,
    hex: bool,
}

pub fn to_string<T>(value: &T) -> Result<String>
where
    T: Serialize + ?Sized,
{
    let mut serializer = Serializer {
        output: String::new(),
        hex: false,
    };
    value.serialize(&mut serializer)?;
    Ok(serializer.output)
}

impl Serializer {
    fn separate(&mut self) {
        if !self.output.is_empty() {
            self.output.push(' ');
        }
    }

    fn write_display<T: std::fmt::Display + std::fmt::LowerHex>(&mut self, v: T) -> Result<()> {
        self.separate();
        if self.hex {
            write!(self.output, "{:#x}", v)
        } else {
            write!(self.output, "{}", v)
        }
        .map_err(|e| Error::Message(e.to_string()))
    }
}

impl<'a> ser::Serializer for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Impossible<(), Error>;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Impossible<(), Error>;
    type SerializeStruct = Self;
    type SerializeStructVariant = Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.write_display(v as u8)
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.write_display(v)
    }

    fn serialize_f32(self, v: f32) -> Result<()> {
        self.separate();
        self.output.push_str(&v.to_string());
        Ok(())
    }

    fn serialize_f64(self, v: f64) -> Result<()> {
        self.separate();
        self.output.push_str(&v.to_string());
        Ok(())
    }

    fn serialize_char(self, v: char) -> Result<()> {
        self.separate();
        self.output.push(v);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.separate();
        self.output.push_str(v);
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<()> {
        Err(Error::Unsupported("byte array"))
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::Unsupported("option"))
    }

    fn serialize_some<T>(self, _value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        Err(Error::Unsupported("option"))
    }

    fn serialize_unit(self) -> Result<()> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T>(self, name: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        let hex = self.hex;
        self.hex = HEX_TYPES.contains(&name);
        let result = value.serialize(&mut *self);
        self.hex = hex;
        result
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        Err(Error::Unsupported("enum"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::Unsupported("enum"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::Unsupported("map"))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::Unsupported("enum"))
    }
}

impl<'a> ser::SerializeTuple for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Serialize;

    #[derive(Serialize)]
    struct EventID(u64);

    #[derive(Serialize)]
    struct OpID(u64);

    #[test]
    fn test_scalars() {
        assert_eq!(to_string(&-12i32).unwrap(), "-12");
        assert_eq!(to_string(&true).unwrap(), "1");
        assert_eq!(to_string("a b").unwrap(), "a b");
    }

    #[test]
    fn test_struct() {
        #[derive(Serialize)]
        struct S {
            op: OpID,
            event: EventID,
            flag: bool,
            name: String,
        }
        let s = S {
            op: OpID(255),
            event: EventID(255),
            flag: false,
            name: "my task".to_owned(),
        };
        assert_eq!(to_string(&s).unwrap(), "255 0xff 0 my task");
    }

    #[test]
    fn test_tuple() {
        assert_eq!(to_string(&(1u8, -2i64, 3u32)).unwrap(), "1 -2 3");
    }
}
