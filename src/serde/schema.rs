//! Derives the field layout of a record from its `Serialize` impl, so the
//! format lines in a log header can never drift from what gets written.

use std::fmt;

use serde::ser::{self, Impossible, Serialize};

use super::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFormat {
    pub name: &'static str,
    pub type_name: &'static str,
    pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFormat {
    pub id: u32,
    pub name: &'static str,
    pub fields: Vec<FieldFormat>,
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{id:{}", self.name, self.id)?;
        for field in &self.fields {
            write!(f, ", {}:{}:{}", field.name, field.type_name, field.size)?;
        }
        write!(f, "}}")
    }
}

/// Describes the fields `sample` serializes, in order.
pub fn record_format<T>(id: u32, name: &'static str, sample: &T) -> Result<RecordFormat>
where
    T: Serialize + ?Sized,
{
    let mut fields = Vec::new();
    sample.serialize(StructLayout {
        fields: &mut fields,
    })?;
    Ok(RecordFormat { id, name, fields })
}

// Newtype names whose wire name differs from the Rust one.
fn type_alias(name: &'static str) -> &'static str {
    match name {
        "OpID" => "UniqueID",
        "Timestamp" => "timestamp_t",
        "EventID" => "LgEvent",
        "NodeID" => "AddressSpaceID",
        "MapperCallKindID" => "MappingCallKind",
        "RuntimeCallKindID" => "RuntimeCallKind",
        "BacktraceID" => "unsigned long long",
        _ => name,
    }
}

struct StructLayout<'a> {
    fields: &'a mut Vec<FieldFormat>,
}

struct Fields<'a> {
    fields: &'a mut Vec<FieldFormat>,
}

struct FieldType;

type Layout = Result<()>;
type Type = Result<(&'static str, i32)>;

macro_rules! unsupported {
    ($ok:ty; $($method:ident($($arg:ty),*)),* $(,)?) => {
        $(
            fn $method(self, $(_: $arg),*) -> $ok {
                Err(Error::Unsupported(stringify!($method)))
            }
        )*
    };
}

impl<'a> ser::Serializer for StructLayout<'a> {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Impossible<(), Error>;
    type SerializeTuple = Impossible<(), Error>;
    type SerializeTupleStruct = Impossible<(), Error>;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Impossible<(), Error>;
    type SerializeStruct = Fields<'a>;
    type SerializeStructVariant = Impossible<(), Error>;

    unsupported! { Layout;
        serialize_bool(bool), serialize_i8(i8), serialize_i16(i16), serialize_i32(i32),
        serialize_i64(i64), serialize_u8(u8), serialize_u16(u16), serialize_u32(u32),
        serialize_u64(u64), serialize_f32(f32), serialize_f64(f64), serialize_char(char),
        serialize_str(&str), serialize_bytes(&[u8]), serialize_none(), serialize_unit(),
        serialize_unit_struct(&'static str),
        serialize_unit_variant(&'static str, u32, &'static str),
    }

    fn serialize_some<T>(self, _value: &T) -> Layout
    where
        T: ?Sized + Serialize,
    {
        Err(Error::Unsupported("option"))
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Layout
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Layout
    where
        T: ?Sized + Serialize,
    {
        Err(Error::Unsupported("enum"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::Unsupported("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::Unsupported("tuple struct"))
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
        Ok(Fields {
            fields: self.fields,
        })
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

impl<'a> ser::SerializeStruct for Fields<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        let (type_name, size) = value.serialize(FieldType)?;
        self.fields.push(FieldFormat {
            name: key,
            type_name,
            size,
        });
        Ok(())
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl ser::Serializer for FieldType {
    type Ok = (&'static str, i32);
    type Error = Error;

    type SerializeSeq = Impossible<(&'static str, i32), Error>;
    type SerializeTuple = Impossible<(&'static str, i32), Error>;
    type SerializeTupleStruct = Impossible<(&'static str, i32), Error>;
    type SerializeTupleVariant = Impossible<(&'static str, i32), Error>;
    type SerializeMap = Impossible<(&'static str, i32), Error>;
    type SerializeStruct = Impossible<(&'static str, i32), Error>;
    type SerializeStructVariant = Impossible<(&'static str, i32), Error>;

    fn serialize_bool(self, _v: bool) -> Type {
        Ok(("bool", 1))
    }

    fn serialize_i8(self, _v: i8) -> Type {
        Ok(("char", 1))
    }

    fn serialize_i16(self, _v: i16) -> Type {
        Ok(("short", 2))
    }

    fn serialize_i32(self, _v: i32) -> Type {
        Ok(("int", 4))
    }

    fn serialize_i64(self, _v: i64) -> Type {
        Ok(("long long", 8))
    }

    fn serialize_u8(self, _v: u8) -> Type {
        Ok(("unsigned char", 1))
    }

    fn serialize_u16(self, _v: u16) -> Type {
        Ok(("unsigned short", 2))
    }

    fn serialize_u32(self, _v: u32) -> Type {
        Ok(("unsigned", 4))
    }

    fn serialize_u64(self, _v: u64) -> Type {
        Ok(("unsigned long long", 8))
    }

    fn serialize_f32(self, _v: f32) -> Type {
        Ok(("float", 4))
    }

    fn serialize_f64(self, _v: f64) -> Type {
        Ok(("double", 8))
    }

    fn serialize_str(self, _v: &str) -> Type {
        Ok(("string", -1))
    }

    unsupported! { Type;
        serialize_char(char), serialize_bytes(&[u8]), serialize_none(), serialize_unit(),
        serialize_unit_struct(&'static str),
        serialize_unit_variant(&'static str, u32, &'static str),
    }

    fn serialize_some<T>(self, _value: &T) -> Type
    where
        T: ?Sized + Serialize,
    {
        Err(Error::Unsupported("option"))
    }

    fn serialize_newtype_struct<T>(self, name: &'static str, value: &T) -> Type
    where
        T: ?Sized + Serialize,
    {
        let (_, size) = value.serialize(FieldType)?;
        Ok((type_alias(name), size))
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Type
    where
        T: ?Sized + Serialize,
    {
        Err(Error::Unsupported("enum"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::Unsupported("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::Unsupported("tuple struct"))
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
        Err(Error::Unsupported("nested struct"))
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

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Serialize;

    #[derive(Serialize, Default)]
    struct OpID(u64);

    #[derive(Serialize, Default)]
    struct Timestamp(u64);

    #[derive(Serialize, Default)]
    struct Sample {
        op_id: OpID,
        stop: Timestamp,
        overwrite: bool,
        #[serde(skip)]
        _waits: Vec<u32>,
        name: String,
    }

    #[test]
    fn test_format_line() {
        let format = record_format(18, "Sample", &Sample::default()).unwrap();
        assert_eq!(format.fields.len(), 4);
        assert_eq!(
            format.to_string(),
            "Sample {id:18, op_id:UniqueID:8, stop:timestamp_t:8, overwrite:bool:1, name:string:-1}"
        );
    }

    #[test]
    fn test_rejects_non_struct() {
        assert!(record_format(1, "Bad", &5u32).is_err());
    }
}
