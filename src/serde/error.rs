use std;
use std::fmt::{self, Display};

use nom;

use serde::{de, ser};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Message(String),

    Nom(String),

    Unsupported(&'static str),

    TrailingBytes(usize),
}

impl ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        Error::Nom(format!("{:?}", err.map(|e| e.code)))
    }
}

impl Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Message(msg) => formatter.write_str(msg),
            Error::Nom(msg) => write!(formatter, "malformed input: {}", msg),
            Error::Unsupported(what) => write!(formatter, "{} is not representable", what),
            Error::TrailingBytes(n) => write!(formatter, "{} trailing bytes after record", n),
        }
    }
}

impl std::error::Error for Error {}
