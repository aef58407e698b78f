// Character encodings supported for table files.
use std::fmt;
use std::str::FromStr;

use bstr::ByteSlice;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    pub(crate) fn decode(self, bytes: &[u8]) -> Result<String, Error> {
        match self {
            TextEncoding::Utf8 => bytes.to_str().map(str::to_string).map_err(|err| {
                Error::new(ErrorKind::InvalidValue)
                    .with_message("table file is not valid utf-8")
                    .with_hint("Open the profile with --encoding latin-1 if it predates utf-8.")
                    .with_source(err)
            }),
            TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    pub(crate) fn encode(self, text: &str) -> Result<Vec<u8>, Error> {
        match self {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        Error::new(ErrorKind::InvalidValue)
                            .with_message(format!("character {c:?} cannot be encoded as latin-1"))
                    })
                })
                .collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(TextEncoding::Latin1),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unsupported encoding: {other}"))
                .with_hint("Use utf-8 or latin-1.")),
        }
    }
}
