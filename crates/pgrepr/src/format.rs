use crate::error::PgReprError;

/// Per-value wire format negotiated in Bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

impl Format {
    pub fn as_i16(&self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}

impl TryFrom<i16> for Format {
    type Error = PgReprError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgReprError::InvalidFormatCode(other)),
        }
    }
}
