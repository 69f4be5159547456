// Jackson Coxson

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    FileOpen = 0x0d,
    FileOpenRes = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileClose = 0x14,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Status),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::ReadDir),
            0x08 => Ok(Self::RemovePath),
            0x09 => Ok(Self::MakeDir),
            0x0a => Ok(Self::GetFileInfo),
            0x0d => Ok(Self::FileOpen),
            0x0e => Ok(Self::FileOpenRes),
            0x0f => Ok(Self::Read),
            0x10 => Ok(Self::Write),
            0x14 => Ok(Self::FileClose),
            _ => Err(()),
        }
    }
}

/// Open mode bit for reading
pub const AFC_MODE_READ: u64 = 0x1;
/// Open mode bit for writing
pub const AFC_MODE_WRITE: u64 = 0x2;

/// Translates an fopen-like flag string into AFC mode bits.
/// A `w` anywhere in the flags wins over `r`.
pub fn mode_from_flags(flags: &str) -> u64 {
    if flags.contains('w') {
        AFC_MODE_WRITE
    } else {
        AFC_MODE_READ
    }
}
