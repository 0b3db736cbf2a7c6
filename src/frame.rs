// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use std::str;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    #[error("unsupported frame data type: {0}")]
    UnsupportedDataType(char),
    #[error("invalid frame format; {0}")]
    Invalid(String),
}

/// A decoded reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => Ok(Frame::Simple(get_line(src)?.to_string())),
            DataType::SimpleError => Ok(Frame::Error(get_line(src)?.to_string())),
            DataType::Integer => Ok(Frame::Integer(get_decimal(src)?)),
            // $<length>\r\n<data>\r\n
            DataType::BulkString => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Bulk(get_sized(src, length)?)),
            },
            // !<length>\r\n<error>\r\n
            DataType::BulkError => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => {
                    let msg = get_sized(src, length)?;
                    Ok(Frame::Error(String::from_utf8_lossy(&msg).into_owned()))
                }
            },
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => match get_length(src)? {
                // A nil array, this is how EXEC reports an aborted transaction.
                None => Ok(Frame::Null),
                Some(length) => {
                    let mut frames = Vec::with_capacity(length.min(1024));
                    for _ in 0..length {
                        frames.push(Self::parse(src)?);
                    }
                    Ok(Frame::Array(frames))
                }
            },
            DataType::Null => {
                get_line(src)?;
                Ok(Frame::Null)
            }
            data_type => Err(Error::UnsupportedDataType(u8::from(data_type) as char)),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, bytes: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Error(s) => {
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Integer(i) => {
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(i.to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Bulk(data) => {
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(data.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            // RESP2 null bulk string, understood by every server version.
            Frame::Null => bytes.extend_from_slice(b"$-1\r\n"),
            Frame::Array(arr) => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(arr.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in arr {
                    frame.write_to(bytes);
                }
            }
        }
    }

    /// Short name of the frame type, used in protocol diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk string",
            Frame::Null => "null",
            Frame::Array(_) => "array",
        }
    }

    pub fn is_status(&self, word: &str) -> bool {
        matches!(self, Frame::Simple(s) if s == word)
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "(nil)"),
            Frame::Array(arr) => {
                write!(f, "*{}[", arr.len())?;
                for (i, frame) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", frame)?;
                }
                write!(f, "]")
            }
        }
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a str, Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    str::from_utf8(&buf[start..end]).map_err(|_| Error::Invalid("line is not UTF-8".to_string()))
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = get_line(src)?;
    line.parse::<i64>()
        .map_err(|_| Error::Invalid(format!("{:?} is not an integer", line)))
}

/// Reads a length prefix, `-1` means nil.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    match get_decimal(src)? {
        -1 => Ok(None),
        n if n < 0 => Err(Error::Invalid(format!("negative length {}", n))),
        n => Ok(Some(n as usize)),
    }
}

fn get_sized(src: &mut Cursor<&[u8]>, length: usize) -> Result<Bytes, Error> {
    if src.remaining() < length + CRLF.len() {
        return Err(Error::Incomplete);
    }

    let start = src.position() as usize;
    let data = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
    src.advance(length);

    if src.chunk()[..CRLF.len()] != CRLF[..] {
        return Err(Error::Invalid("bulk data is not CRLF terminated".to_string()));
    }
    src.advance(CRLF.len());

    Ok(data)
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug)]
enum DataType {
    SimpleString,   // '+'
    BulkString,     // '$'
    VerbatimString, // '='
    SimpleError,    // '-'
    BulkError,      // '!'
    Boolean,        // '#'
    Integer,        // ':'
    Double,         // ','
    BigNumber,      // '('
    Array,          // '*'
    Map,            // '%'
    Set,            // '~'
    Push,           // '>'
    Null,           // '_'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'!' => Ok(Self::BulkError),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            b'#' => Ok(Self::Boolean),
            b',' => Ok(Self::Double),
            b'(' => Ok(Self::BigNumber),
            b'=' => Ok(Self::VerbatimString),
            b'%' => Ok(Self::Map),
            b'~' => Ok(Self::Set),
            b'>' => Ok(Self::Push),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::BulkError => b'!',
            DataType::Array => b'*',
            DataType::Null => b'_',
            DataType::Boolean => b'#',
            DataType::Double => b',',
            DataType::BigNumber => b'(',
            DataType::VerbatimString => b'=',
            DataType::Map => b'%',
            DataType::Set => b'~',
            DataType::Push => b'>',
        }
    }
}
