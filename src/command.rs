use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;
use std::fmt;

/// A logical command, a name followed by binary safe arguments.
///
/// Commands are sent to the server as RESP arrays of bulk strings:
/// `*<n>\r\n$<len>\r\n<arg>\r\n...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<Bytes>) -> Command {
        Command {
            parts: vec![name.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Command {
        self.parts.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.parts.extend(args.into_iter().map(Into::into));
        self
    }

    /// Splits a whitespace separated line such as `SET k1 v1` into a command.
    pub fn parse_line(line: &str) -> Option<Command> {
        let mut words = line.split_whitespace();
        let name = words.next()?;

        Some(Command::new(name.to_string()).args(words.map(|w| w.to_string())))
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.parts[0]).to_uppercase()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(b'*');
        buf.put_slice(self.parts.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        for part in &self.parts {
            buf.put_u8(b'$');
            buf.put_slice(part.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(part);
            buf.put_slice(b"\r\n");
        }
    }

    fn encoded_len(&self) -> usize {
        // Prefix and length digits are small, 16 bytes of slack per part covers them.
        16 + self.parts.iter().map(|p| p.len() + 16).sum::<usize>()
    }

    /// Starts a transaction.
    pub fn multi() -> Command {
        Command::new("MULTI")
    }

    /// Executes the queued commands of a transaction.
    pub fn exec() -> Command {
        Command::new("EXEC")
    }

    /// Throws away the queued commands of a transaction.
    pub fn discard() -> Command {
        Command::new("DISCARD")
    }

    /// Marks keys for optimistic locking, the next EXEC fails if any of them changes.
    pub fn watch<I, K>(keys: I) -> Command
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        Command::new("WATCH").args(keys)
    }

    pub fn unwatch() -> Command {
        Command::new("UNWATCH")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.parts
                .iter()
                .map(|p| String::from_utf8_lossy(p))
                .join(" ")
        )
    }
}

/// Well-known status replies used by the transaction framing.
pub mod reply {
    pub const OK: &str = "OK";
    pub const QUEUED: &str = "QUEUED";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_set_command() {
        let cmd = Command::new("SET").arg("k1").arg("v1");

        assert_eq!(
            cmd.encode(),
            Bytes::from("*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n")
        );
    }

    #[test]
    fn encode_binary_argument() {
        let cmd = Command::new("SET").arg("k").arg(Bytes::from(&b"a\r\nb"[..]));

        assert_eq!(
            cmd.encode(),
            Bytes::from("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\na\r\nb\r\n")
        );
    }

    #[test]
    fn transaction_framing_commands() {
        assert_eq!(Command::multi().encode(), Bytes::from("*1\r\n$5\r\nMULTI\r\n"));
        assert_eq!(Command::exec().encode(), Bytes::from("*1\r\n$4\r\nEXEC\r\n"));
        assert_eq!(
            Command::discard().encode(),
            Bytes::from("*1\r\n$7\r\nDISCARD\r\n")
        );
        assert_eq!(
            Command::watch(["a", "b"]).encode(),
            Bytes::from("*3\r\n$5\r\nWATCH\r\n$1\r\na\r\n$1\r\nb\r\n")
        );
    }

    #[test]
    fn parse_line() {
        let cmd = Command::parse_line("  incr   counter ").unwrap();

        assert_eq!(cmd, Command::new("incr").arg("counter"));
        assert_eq!(cmd.name(), "INCR");
        assert_eq!(cmd.to_string(), "incr counter");
        assert!(Command::parse_line("   ").is_none());
    }
}
