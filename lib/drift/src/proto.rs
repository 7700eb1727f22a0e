//! The snowcast control protocol: a minimal framed binary protocol over TCP.
//! All multi-byte integers are big-endian. Commands flow client to server,
//! replies flow server to client; both start with a one-byte tag.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;

/// Deadline applied to every receive. A peer that sends nothing within this
/// window cannot wedge a worker.
pub const READ_DEADLINE: Duration = Duration::from_millis(100);

const TAG_HELLO: u8 = 0;
const TAG_SET_STATION: u8 = 1;

const TAG_WELCOME: u8 = 0;
const TAG_ANNOUNCE: u8 = 1;
const TAG_INVALID: u8 = 2;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("peer closed the connection")]
    Closed,
    #[error("read deadline elapsed")]
    Timeout,
    #[error("message truncated by peer")]
    Truncated,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for ProtoError {
    fn from(err: io::Error) -> ProtoError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtoError::Timeout,
            io::ErrorKind::UnexpectedEof => ProtoError::Truncated,
            _ => ProtoError::Io(err),
        }
    }
}

pub type ProtoResult<T> = Result<T, ProtoError>;

/// A message sent by a client.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Hello { udp_port: u16 },
    SetStation { station: u16 },
}

/// A message sent by the server.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reply {
    Welcome { stations: u16 },
    Announce(String),
    InvalidCommand(String),
}

/// Reads one command. The first read distinguishes a clean close from a
/// mid-message failure, so a departed client can be dropped quietly.
pub fn read_command<R: Read>(reader: &mut R) -> ProtoResult<Command> {
    match read_tag(reader)? {
        TAG_HELLO => Ok(Command::Hello {
            udp_port: reader.read_u16::<BigEndian>()?,
        }),
        TAG_SET_STATION => Ok(Command::SetStation {
            station: reader.read_u16::<BigEndian>()?,
        }),
        other => Err(ProtoError::UnknownTag(other)),
    }
}

/// Reads one reply.
pub fn read_reply<R: Read>(reader: &mut R) -> ProtoResult<Reply> {
    match read_tag(reader)? {
        TAG_WELCOME => Ok(Reply::Welcome {
            stations: reader.read_u16::<BigEndian>()?,
        }),
        TAG_ANNOUNCE => Ok(Reply::Announce(read_string(reader)?)),
        TAG_INVALID => Ok(Reply::InvalidCommand(read_string(reader)?)),
        other => Err(ProtoError::UnknownTag(other)),
    }
}

pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> ProtoResult<()> {
    match *command {
        Command::Hello { udp_port } => {
            writer.write_u8(TAG_HELLO)?;
            writer.write_u16::<BigEndian>(udp_port)?;
        }
        Command::SetStation { station } => {
            writer.write_u8(TAG_SET_STATION)?;
            writer.write_u16::<BigEndian>(station)?;
        }
    }
    Ok(())
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &Reply) -> ProtoResult<()> {
    match reply {
        Reply::Welcome { stations } => {
            writer.write_u8(TAG_WELCOME)?;
            writer.write_u16::<BigEndian>(*stations)?;
        }
        Reply::Announce(text) => {
            writer.write_u8(TAG_ANNOUNCE)?;
            write_string(writer, text)?;
        }
        Reply::InvalidCommand(text) => {
            writer.write_u8(TAG_INVALID)?;
            write_string(writer, text)?;
        }
    }
    Ok(())
}

/// Receives one command from a client socket under the read deadline.
pub fn recv_command(stream: &TcpStream) -> ProtoResult<Command> {
    stream.set_read_timeout(Some(READ_DEADLINE))?;
    let mut reader = stream;
    read_command(&mut reader)
}

/// Receives one reply from a server socket under the read deadline.
pub fn recv_reply(stream: &TcpStream) -> ProtoResult<Reply> {
    stream.set_read_timeout(Some(READ_DEADLINE))?;
    let mut reader = stream;
    read_reply(&mut reader)
}

pub fn send_command(stream: &TcpStream, command: &Command) -> ProtoResult<()> {
    let mut writer = stream;
    write_command(&mut writer, command)
}

pub fn send_reply(stream: &TcpStream, reply: &Reply) -> ProtoResult<()> {
    let mut writer = stream;
    write_reply(&mut writer, reply)
}

fn read_tag<R: Read>(reader: &mut R) -> ProtoResult<u8> {
    let mut tag = [0u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Err(ProtoError::Closed),
            Ok(_) => return Ok(tag[0]),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_string<R: Read>(reader: &mut R) -> ProtoResult<String> {
    let size = reader.read_u8()? as usize;
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reply strings carry a one-byte length; anything longer is cut off.
fn write_string<W: Write>(writer: &mut W, text: &str) -> ProtoResult<()> {
    let bytes = text.as_bytes();
    let size = bytes.len().min(u8::MAX as usize);
    writer.write_u8(size as u8)?;
    writer.write_all(&bytes[..size])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn command_roundtrip(command: Command) -> Command {
        let mut wire = Vec::new();
        write_command(&mut wire, &command).unwrap();
        read_command(&mut Cursor::new(wire)).unwrap()
    }

    fn reply_roundtrip(reply: Reply) -> Reply {
        let mut wire = Vec::new();
        write_reply(&mut wire, &reply).unwrap();
        read_reply(&mut Cursor::new(wire)).unwrap()
    }

    #[test]
    fn test_command_roundtrips() {
        let hello = Command::Hello { udp_port: 8080 };
        assert_eq!(command_roundtrip(hello), hello);

        let tune = Command::SetStation { station: 5 };
        assert_eq!(command_roundtrip(tune), tune);
    }

    #[test]
    fn test_reply_roundtrips() {
        let welcome = Reply::Welcome { stations: 258 };
        assert_eq!(reply_roundtrip(welcome.clone()), welcome);

        let announce = Reply::Announce("Beethoven's 5th symphony".to_string());
        assert_eq!(reply_roundtrip(announce.clone()), announce);

        let invalid = Reply::InvalidCommand("incorrect command!".to_string());
        assert_eq!(reply_roundtrip(invalid.clone()), invalid);
    }

    #[test]
    fn test_reply_string_length_bounds() {
        let empty = Reply::Announce(String::new());
        assert_eq!(reply_roundtrip(empty.clone()), empty);

        let max = Reply::Announce("x".repeat(255));
        assert_eq!(reply_roundtrip(max.clone()), max);
    }

    #[test]
    fn test_overlong_reply_string_is_cut_off() {
        let oversized = Reply::InvalidCommand("y".repeat(300));
        match reply_roundtrip(oversized) {
            Reply::InvalidCommand(text) => assert_eq!(text, "y".repeat(255)),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_hello_wire_layout() {
        let mut wire = Vec::new();
        write_command(&mut wire, &Command::Hello { udp_port: 8080 }).unwrap();
        assert_eq!(wire, [0x00, 0x1f, 0x90]);
    }

    #[test]
    fn test_welcome_wire_layout() {
        let mut wire = Vec::new();
        write_reply(&mut wire, &Reply::Welcome { stations: 1 }).unwrap();
        assert_eq!(wire, [0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_unknown_tags_are_rejected() {
        match read_command(&mut Cursor::new(vec![9u8, 0, 0])) {
            Err(ProtoError::UnknownTag(9)) => (),
            other => panic!("unexpected result {:?}", other),
        }

        match read_reply(&mut Cursor::new(vec![10u8, 0, 0])) {
            Err(ProtoError::UnknownTag(10)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_fresh_close_is_distinct_from_truncation() {
        match read_command(&mut Cursor::new(Vec::new())) {
            Err(ProtoError::Closed) => (),
            other => panic!("unexpected result {:?}", other),
        }

        // Tag delivered but the body cut short.
        match read_command(&mut Cursor::new(vec![TAG_SET_STATION])) {
            Err(ProtoError::Truncated) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    struct StalledReader;

    impl Read for StalledReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_deadline_maps_to_timeout() {
        match read_command(&mut StalledReader) {
            Err(ProtoError::Timeout) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
