//! RESP frame serializer
//!
//! Used by the debugger to write frames directly to the client socket
//! (the forked child owns the connection and replies without going back
//! through the server event loop).

use super::resp::RespFrame;
use crate::error::Result;
use std::io::Write;

/// Serialize a RESP frame to a writer
pub fn serialize_resp_frame<W: Write>(frame: &RespFrame, writer: &mut W) -> Result<()> {
    match frame {
        RespFrame::SimpleString(bytes) => {
            writer.write_all(b"+")?;
            writer.write_all(bytes)?;
            writer.write_all(b"\r\n")?;
        }

        RespFrame::Error(bytes) => {
            writer.write_all(b"-")?;
            writer.write_all(bytes)?;
            writer.write_all(b"\r\n")?;
        }

        RespFrame::Integer(n) => {
            writer.write_all(b":")?;
            writer.write_all(n.to_string().as_bytes())?;
            writer.write_all(b"\r\n")?;
        }

        RespFrame::BulkString(opt) => match opt {
            Some(bytes) => {
                writer.write_all(b"$")?;
                writer.write_all(bytes.len().to_string().as_bytes())?;
                writer.write_all(b"\r\n")?;
                writer.write_all(bytes)?;
                writer.write_all(b"\r\n")?;
            }
            None => {
                writer.write_all(b"$-1\r\n")?;
            }
        },

        RespFrame::Array(opt) => match opt {
            Some(frames) => {
                writer.write_all(b"*")?;
                writer.write_all(frames.len().to_string().as_bytes())?;
                writer.write_all(b"\r\n")?;
                for frame in frames {
                    serialize_resp_frame(frame, writer)?;
                }
            }
            None => {
                writer.write_all(b"*-1\r\n")?;
            }
        },

        RespFrame::Null => {
            writer.write_all(b"_\r\n")?;
        }

        RespFrame::Boolean(b) => {
            writer.write_all(if *b { b"#t\r\n" } else { b"#f\r\n" })?;
        }

        RespFrame::Double(f) => {
            writer.write_all(b",")?;
            writer.write_all(f.to_string().as_bytes())?;
            writer.write_all(b"\r\n")?;
        }

        RespFrame::Map(pairs) => {
            writer.write_all(b"%")?;
            writer.write_all(pairs.len().to_string().as_bytes())?;
            writer.write_all(b"\r\n")?;
            for (key, value) in pairs {
                serialize_resp_frame(key, writer)?;
                serialize_resp_frame(value, writer)?;
            }
        }

        RespFrame::Set(elements) => {
            writer.write_all(b"~")?;
            writer.write_all(elements.len().to_string().as_bytes())?;
            writer.write_all(b"\r\n")?;
            for element in elements {
                serialize_resp_frame(element, writer)?;
            }
        }
    }

    Ok(())
}

/// Serialize a RESP frame to a byte vector
pub fn serialize_to_vec(frame: &RespFrame) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    serialize_resp_frame(frame, &mut buf)?;
    Ok(buf)
}
