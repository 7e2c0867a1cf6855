//! Outbound side of the transport boundary.
//!
//! The radio itself lives outside this crate. The core only needs somewhere to
//! write command frames and OAD packets, and a way to ask for a reconnection.

use std::io::{self, Write};

/// Destination for assembled command frames.
pub trait CommandSink: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<W: Write + Send> CommandSink for W {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }
}

/// Link used by the firmware updater.
///
/// Both calls only start the operation; the outcome comes back as an
/// [`crate::oad::OadEvent`] (write acknowledged, reconnected, ...).
pub trait OadLink: Send {
    fn write_packet(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn request_reconnect(&mut self, attempt: u32) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_writer_is_a_sink() {
        let mut buf: Vec<u8> = Vec::new();
        buf.send(&[1, 2, 3]).unwrap();
        buf.send(&[4]).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }
}
