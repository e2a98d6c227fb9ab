//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Fill as much of `buf` as possible, like `read_exact`, but unlike
    /// `read_exact`, is forgiving of unexpected EOF.
    ///
    /// Returns the number of bytes actually placed in `buf`; a return value
    /// shorter than `buf.len()` means EOF was reached.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
        }
        Ok(cursor)
    }
}

#[test]
fn test_read_full() -> io::Result<()> {
    let mut buf = [0u8; 4];
    assert_eq!(io::repeat(0xAA).read_full(&mut buf)?, 4);
    assert_eq!(buf, [0xAA; 4]);

    let mut short = &[1u8, 2, 3][..];
    assert_eq!(short.read_full(&mut buf)?, 3);
    assert_eq!(&buf[..3], &[1, 2, 3]);

    assert_eq!(io::empty().read_full(&mut buf)?, 0);
    Ok(())
}
