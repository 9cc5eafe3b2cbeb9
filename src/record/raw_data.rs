//! A byte view over ring-buffer data that may wrap around the buffer end.

use std::fmt;
use std::io::{Error, ErrorKind, Result};

use byteorder::ByteOrder;

/// Raw record bytes, either contiguous or split across the ring wrap.
#[derive(Clone, Copy)]
pub enum RawData<'a> {
    Single(&'a [u8]),
    Split(&'a [u8], &'a [u8]),
}

impl<'a> RawData<'a> {
    pub fn empty() -> Self {
        RawData::Single(&[])
    }

    pub fn len(&self) -> usize {
        match self {
            RawData::Single(b) => b.len(),
            RawData::Split(l, r) => l.len() + r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16<T: ByteOrder>(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(T::read_u16(&buf))
    }

    pub fn read_u32<T: ByteOrder>(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(T::read_u32(&buf))
    }

    pub fn read_i32<T: ByteOrder>(&mut self) -> Result<i32> {
        Ok(self.read_u32::<T>()? as i32)
    }

    pub fn read_u64<T: ByteOrder>(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(T::read_u64(&buf))
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.len() {
            return Err(Error::from(ErrorKind::UnexpectedEof));
        }
        match *self {
            RawData::Single(b) => {
                out.copy_from_slice(&b[..out.len()]);
                *self = RawData::Single(&b[out.len()..]);
            }
            RawData::Split(l, r) => {
                if out.len() <= l.len() {
                    out.copy_from_slice(&l[..out.len()]);
                    *self = if out.len() == l.len() {
                        RawData::Single(r)
                    } else {
                        RawData::Split(&l[out.len()..], r)
                    };
                } else {
                    let (first, second) = out.split_at_mut(l.len());
                    first.copy_from_slice(l);
                    second.copy_from_slice(&r[..second.len()]);
                    *self = RawData::Single(&r[second.len()..]);
                }
            }
        }
        Ok(())
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(Error::from(ErrorKind::UnexpectedEof));
        }
        match *self {
            RawData::Single(b) => *self = RawData::Single(&b[n..]),
            RawData::Split(l, r) => {
                if n < l.len() {
                    *self = RawData::Split(&l[n..], r);
                } else {
                    *self = RawData::Single(&r[n - l.len()..]);
                }
            }
        }
        Ok(())
    }

    /// Read a NUL-terminated string, consuming up to and including the
    /// terminator; returns the bytes before it.
    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        let pos = match *self {
            RawData::Single(b) => memchr::memchr(0, b),
            RawData::Split(l, r) => {
                memchr::memchr(0, l).or_else(|| memchr::memchr(0, r).map(|p| l.len() + p))
            }
        };
        let pos = pos.ok_or_else(|| Error::from(ErrorKind::UnexpectedEof))?;
        let out = self.read_vec(pos)?;
        self.skip(1)?;
        Ok(out)
    }

    pub fn to_vec(self) -> Vec<u8> {
        match self {
            RawData::Single(b) => b.to_vec(),
            RawData::Split(l, r) => {
                let mut v = Vec::with_capacity(l.len() + r.len());
                v.extend_from_slice(l);
                v.extend_from_slice(r);
                v
            }
        }
    }
}

impl fmt::Debug for RawData<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "RawData({} bytes)", self.len())
    }
}

impl<'a> From<&'a [u8]> for RawData<'a> {
    fn from(b: &'a [u8]) -> Self {
        RawData::Single(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::LittleEndian;

    #[test]
    fn reads_across_the_split() {
        let left = [1u8, 2, 3];
        let right = [4u8, 5, 6, 7, 8, 9];
        let mut data = RawData::Split(&left, &right);
        assert_eq!(data.len(), 9);
        assert_eq!(data.read_u16::<LittleEndian>().unwrap(), 0x0201);
        assert_eq!(data.read_u32::<LittleEndian>().unwrap(), 0x06050403);
        assert_eq!(data.read_u8().unwrap(), 7);
        assert_eq!(data.len(), 2);
        assert!(data.read_u32::<LittleEndian>().is_err());
    }

    #[test]
    fn string_spanning_the_split() {
        let left = b"hel";
        let right = b"lo\0rest";
        let mut data = RawData::Split(&left[..], &right[..]);
        assert_eq!(data.read_string().unwrap(), b"hello");
        assert_eq!(data.to_vec(), b"rest");
    }

    #[test]
    fn skip_and_eof() {
        let bytes = [0u8; 4];
        let mut data = RawData::Single(&bytes);
        assert!(data.skip(5).is_err());
        assert!(data.skip(4).is_ok());
        assert!(data.read_u8().is_err());
    }
}
