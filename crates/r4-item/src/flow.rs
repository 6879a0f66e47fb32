//! Flows: the byte sources and destinations of item reads and writes.
//!
//! A caller declares whether its buffer is kernel memory (a plain slice,
//! copies cannot fail) or user memory (copies go through [`UserBuffer`] and
//! may fault). Faults are returned to the caller, never retried here.

use r4_error::{R4Error, Result};

/// Memory owned by the requesting process.
pub trait UserBuffer: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the buffer.
    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into the buffer at `offset`.
    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<()>;
}

/// Source of bytes for paste, overwrite and flow insert.
#[derive(Clone, Copy)]
pub enum Flow<'a> {
    Kernel(&'a [u8]),
    User(&'a dyn UserBuffer),
    /// `n` zero bytes: a hole.
    Hole(usize),
}

impl std::fmt::Debug for Flow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel(data) => write!(f, "Flow::Kernel({} bytes)", data.len()),
            Self::User(buf) => write!(f, "Flow::User({} bytes)", buf.len()),
            Self::Hole(len) => write!(f, "Flow::Hole({len})"),
        }
    }
}

impl Flow<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Kernel(data) => data.len(),
            Self::User(buf) => buf.len(),
            Self::Hole(len) => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        matches!(self, Self::Hole(_))
    }

    /// Fill `dst` with the flow bytes starting at `offset`.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(dst.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                R4Error::InvariantViolation(format!(
                    "flow read {offset}+{} past flow length {}",
                    dst.len(),
                    self.len()
                ))
            })?;
        match self {
            Self::Kernel(data) => dst.copy_from_slice(&data[offset..end]),
            Self::User(buf) => buf.copy_from_user(offset, dst)?,
            Self::Hole(_) => dst.fill(0),
        }
        Ok(())
    }

    /// Owned copy of `len` flow bytes at `offset`.
    pub fn to_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; len];
        self.copy_out(offset, &mut out)?;
        Ok(out)
    }
}

/// Destination of item reads.
pub enum FlowDest<'a> {
    Kernel(&'a mut [u8]),
    User(&'a mut dyn UserBuffer),
}

impl FlowDest<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Kernel(data) => data.len(),
            Self::User(buf) => buf.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `src` at `offset`.
    pub fn put(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let len = self.len();
        let end = offset
            .checked_add(src.len())
            .filter(|end| *end <= len)
            .ok_or_else(|| {
                R4Error::InvariantViolation(format!(
                    "flow write {offset}+{} past destination length {len}",
                    src.len()
                ))
            })?;
        match self {
            Self::Kernel(data) => data[offset..end].copy_from_slice(src),
            Self::User(buf) => buf.copy_to_user(offset, src)?,
        }
        Ok(())
    }
}

/// User buffer backed by a vector.
///
/// `fault_at` models an unmapped address: any copy touching that byte or
/// a later one fails with [`R4Error::Fault`].
#[derive(Debug, Clone, Default)]
pub struct UserVec {
    bytes: Vec<u8>,
    fault_at: Option<usize>,
}

impl UserVec {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fault_at: None,
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    #[must_use]
    pub fn with_fault_at(mut self, offset: usize) -> Self {
        self.fault_at = Some(offset);
        self
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match self.fault_at {
            Some(bad) if offset + len > bad => Err(R4Error::Fault(format!(
                "user address {bad} not mapped"
            ))),
            _ => Ok(()),
        }
    }
}

impl UserBuffer for UserVec {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        self.bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hole_reads_as_zeroes() {
        let mut dst = [7_u8; 4];
        Flow::Hole(10).copy_out(3, &mut dst).unwrap();
        assert_eq!(dst, [0; 4]);
    }

    #[test]
    fn copy_out_past_end_is_rejected() {
        let mut dst = [0_u8; 4];
        assert!(matches!(
            Flow::Kernel(b"abc").copy_out(0, &mut dst),
            Err(R4Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn user_fault_surfaces() {
        let user = UserVec::new(b"abcdef".to_vec()).with_fault_at(4);
        let flow = Flow::User(&user);
        assert_eq!(flow.to_vec(0, 4).unwrap(), b"abcd");
        assert!(matches!(flow.to_vec(2, 3), Err(R4Error::Fault(_))));
    }

    #[test]
    fn dest_put_writes_user_memory() {
        let mut user = UserVec::zeroed(4);
        {
            let mut dest = FlowDest::User(&mut user);
            dest.put(1, b"xy").unwrap();
            assert!(dest.put(3, b"zz").is_err());
        }
        assert_eq!(user.as_slice(), b"\0xy\0");
    }
}
