//! Platform-specific file primitives used by extents
//!
//! - Linux: `fallocate(PUNCH_HOLE | KEEP_SIZE)` and `lseek(SEEK_DATA / SEEK_HOLE)`
//! - other platforms: holes are emulated by writing zeros and the whole file
//!   is reported as data

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

fn to_off(v: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(v).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

/// Deallocate `[offset, offset + len)` without changing the file size.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    let off = to_off(offset)?;
    let len = to_off(len)?;
    // SAFETY: the fd is owned by `file`, which outlives the call.
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            off,
            len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    let file_len = file.metadata()?.len();
    let end = (offset + len).min(file_len);
    let zeros = vec![0u8; 64 * 1024];
    let mut pos = offset;
    while pos < end {
        let n = (end - pos).min(zeros.len() as u64) as usize;
        file.write_all_at(&zeros[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn lseek(file: &File, offset: u64, whence: libc::c_int) -> io::Result<Option<u64>> {
    let off = to_off(offset)?;
    // SAFETY: the fd is owned by `file`; lseek does not touch user memory.
    let ret = unsafe { libc::lseek(file.as_raw_fd(), off, whence) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENXIO) {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(ret as u64))
}

/// Start of the first data region at or after `offset`.
///
/// `None` means there is no data past `offset` (the kernel answered ENXIO).
#[cfg(target_os = "linux")]
pub fn seek_data(file: &File, offset: u64) -> io::Result<Option<u64>> {
    lseek(file, offset, libc::SEEK_DATA)
}

/// Start of the first hole at or after `offset`; EOF counts as a hole.
#[cfg(target_os = "linux")]
pub fn seek_hole(file: &File, offset: u64) -> io::Result<Option<u64>> {
    lseek(file, offset, libc::SEEK_HOLE)
}

#[cfg(not(target_os = "linux"))]
pub fn seek_data(file: &File, offset: u64) -> io::Result<Option<u64>> {
    let len = file.metadata()?.len();
    Ok((offset < len).then_some(offset))
}

#[cfg(not(target_os = "linux"))]
pub fn seek_hole(file: &File, offset: u64) -> io::Result<Option<u64>> {
    let len = file.metadata()?.len();
    Ok((offset < len).then_some(len))
}

/// Returns true if `[offset, offset + len)` holds no data.
pub fn is_range_hole(file: &File, offset: u64, len: u64) -> io::Result<bool> {
    match seek_data(file, offset)? {
        None => Ok(true),
        Some(start) => Ok(start >= offset + len),
    }
}

/// 512-byte sectors allocated on disk for the file
pub fn block_count(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.blocks())
}

/// Bytes actually allocated on disk for the file.
pub fn allocated_bytes(file: &File) -> io::Result<u64> {
    Ok(block_count(file)? * 512)
}

/// Read as much of `buf` as the file holds at `offset`; the rest is zeroed.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf[done..].fill(0);
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    #[test]
    fn test_read_full_at_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("f"))
            .unwrap();
        file.write_all_at(b"abcd", 0).unwrap();

        let mut buf = [0xFFu8; 8];
        let n = read_full_at(&file, &mut buf, 2).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"cd\0\0\0\0\0\0");
    }

    #[test]
    fn test_punch_hole_keeps_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("f"))
            .unwrap();
        file.write_all_at(&vec![7u8; 16384], 0).unwrap();
        punch_hole(&file, 0, 4096).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 16384);

        let mut buf = vec![1u8; 4096];
        read_full_at(&file, &mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        read_full_at(&file, &mut buf, 4096).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_seek_data_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("f"))
            .unwrap();
        file.write_all_at(&[1u8; 4096], 0).unwrap();
        assert_eq!(seek_data(&file, 0).unwrap(), Some(0));
        assert_eq!(seek_data(&file, 8192).unwrap(), None);
        assert!(is_range_hole(&file, 8192, 4096).unwrap());
    }
}
