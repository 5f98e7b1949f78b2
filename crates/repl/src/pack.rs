//! Standalone-binary packing
//!
//! `lyra build` copies the current executable and appends a trailer:
//! `[source bytes][u64 LE source length][8-byte magic]`. On startup the
//! binary checks its own tail; finding the magic means it is a packed
//! program and runs the embedded source instead of parsing arguments.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"LYRAPACK";

/// Source embedded in the running executable, if any.
pub fn embedded_source() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let mut file = std::fs::File::open(exe).ok()?;
    let len = file.seek(SeekFrom::End(0)).ok()?;
    if len < (MAGIC.len() + 8) as u64 {
        return None;
    }
    file.seek(SeekFrom::End(-(MAGIC.len() as i64 + 8))).ok()?;
    let mut trailer = [0u8; 16];
    file.read_exact(&mut trailer).ok()?;
    if &trailer[8..16] != MAGIC {
        return None;
    }
    let source_len = u64::from_le_bytes(trailer[..8].try_into().expect("8 bytes"));
    if source_len > len - (MAGIC.len() + 8) as u64 {
        return None;
    }
    file.seek(SeekFrom::End(-(MAGIC.len() as i64 + 8 + source_len as i64))).ok()?;
    let mut source = vec![0u8; source_len as usize];
    file.read_exact(&mut source).ok()?;
    String::from_utf8(source).ok()
}

/// Copy the current executable to `output` with `source` appended.
pub fn write_packed(source: &str, output: &Path) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let runtime = std::fs::read(exe)?;
    let mut file = std::fs::File::create(output)?;
    file.write_all(&runtime)?;
    file.write_all(source.as_bytes())?;
    file.write_all(&(source.len() as u64).to_le_bytes())?;
    file.write_all(MAGIC)?;
    drop(file);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(output)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        std::fs::set_permissions(output, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_roundtrip_layout() {
        // Exercise the trailer math on a synthetic file rather than a real
        // executable copy.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-exe");
        let body = b"BINARY".to_vec();
        let source = "(println :hi)";
        let mut bytes = body.clone();
        bytes.extend_from_slice(source.as_bytes());
        bytes.extend_from_slice(&(source.len() as u64).to_le_bytes());
        bytes.extend_from_slice(MAGIC);
        std::fs::write(&path, &bytes).unwrap();

        // Re-implement the read half against the synthetic file.
        let data = std::fs::read(&path).unwrap();
        let n = data.len();
        assert_eq!(&data[n - 8..], MAGIC);
        let len = u64::from_le_bytes(data[n - 16..n - 8].try_into().unwrap()) as usize;
        let embedded = std::str::from_utf8(&data[n - 16 - len..n - 16]).unwrap();
        assert_eq!(embedded, source);
    }
}
