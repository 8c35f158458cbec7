//! Bounded tail-of-file reader
//!
//! `/api/logs` must never load a whole log file into memory. This reader
//! seeks to the end and walks backwards in fixed-size chunks until it has
//! seen the requested number of line breaks, so the allocation is bounded
//! by the tail itself plus one chunk.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Chunk size for backward reads. Tail memory is O(requested lines) + this.
const CHUNK_SIZE: u64 = 8 * 1024;

/// Return the last `n` lines of the file at `path`.
///
/// Lines are returned oldest-first, without trailing newlines. A file with
/// fewer than `n` lines returns all of them.
pub fn tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(Vec::new());
    }

    // Accumulated tail bytes, grown at the front chunk by chunk.
    let mut tail: Vec<u8> = Vec::new();
    let mut pos = len;

    while pos > 0 {
        let chunk_len = CHUNK_SIZE.min(pos);
        pos -= chunk_len;
        file.seek(SeekFrom::Start(pos))?;

        let mut chunk = vec![0u8; chunk_len as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        // Count complete lines; a trailing newline terminates a line but
        // does not start a new one.
        let mut newlines = 0usize;
        for (i, b) in tail.iter().enumerate() {
            if *b == b'\n' && i + 1 < tail.len() {
                newlines += 1;
            }
        }
        if newlines >= n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&tail);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    // A trailing newline leaves one empty piece at the end; it is not a line.
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(lines: usize, line_len: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let mut f = File::create(&path).unwrap();
        for i in 0..lines {
            writeln!(f, "line-{:05} {}", i, "x".repeat(line_len)).unwrap();
        }
        (dir, path)
    }

    #[test]
    fn returns_exactly_n_lines_from_large_file() {
        // ~101 KB: 1000 lines of ~101 bytes each
        let (_dir, path) = write_file(1000, 90);
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.len() > 100_000);

        let lines = tail_lines(&path, 5).unwrap();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("line-00995"));
        assert!(lines[4].starts_with("line-00999"));
    }

    #[test]
    fn short_file_returns_everything() {
        let (_dir, path) = write_file(3, 10);
        let lines = tail_lines(&path, 10).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("line-00000"));
    }

    #[test]
    fn empty_file_and_zero_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.log");
        File::create(&path).unwrap();
        assert!(tail_lines(&path, 5).unwrap().is_empty());

        let (_dir2, path2) = write_file(3, 10);
        assert!(tail_lines(&path2, 0).unwrap().is_empty());
    }

    #[test]
    fn handles_file_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nt.log");
        let mut f = File::create(&path).unwrap();
        write!(f, "a\nb\nc").unwrap();
        let lines = tail_lines(&path, 2).unwrap();
        assert_eq!(lines, vec!["b".to_string(), "c".to_string()]);
    }
}
