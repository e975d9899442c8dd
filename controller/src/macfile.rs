//! Permit-list file handling: one MAC per line, append-only.

use common::MacAddr;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Read the permit list. Malformed lines are skipped with a warning so a
/// hand-edited file cannot keep the daemon from starting.
pub fn load(path: &Path) -> io::Result<Vec<MacAddr>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut macs = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<MacAddr>() {
            Ok(mac) => macs.push(mac),
            Err(_) => tracing::warn!("skipping malformed permit list line: {:?}", line),
        }
    }
    Ok(macs)
}

pub fn append(path: &Path, mac: MacAddr) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mac_list");

        assert!(load(&path).unwrap().is_empty());

        append(&path, "cc:00:00:00:00:09".parse().unwrap()).unwrap();
        append(&path, "cc:00:00:00:00:0a".parse().unwrap()).unwrap();

        let macs = load(&path).unwrap();
        assert_eq!(macs.len(), 2);
        assert_eq!(macs[1].to_string(), "CC:00:00:00:00:0A");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with("CC:00:00:00:00:0A\n"));
    }

    #[test]
    fn test_load_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mac_list");
        std::fs::write(&path, "cc:00:00:00:00:01\nnot-a-mac\n\ncc:00:00:00:00:02\n").unwrap();

        let macs = load(&path).unwrap();
        assert_eq!(macs.len(), 2);
    }
}
