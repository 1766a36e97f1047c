use std::fs;
use std::io;
use std::path::Path;

use crate::net::ContainerId;

/// Extracts the container short-ID from one cgroup line, if the line
/// belongs to a container cgroup.
///
/// The cgroup path is the third colon-separated field. After stripping an
/// optional `.scope` suffix, the trailing 65 characters must be `/` or `-`
/// followed by a 64-character lowercase hex container ID; the first 12 hex
/// characters form the short ID. Paths whose remainder ends in `-conmon`
/// belong to an OCI monitor process, not the container itself.
pub(crate) fn extract_container_id(line: &str) -> Option<ContainerId> {
    let path = line.splitn(3, ':').nth(2)?;
    if !path.is_ascii() {
        return None;
    }
    let path = path.strip_suffix(".scope").unwrap_or(path);
    if path.len() < 65 {
        return None;
    }

    let (prefix, tail) = path.split_at(path.len() - 65);
    let sep = tail.as_bytes()[0];
    if sep != b'/' && sep != b'-' {
        return None;
    }
    let id = &tail[1..];
    if !id
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    if prefix.ends_with("-conmon") {
        return None;
    }

    id[..12].parse().ok()
}

/// Reads `<pid>/cgroup` and returns the container short-ID of the process,
/// or `None` for non-container processes.
pub(crate) fn read_container_id(pid_dir: &Path) -> io::Result<Option<ContainerId>> {
    let content = fs::read_to_string(pid_dir.join("cgroup"))?;
    Ok(content.lines().find_map(extract_container_id))
}
