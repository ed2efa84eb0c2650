//! Reading results back out of a slot's output disk.
//!
//! The guest writes a plain tar archive at the start of its pre-allocated
//! output image. Everything in it is untrusted: a missing, truncated or
//! garbled archive degrades to empty streams and an unknown exit code, it is
//! never an error for the caller.
use crate::config::types::TaskStatus;
use crate::core::types::Outcome;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

pub const EXIT_CODE_FILE: &str = "exit_code.txt";
pub const TEST_OUTPUT_FILE: &str = "test_output.txt";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";

const MEMBERS: [&str; 4] = [EXIT_CODE_FILE, TEST_OUTPUT_FILE, STDOUT_FILE, STDERR_FILE];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub test_output: String,
    pub stdout: String,
    pub stderr: String,
}

/// What a slot's notifier receives when a run completes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: Uuid,
    pub slot: usize,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: TaskOutput,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn member_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    name.strip_prefix("./").unwrap_or(&name).to_string()
}

/// The conventional members present in the archive at `image`. Reading stops
/// at the first malformed header; members read before it are kept.
pub fn read_members(image: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut found = BTreeMap::new();
    let file = match File::open(image) {
        Ok(file) => file,
        Err(e) => {
            debug!("Cannot open output image {}: {}", image.display(), e);
            return found;
        }
    };

    let mut archive = tar::Archive::new(file);
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Output image {} is not an archive: {}", image.display(), e);
            return found;
        }
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Stopped reading {}: {}", image.display(), e);
                break;
            }
        };
        let name = match entry.path() {
            Ok(path) => member_name(&path),
            Err(_) => continue,
        };
        if !MEMBERS.contains(&name.as_str()) {
            continue;
        }

        let mut data = Vec::new();
        if let Err(e) = entry.read_to_end(&mut data) {
            debug!("Failed to extract {} from {}: {}", name, image.display(), e);
            break;
        }
        found.insert(name, data);
    }
    found
}

pub fn parse_exit_code(data: &[u8]) -> Option<i32> {
    String::from_utf8_lossy(data).trim().parse().ok()
}

fn stream(members: &BTreeMap<String, Vec<u8>>, name: &str) -> String {
    members
        .get(name)
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .unwrap_or_default()
}

/// Map a race outcome plus the output image onto (status, exit code, streams)
pub fn interpret(outcome: &Outcome, image: &Path) -> (TaskStatus, Option<i32>, TaskOutput) {
    let members = read_members(image);
    let output = TaskOutput {
        test_output: stream(&members, TEST_OUTPUT_FILE),
        stdout: stream(&members, STDOUT_FILE),
        stderr: stream(&members, STDERR_FILE),
    };
    let reported_code = members.get(EXIT_CODE_FILE).and_then(|d| parse_exit_code(d));

    let (status, exit_code) = match outcome {
        Outcome::TimedOut => (TaskStatus::Timeout, None),
        Outcome::Success if reported_code == Some(0) => (TaskStatus::Finished, Some(0)),
        Outcome::Success => (TaskStatus::Failed, reported_code),
        Outcome::Exited { .. } | Outcome::Signaled { .. } | Outcome::Lost => {
            (TaskStatus::Failed, reported_code)
        }
    };
    (status, exit_code, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_image(path: &Path, members: &[(&str, &str)], padding: usize) {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        let mut bytes = builder.into_inner().unwrap();
        bytes.resize(bytes.len() + padding, 0);
        std::fs::File::create(path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();
    }

    #[test]
    fn test_finished_run_with_streams() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("output.tar");
        write_image(
            &image,
            &[
                ("exit_code.txt", "0\n"),
                ("./test_output.txt", "all good"),
                ("stdout.txt", "hello"),
            ],
            64 * 1024,
        );

        let (status, code, output) = interpret(&Outcome::Success, &image);
        assert_eq!(status, TaskStatus::Finished);
        assert_eq!(code, Some(0));
        assert_eq!(output.test_output, "all good");
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "");
    }

    #[test]
    fn test_nonzero_reported_exit_code_fails() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("output.tar");
        write_image(&image, &[("exit_code.txt", "42"), ("test_output.txt", "boom")], 0);

        let (status, code, output) = interpret(&Outcome::Success, &image);
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(code, Some(42));
        assert_eq!(output.test_output, "boom");
    }

    #[test]
    fn test_garbage_image_degrades_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("output.tar");
        std::fs::write(&image, vec![0x5a; 2048]).unwrap();

        let (status, code, output) = interpret(&Outcome::Success, &image);
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(code, None);
        assert_eq!(output, TaskOutput::default());

        let (status, code, _) = interpret(&Outcome::Success, &dir.path().join("missing.tar"));
        assert_eq!((status, code), (TaskStatus::Failed, None));
    }

    #[test]
    fn test_timeout_ignores_exit_code_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("output.tar");
        write_image(&image, &[("exit_code.txt", "0"), ("stdout.txt", "partial")], 0);

        let (status, code, output) = interpret(&Outcome::TimedOut, &image);
        assert_eq!(status, TaskStatus::Timeout);
        assert_eq!(code, None);
        assert_eq!(output.stdout, "partial");
    }

    #[test]
    fn test_worker_failure_keeps_reported_code() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("output.tar");
        write_image(&image, &[("exit_code.txt", " 3 \n")], 0);

        let (status, code, _) = interpret(&Outcome::Exited { code: 210 }, &image);
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(code, Some(3));
        assert_eq!(parse_exit_code(b"nope"), None);
    }
}
