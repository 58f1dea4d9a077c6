pub mod diff;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::error::IndexError;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const BINARY_SAMPLE: usize = 8000;
const CONTROL_THRESHOLD: f64 = 0.3;

/// Status letters that mark a path as changed in either porcelain column.
const STATUS_LETTERS: &[char] = &['M', 'A', 'D', 'R', 'C', 'U', 'T'];

/// Working-tree change classification from `git status --porcelain`.
#[derive(Debug, Default, Serialize)]
pub struct StatusSummary {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
}

/// Read-only gateway to one repository's history and working tree, shelling
/// out to the git CLI. Instances are cheap; create one per call site.
pub struct GitCli {
    repo_path: PathBuf,
}

impl GitCli {
    /// Execution is confined to the absolute, normalized repo path, which is
    /// registered as a safe.directory up front so repositories mounted
    /// read-only or owned by another user still answer reads.
    pub fn new(repo_path: impl AsRef<Path>) -> Result<Self> {
        let repo_path = repo_path
            .as_ref()
            .canonicalize()
            .with_context(|| format!("resolving repo path {}", repo_path.as_ref().display()))?;
        let git = Self { repo_path };
        git.mark_safe()?;
        Ok(git)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn mark_safe(&self) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(["config", "--global", "--add", "safe.directory"]).arg(&self.repo_path);
        let output = run_with_timeout(cmd, Duration::from_secs(10))?;
        if !output.status.success() {
            return Err(IndexError::Git(format!(
                "failed to mark safe.directory: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }
        Ok(())
    }

    fn run_bytes(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("git");
        cmd.arg("--no-pager").args(args).current_dir(&self.repo_path);
        let output = run_with_timeout(cmd, GIT_TIMEOUT)
            .with_context(|| format!("git {}", args.join(" ")))?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(IndexError::Git(format!(
                "git {} failed: {combined}",
                args.join(" ")
            ))
            .into());
        }
        Ok(output.stdout)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.run_bytes(args)?).into_owned())
    }

    pub fn head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        Ok(self.run(&["rev-parse", rev])?.trim().to_string())
    }

    /// Files known to git, at a ref or (None) in the index.
    pub fn list_files(&self, at: Option<&str>) -> Result<Vec<String>> {
        let out = match at {
            Some(rev) => self.run(&["ls-tree", "-r", "--name-only", rev])?,
            None => self.run(&["ls-files"])?,
        };
        Ok(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// File contents at a ref, or from the working tree when `at` is None.
    /// Returns None for binaries and for paths absent at the ref; real git
    /// failures propagate.
    pub fn show_file(&self, at: Option<&str>, path: &str) -> Result<Option<String>> {
        match at {
            None => {
                let full = self.repo_path.join(path);
                match std::fs::read(&full) {
                    Ok(raw) => {
                        if is_probably_binary(&raw) {
                            debug!(path, "skipping binary working-tree file");
                            Ok(None)
                        } else {
                            Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
                        }
                    }
                    Err(_) => Ok(None),
                }
            }
            Some(rev) => {
                let spec = format!("{rev}:{path}");
                match self.run_bytes(&["show", &spec]) {
                    Ok(raw) => {
                        if is_probably_binary(&raw) {
                            debug!(path, rev, "skipping binary file");
                            Ok(None)
                        } else {
                            Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
                        }
                    }
                    Err(err) => {
                        let message = format!("{err:#}").to_lowercase();
                        let absent_at_ref = message.contains("exists on disk, but not in")
                            || (message.contains("fatal: path") && message.contains("does not exist"));
                        if absent_at_ref { Ok(None) } else { Err(err) }
                    }
                }
            }
        }
    }

    /// Zero-context, whitespace-insensitive diff between two refs.
    pub fn diff_unified_zero(&self, base: &str, head: &str) -> Result<String> {
        self.run(&[
            "diff",
            &format!("{base}..{head}"),
            "--unified=0",
            "--ignore-blank-lines",
            "--ignore-space-at-eol",
            "--no-color",
        ])
    }

    /// Same diff shape, from a base ref to the working tree, restricted to
    /// the given paths.
    pub fn diff_working(&self, base: &str, paths: &[String]) -> Result<String> {
        if paths.is_empty() {
            return Ok(String::new());
        }
        let mut args: Vec<&str> = vec![
            "diff",
            "--unified=0",
            "--ignore-blank-lines",
            "--ignore-space-at-eol",
            "--no-color",
            base,
            "--",
        ];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args)
    }

    pub fn status_porcelain(&self) -> Result<String> {
        self.run(&["status", "--porcelain", "--untracked-files=no"])
    }

    /// Paths whose staged or unstaged status column shows a change.
    pub fn working_tree_changes(&self) -> Result<Vec<String>> {
        let out = self.status_porcelain()?;
        Ok(out
            .lines()
            .filter(|line| line.len() >= 3)
            .filter(|line| {
                let mut chars = line.chars();
                let x = chars.next().unwrap_or(' ');
                let y = chars.next().unwrap_or(' ');
                STATUS_LETTERS.contains(&x) || STATUS_LETTERS.contains(&y)
            })
            .map(|line| line[3..].trim().to_string())
            .collect())
    }

    /// Classify working-tree changes as modified/added/deleted/renamed,
    /// staged column taking precedence.
    pub fn classify_status(&self) -> Result<StatusSummary> {
        let out = self.status_porcelain()?;
        let mut summary = StatusSummary::default();
        for line in out.lines().filter(|line| line.len() >= 3) {
            let mut chars = line.chars();
            let x = chars.next().unwrap_or(' ');
            let y = chars.next().unwrap_or(' ');
            let status = if matches!(x, 'M' | 'A' | 'D' | 'R') {
                x
            } else if matches!(y, 'M' | 'A' | 'D' | 'R') {
                y
            } else {
                continue;
            };
            let path = line[3..].trim().to_string();
            match status {
                'M' => summary.modified.push(path),
                'A' => summary.added.push(path),
                'D' => summary.deleted.push(path),
                'R' => summary.renamed.push(path),
                _ => {}
            }
        }
        Ok(summary)
    }
}

/// Lightweight binary detector: NUL bytes anywhere, or a high ratio of
/// control characters in a leading sample. Keeps UTF-8 text (including
/// non-ASCII) from being treated as binary.
pub fn is_probably_binary(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    if data.contains(&0) {
        return true;
    }
    let sample = &data[..data.len().min(BINARY_SAMPLE)];
    let control = sample.iter().filter(|b| **b < 32 && !matches!(**b, 9 | 10 | 13)).count();
    control as f64 / sample.len() as f64 > CONTROL_THRESHOLD
}

/// Run a command with piped output and a hard deadline. Reader threads keep
/// the pipes drained so large outputs can't deadlock the child.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<Output> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::Error::from(IndexError::Git("`git` CLI not found on PATH".into()))
        } else {
            anyhow::Error::from(e).context("spawning git")
        }
    })?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || drain(stdout_pipe));
    let stderr_reader = std::thread::spawn(move || drain(stderr_pipe));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait().context("waiting for git")? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(IndexError::Git("git command timed out".into()).into());
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(Output { status, stdout, stderr })
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git runs");
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        sh(dir.path(), &["init", "-q"]);
        sh(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
        dir
    }

    fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(dir.join(name), content).unwrap();
        sh(dir, &["add", "."]);
        sh(dir, &["commit", "-q", "-m", message]);
    }

    #[test]
    fn head_and_list_files() {
        let dir = init_repo();
        commit_file(dir.path(), "a.py", "def f():\n    pass\n", "init");
        let git = GitCli::new(dir.path()).unwrap();
        let head = git.head().unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(git.list_files(Some(&head)).unwrap(), vec!["a.py"]);
        assert_eq!(git.rev_parse("HEAD").unwrap(), head);
    }

    #[test]
    fn show_file_reads_history_and_working_tree() {
        let dir = init_repo();
        commit_file(dir.path(), "a.py", "v1\n", "init");
        let git = GitCli::new(dir.path()).unwrap();
        let head = git.head().unwrap();

        std::fs::write(dir.path().join("a.py"), "v2\n").unwrap();
        assert_eq!(git.show_file(Some(&head), "a.py").unwrap().as_deref(), Some("v1\n"));
        assert_eq!(git.show_file(None, "a.py").unwrap().as_deref(), Some("v2\n"));
    }

    #[test]
    fn show_file_absent_at_ref_is_none_not_error() {
        let dir = init_repo();
        commit_file(dir.path(), "a.py", "v1\n", "init");
        let git = GitCli::new(dir.path()).unwrap();
        let head = git.head().unwrap();
        assert!(git.show_file(Some(&head), "nope.py").unwrap().is_none());
        assert!(git.show_file(None, "nope.py").unwrap().is_none());

        // Present on disk but not yet committed at the ref.
        std::fs::write(dir.path().join("new.py"), "x = 1\n").unwrap();
        sh(dir.path(), &["add", "new.py"]);
        assert!(git.show_file(Some(&head), "new.py").unwrap().is_none());
    }

    #[test]
    fn show_file_skips_binaries() {
        let dir = init_repo();
        std::fs::write(dir.path().join("blob.bin"), b"\x00\x01\x02data").unwrap();
        sh(dir.path(), &["add", "."]);
        sh(dir.path(), &["commit", "-q", "-m", "bin"]);
        let git = GitCli::new(dir.path()).unwrap();
        let head = git.head().unwrap();
        assert!(git.show_file(Some(&head), "blob.bin").unwrap().is_none());
        assert!(git.show_file(None, "blob.bin").unwrap().is_none());
    }

    #[test]
    fn diff_and_status_surface_changes() {
        let dir = init_repo();
        commit_file(dir.path(), "a.py", "line1\nline2\n", "init");
        let git = GitCli::new(dir.path()).unwrap();
        let base = git.head().unwrap();
        commit_file(dir.path(), "a.py", "line1\nchanged\n", "edit");
        let head = git.head().unwrap();

        let diff = git.diff_unified_zero(&base, &head).unwrap();
        assert!(diff.contains("diff --git a/a.py b/a.py"));
        assert!(diff.contains("@@"));
        assert!(git.diff_unified_zero(&head, &head).unwrap().trim().is_empty());

        std::fs::write(dir.path().join("a.py"), "working tree edit\n").unwrap();
        let changes = git.working_tree_changes().unwrap();
        assert_eq!(changes, vec!["a.py"]);
        let summary = git.classify_status().unwrap();
        assert_eq!(summary.modified, vec!["a.py"]);
        assert!(summary.deleted.is_empty());

        let working_diff = git.diff_working(&head, &changes).unwrap();
        assert!(working_diff.contains("working tree edit"));
        assert!(git.diff_working(&head, &[]).unwrap().is_empty());
    }

    #[test]
    fn clean_tree_has_no_changes() {
        let dir = init_repo();
        commit_file(dir.path(), "a.py", "x\n", "init");
        let git = GitCli::new(dir.path()).unwrap();
        assert!(git.working_tree_changes().unwrap().is_empty());
    }

    #[test]
    fn binary_sniff_rules() {
        assert!(!is_probably_binary(b""));
        assert!(!is_probably_binary("plain text\nwith lines\n".as_bytes()));
        assert!(!is_probably_binary("utf-8: \u{c548}\u{b155}\n".as_bytes()));
        assert!(is_probably_binary(b"data\x00data"));
        // >30% disallowed control bytes in the sample.
        let noisy: Vec<u8> = (0..100).map(|i| if i % 2 == 0 { 0x01 } else { b'a' }).collect();
        assert!(is_probably_binary(&noisy));
        // tab/newline/CR are allowed control bytes.
        assert!(!is_probably_binary(b"a\tb\r\nc\td\r\ne\tf\r\n"));
    }
}
