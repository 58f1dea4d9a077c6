use std::sync::LazyLock;

use regex::Regex;

use crate::index::chunker::Range;

/// One aligned change region of a unified diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hunk {
    pub base_start: u32,
    pub base_len: u32,
    pub head_start: u32,
    pub head_len: u32,
}

/// All hunks of one file in a diff. For deletions `path` is the old ("a")
/// side, which is the canonical path the index knows the file under.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: String,
    pub hunks: Vec<Hunk>,
    pub is_deleted: bool,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.+?) b/(.+)$").unwrap());
static HUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

/// Parse `git diff --unified=0` output into per-file hunk lists.
///
/// Tolerant of the quirks git actually produces: paths come from the
/// `diff --git` header or the `---`/`+++` lines, whichever arrives first;
/// `deleted file mode` may precede the path lines; pure deletions have no
/// hunks at all. Entries with neither hunks nor a deletion marker are
/// dropped.
pub fn parse_unified_diff(text: &str) -> Vec<FileDiff> {
    let mut out: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut parsed_old: Option<String> = None;
    let mut parsed_new: Option<String> = None;
    let mut deleted_flag = false;

    fn finalize(mut fd: FileDiff, deleted_flag: bool, out: &mut Vec<FileDiff>) {
        fd.is_deleted = deleted_flag || fd.new_path.as_deref() == Some("/dev/null");
        if fd.is_deleted {
            if let Some(old) = fd.old_path.clone() {
                fd.path = old;
            }
        }
        out.push(fd);
    }

    for line in text.lines() {
        if let Some(caps) = HEADER_RE.captures(line) {
            if let Some(fd) = current.take() {
                finalize(fd, deleted_flag, &mut out);
            }
            parsed_old = Some(caps[1].to_string());
            parsed_new = Some(caps[2].to_string());
            deleted_flag = false;
            continue;
        }

        if let Some(old_path) = line.strip_prefix("--- a/") {
            let old_path = old_path.trim().to_string();
            if parsed_old.is_none() {
                parsed_old = Some(old_path.clone());
            }
            if deleted_flag && current.is_none() {
                let path = parsed_old.clone().unwrap_or(old_path);
                current = Some(FileDiff {
                    path: path.clone(),
                    hunks: Vec::new(),
                    is_deleted: true,
                    old_path: Some(path),
                    new_path: Some("/dev/null".into()),
                });
            }
            continue;
        }

        if let Some(new_path) = line.strip_prefix("+++ ") {
            let new_path = new_path.trim();
            let new_path = new_path.strip_prefix("b/").unwrap_or(new_path).to_string();
            if parsed_new.is_none() {
                parsed_new = Some(new_path.clone());
            }
            match current.as_mut() {
                None => {
                    if new_path == "/dev/null" {
                        let path = parsed_old.clone().unwrap_or_else(|| "/dev/null".into());
                        current = Some(FileDiff {
                            path,
                            hunks: Vec::new(),
                            is_deleted: true,
                            old_path: parsed_old.clone(),
                            new_path: Some("/dev/null".into()),
                        });
                    } else {
                        current = Some(FileDiff {
                            path: new_path.clone(),
                            hunks: Vec::new(),
                            is_deleted: false,
                            old_path: parsed_old.clone(),
                            new_path: Some(new_path),
                        });
                    }
                }
                Some(fd) => {
                    fd.new_path = Some(new_path);
                    if fd.old_path.is_none() {
                        fd.old_path = parsed_old.clone();
                    }
                }
            }
            continue;
        }

        if line.starts_with("deleted file mode") {
            deleted_flag = true;
            if current.is_none() {
                if let Some(path) = parsed_old.clone().or_else(|| parsed_new.clone()) {
                    current = Some(FileDiff {
                        path,
                        hunks: Vec::new(),
                        is_deleted: true,
                        old_path: parsed_old.clone(),
                        new_path: Some("/dev/null".into()),
                    });
                }
                // otherwise wait for the ---/+++ lines to supply a path
            }
            continue;
        }

        if line.starts_with("@@ ") {
            if let (Some(fd), Some(caps)) = (current.as_mut(), HUNK_RE.captures(line)) {
                // A missing length means a single line.
                let base_len = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
                let head_len = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));
                fd.hunks.push(Hunk {
                    base_start: caps[1].parse().unwrap_or(0),
                    base_len,
                    head_start: caps[3].parse().unwrap_or(0),
                    head_len,
                });
            }
            continue;
        }
    }

    if let Some(fd) = current.take() {
        finalize(fd, deleted_flag, &mut out);
    }

    out.retain(|fd| !fd.path.is_empty() && (!fd.hunks.is_empty() || fd.is_deleted));
    out
}

/// Translate a base-revision range through a file's hunks.
///
/// Hunks that end at or before the range shift both endpoints by the hunk's
/// net line delta; a hunk overlapping the range leaves the endpoints alone
/// and flags the range for relocalization; hunks past the range are ignored.
/// Unified diff guarantees hunks are disjoint and sorted by base line, which
/// makes the result order-independent.
pub fn translate(r: &Range, hunks: &[Hunk]) -> Range {
    let mut start = r.start_line as i64;
    let mut end = r.end_line as i64;
    let mut relocalize = r.relocalize;

    for h in hunks {
        let delta = h.head_len as i64 - h.base_len as i64;
        let base_start = h.base_start as i64;
        let base_end = base_start + h.base_len as i64;
        if base_end <= start {
            start += delta;
            end += delta;
        } else if base_start < end && base_end > start {
            relocalize = true;
        }
    }

    Range {
        start_line: start.max(1) as u32,
        end_line: end.max(1) as u32,
        byte_start: r.byte_start,
        byte_end: r.byte_end,
        relocalize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_modification() {
        let diff = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -10,3 +10,10 @@ fn before() {
+added
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].path, "src/lib.rs");
        assert!(!fds[0].is_deleted);
        assert_eq!(fds[0].hunks, vec![Hunk { base_start: 10, base_len: 3, head_start: 10, head_len: 10 }]);
    }

    #[test]
    fn hunk_without_length_defaults_to_one() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -5 +5 @@
-old
+new
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds[0].hunks, vec![Hunk { base_start: 5, base_len: 1, head_start: 5, head_len: 1 }]);
    }

    #[test]
    fn deletion_without_hunks_keeps_old_path() {
        let diff = "\
diff --git a/file_b.py b/file_b.py
deleted file mode 100644
index 3333333..0000000
--- a/file_b.py
+++ /dev/null
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds.len(), 1);
        assert!(fds[0].is_deleted);
        assert_eq!(fds[0].path, "file_b.py");
        assert!(fds[0].hunks.is_empty());
    }

    #[test]
    fn deletion_marker_before_path_lines() {
        let diff = "\
diff --git a/gone.rs b/gone.rs
deleted file mode 100644
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds.len(), 1);
        assert!(fds[0].is_deleted);
        assert_eq!(fds[0].path, "gone.rs");
    }

    #[test]
    fn added_file_parses_from_new_side() {
        let diff = "\
diff --git a/new.py b/new.py
new file mode 100644
--- /dev/null
+++ b/new.py
@@ -0,0 +1,2 @@
+def f():
+    pass
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].path, "new.py");
        assert!(!fds[0].is_deleted);
        assert_eq!(fds[0].hunks.len(), 1);
    }

    #[test]
    fn entry_with_neither_hunks_nor_deletion_is_dropped() {
        let diff = "\
diff --git a/mode.sh b/mode.sh
old mode 100644
new mode 100755
--- a/mode.sh
+++ b/mode.sh
";
        assert!(parse_unified_diff(diff).is_empty());
    }

    #[test]
    fn multiple_files_are_separated() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1,2 +1,3 @@
diff --git a/b.py b/b.py
deleted file mode 100644
--- a/b.py
+++ /dev/null
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds.len(), 2);
        assert_eq!(fds[0].path, "a.py");
        assert!(fds[1].is_deleted);
        assert_eq!(fds[1].path, "b.py");
    }

    #[test]
    fn rename_exposes_both_paths() {
        let diff = "\
diff --git a/old_name.py b/new_name.py
--- a/old_name.py
+++ b/new_name.py
@@ -1,1 +1,1 @@
";
        let fds = parse_unified_diff(diff);
        assert_eq!(fds[0].path, "new_name.py");
        assert_eq!(fds[0].old_path.as_deref(), Some("old_name.py"));
        assert_eq!(fds[0].new_path.as_deref(), Some("new_name.py"));
    }

    #[test]
    fn empty_diff_parses_to_nothing() {
        assert!(parse_unified_diff("").is_empty());
    }

    // -- translate --

    #[test]
    fn translate_shifts_past_hunks() {
        let r = Range::new(100, 120, 0, 0);
        let hunks = [Hunk { base_start: 10, base_len: 3, head_start: 10, head_len: 10 }];
        let t = translate(&r, &hunks);
        assert_eq!((t.start_line, t.end_line), (107, 127));
        assert!(!t.relocalize);
    }

    #[test]
    fn translate_flags_overlap() {
        let r = Range::new(15, 20, 0, 0);
        let hunks = [Hunk { base_start: 18, base_len: 4, head_start: 18, head_len: 1 }];
        let t = translate(&r, &hunks);
        assert_eq!((t.start_line, t.end_line), (15, 20));
        assert!(t.relocalize);
    }

    #[test]
    fn translate_ignores_hunks_past_the_range() {
        let r = Range::new(5, 9, 0, 0);
        let hunks = [Hunk { base_start: 50, base_len: 2, head_start: 50, head_len: 8 }];
        let t = translate(&r, &hunks);
        assert_eq!((t.start_line, t.end_line), (5, 9));
        assert!(!t.relocalize);
    }

    #[test]
    fn translate_is_identity_on_empty_hunks() {
        let r = Range::new(3, 8, 10, 90);
        let t = translate(&r, &[]);
        assert_eq!(t, r);
    }

    #[test]
    fn translate_applies_deletions_as_negative_shift() {
        let r = Range::new(30, 40, 0, 0);
        let hunks = [Hunk { base_start: 1, base_len: 10, head_start: 1, head_len: 2 }];
        let t = translate(&r, &hunks);
        assert_eq!((t.start_line, t.end_line), (22, 32));
    }

    #[test]
    fn translate_accumulates_multiple_hunks() {
        let r = Range::new(100, 110, 0, 0);
        let hunks = [
            Hunk { base_start: 5, base_len: 1, head_start: 5, head_len: 4 },
            Hunk { base_start: 40, base_len: 6, head_start: 43, head_len: 1 },
        ];
        let t = translate(&r, &hunks);
        // +3 then -5
        assert_eq!((t.start_line, t.end_line), (98, 108));
    }
}
