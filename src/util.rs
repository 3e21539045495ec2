//! Filesystem and naming helpers

use chrono::{TimeZone, Utc};
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Names starting with this prefix are never indexed
pub const IGNORE_PREFIX: &str = ".ignore";

/// Temp prefix used while moving a file into its final place
pub const RENAME_VIA_PREFIX: &str = ".ignore-rename-to-";

/// Temp prefix used before a recursive delete
pub const DELETE_VIA_PREFIX: &str = ".ignore-delete-";

/// Temp prefix used while assembling downloaded content
pub const ASSEMBLE_VIA_PREFIX: &str = ".ignore-assemble-to-";

pub fn is_ignored_name(name: &str) -> bool {
	name.starts_with(IGNORE_PREFIX)
}

/// Whether any component of a path relative to its root is ignored
pub fn is_ignored_path(relative: &Path) -> bool {
	relative.components().any(|c| c.as_os_str().to_str().map_or(false, is_ignored_name))
}

/// `/`-joined relative path of `path` below `root`, None when outside the root
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
	let rel = path.strip_prefix(root).ok()?;
	let mut parts = Vec::new();
	for component in rel.components() {
		parts.push(component.as_os_str().to_str()?.to_string());
	}
	if parts.is_empty() {
		return None;
	}
	Some(parts.join("/"))
}

/// Move `from` to `to` through a temporary sibling of `to`.
///
/// If the second step fails the file is put back where it was.
pub fn rename_via(from: &Path, to: &Path, via_prefix: &str) -> io::Result<()> {
	let temp = via_path(to, via_prefix);
	if fs::symlink_metadata(&temp).is_ok() {
		delete_recursively(&temp)?;
	}

	fs::rename(from, &temp)?;
	if let Err(e) = fs::rename(&temp, to) {
		let _ = fs::rename(&temp, from);
		return Err(e);
	}
	Ok(())
}

/// Sibling of `target` named `<prefix><name>`
pub fn via_path(target: &Path, prefix: &str) -> PathBuf {
	let name = target.file_name().and_then(|n| n.to_str()).unwrap_or_default();
	let parent = target.parent().unwrap_or_else(|| Path::new("."));
	parent.join(format!("{}{}", prefix, name))
}

/// Remove a file or a whole directory tree
pub fn delete_recursively(path: &Path) -> io::Result<()> {
	let meta = fs::symlink_metadata(path)?;
	if meta.is_dir() {
		fs::remove_dir_all(path)
	} else {
		fs::remove_file(path)
	}
}

/// Rename a path out of the way and then delete it
pub fn delete_via(path: &Path) -> io::Result<()> {
	let temp = via_path(path, DELETE_VIA_PREFIX);
	if fs::symlink_metadata(&temp).is_ok() {
		delete_recursively(&temp)?;
	}
	fs::rename(path, &temp)?;
	delete_recursively(&temp)
}

/// Modification time in milliseconds since the epoch
pub fn mtime_millis(meta: &fs::Metadata) -> i64 {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

pub fn set_mtime_millis(path: &Path, millis: i64) -> io::Result<()> {
	let secs = millis.div_euclid(1000);
	let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
	filetime::set_file_mtime(path, FileTime::from_unix_time(secs, nanos))
}

/// Name of the renamed copy kept when two versions of a file collide:
/// `"report (alpha's conflicting copy, 2024-03-01 10-15-00).txt"`.
///
/// The timestamp is UTC so every peer derives the same name.
pub fn conflicting_copy_name(name: &str, machine: &str, at_millis: i64) -> String {
	let (base, ext) = split_extension(name);
	let possessive = if machine.ends_with('s') { "'" } else { "'s" };
	let stamp = match Utc.timestamp_millis_opt(at_millis).single() {
		Some(t) => t.format("%Y-%m-%d %H-%M-%S").to_string(),
		None => at_millis.to_string(),
	};
	format!("{} ({}{} conflicting copy, {}){}", base, machine, possessive, stamp, ext)
}

/// Split `name.ext` into (`name`, `.ext`); dotfiles and names without a dot keep everything
pub fn split_extension(name: &str) -> (&str, &str) {
	match name.rfind('.') {
		Some(i) if i > 0 => (&name[..i], &name[i..]),
		_ => (name, ""),
	}
}

/// Edit distance between two strings, counted in characters
pub fn levenshtein(a: &str, b: &str) -> usize {
	let a: Vec<char> = a.chars().collect();
	let b: Vec<char> = b.chars().collect();
	let mut prev: Vec<usize> = (0..=b.len()).collect();
	let mut cur = vec![0; b.len() + 1];

	for i in 1..=a.len() {
		cur[0] = i;
		for j in 1..=b.len() {
			let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
			cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
		}
		std::mem::swap(&mut prev, &mut cur);
	}
	prev[b.len()]
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_ignored_names() {
		assert!(is_ignored_name(".ignore-delete-x"));
		assert!(!is_ignored_name("ignore.txt"));
		assert!(is_ignored_path(Path::new("a/.ignore-rename-to-b/c")));
		assert!(!is_ignored_path(Path::new("a/b/c")));
	}

	#[test]
	fn test_relative_to() {
		let root = Path::new("/sync");
		assert_eq!(relative_to(root, Path::new("/sync/a/b.txt")), Some("a/b.txt".to_string()));
		assert_eq!(relative_to(root, Path::new("/sync")), None);
		assert_eq!(relative_to(root, Path::new("/other/x")), None);
	}

	#[test]
	fn test_rename_via() {
		let tmp = TempDir::new().unwrap();
		let from = tmp.path().join("a.txt");
		let to = tmp.path().join("b.txt");
		fs::write(&from, b"data").unwrap();

		rename_via(&from, &to, RENAME_VIA_PREFIX).unwrap();
		assert!(!from.exists());
		assert_eq!(fs::read(&to).unwrap(), b"data");
		assert!(!tmp.path().join(".ignore-rename-to-b.txt").exists());
	}

	#[test]
	fn test_delete_via_directory() {
		let tmp = TempDir::new().unwrap();
		let dir = tmp.path().join("d");
		fs::create_dir_all(dir.join("e")).unwrap();
		fs::write(dir.join("e/f.txt"), b"x").unwrap();

		delete_via(&dir).unwrap();
		assert!(!dir.exists());
		assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
	}

	#[test]
	fn test_conflicting_copy_name() {
		let name = conflicting_copy_name("report.txt", "alpha", 0);
		assert!(name.starts_with("report (alpha's conflicting copy, "));
		assert!(name.ends_with(").txt"));

		// 2020-09-13 12:26:40 UTC, whatever the local timezone
		assert_eq!(
			conflicting_copy_name("report.txt", "alpha", 1_600_000_000_000),
			"report (alpha's conflicting copy, 2020-09-13 12-26-40).txt"
		);

		let name = conflicting_copy_name("notes", "james", 0);
		assert!(name.starts_with("notes (james' conflicting copy, "));
		assert!(name.ends_with(')'));
	}

	#[test]
	fn test_split_extension() {
		assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
		assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
		assert_eq!(split_extension("README"), ("README", ""));
	}

	#[test]
	fn test_levenshtein() {
		assert_eq!(levenshtein("kitten", "sitting"), 3);
		assert_eq!(levenshtein("", "abc"), 3);
		assert_eq!(levenshtein("same", "same"), 0);
	}

	#[test]
	fn test_mtime_roundtrip() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("f");
		fs::write(&path, b"x").unwrap();
		set_mtime_millis(&path, 1_600_000_000_123).unwrap();
		assert_eq!(mtime_millis(&fs::metadata(&path).unwrap()), 1_600_000_000_123);
	}
}

// vim: ts=4
