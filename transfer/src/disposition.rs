// Copyright 2024 The Courier Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File disposition after a transfer: archive or delete on success,
//! move to the error directory on failure, and the optional hook
//! command run on placed files. Every configured directory is a base
//! holding one subdirectory per peer identity, so no peer's files ever
//! mix with another's.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{Error, Result};

/// Post-transfer placement policy. The directories are bases; files
/// for a peer land in `<base>/<ident>/`.
#[derive(Debug, Clone, Default)]
pub struct Dispositions {
	/// Base of the per-peer archive directories; successfully handled
	/// files are deleted when absent.
	pub archive_dir: Option<PathBuf>,
	/// Base of the per-peer error directories; failed files are left
	/// in place (with a log entry) when absent.
	pub error_dir: Option<PathBuf>,
	/// Command spawned (detached) with the placed file path appended,
	/// after a successful archive or receive.
	pub post_command: Option<String>,
}

/// Random 6-character suffix used to defuse name collisions.
pub fn unique_suffix() -> String {
	thread_rng().sample_iter(&Alphanumeric).take(6).collect()
}

/// The directory for one peer under a base, created on demand.
/// Identity strings are validated to contain no separators, so the
/// join cannot escape the base.
pub fn peer_dir(base: &Path, ident: &str) -> Result<PathBuf> {
	let dir = base.join(ident);
	std::fs::create_dir_all(&dir)?;
	Ok(dir)
}

/// Verify a directory exists and is writable by creating and removing
/// a probe file.
pub fn check_directory(dir: &Path) -> Result<()> {
	if !dir.is_dir() {
		return Err(Error::Config(format!(
			"{} does not exist or is not a directory",
			dir.display()
		)));
	}
	let probe = dir.join(format!(".courier-probe-{}", std::process::id()));
	std::fs::File::create(&probe).map_err(|e| {
		Error::Config(format!("{} is not writable: {}", dir.display(), e))
	})?;
	let _ = std::fs::remove_file(&probe);
	Ok(())
}

/// Link `src` into place as `dst` without clobbering an existing file;
/// on collision, retry with randomized suffixes. Returns the final
/// path.
pub fn place_file(src: &Path, dst: &Path) -> Result<PathBuf> {
	let mut target = dst.to_path_buf();
	loop {
		match std::fs::hard_link(src, &target) {
			Ok(()) => {
				std::fs::remove_file(src)?;
				return Ok(target);
			}
			Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
				let name = dst
					.file_name()
					.and_then(|n| n.to_str())
					.unwrap_or("file");
				let retry = format!("{}-{}", name, unique_suffix());
				info!(
					"{} exists, retrying as {}",
					target.display(),
					retry
				);
				target = dst.with_file_name(retry);
			}
			Err(ref e) if e.raw_os_error() == Some(libc::EXDEV) => {
				// Different filesystem: copy then remove, still
				// refusing to clobber.
				if target.exists() {
					let name = dst
						.file_name()
						.and_then(|n| n.to_str())
						.unwrap_or("file");
					target = dst
						.with_file_name(format!("{}-{}", name, unique_suffix()));
					continue;
				}
				std::fs::copy(src, &target)?;
				std::fs::remove_file(src)?;
				return Ok(target);
			}
			Err(e) => return Err(Error::Io(e)),
		}
	}
}

impl Dispositions {
	/// Check the configured base directories at startup and create the
	/// per-peer subdirectory of every configured identity, verifying
	/// each is writable.
	pub fn validate(&self, idents: &[String]) -> Result<()> {
		if let Some(base) = &self.archive_dir {
			check_directory(base)?;
			for ident in idents {
				check_directory(&peer_dir(base, ident)?)?;
			}
		}
		if let Some(base) = &self.error_dir {
			check_directory(base)?;
			for ident in idents {
				check_directory(&peer_dir(base, ident)?)?;
			}
		}
		Ok(())
	}

	fn run_hook(&self, placed: &Path) {
		if let Some(command) = &self.post_command {
			// "%s" in the command stands for the placed file; when
			// absent the path is appended.
			let placed_str = placed.display().to_string();
			let cmdline = if command.contains("%s") {
				command.replace("%s", &placed_str)
			} else {
				format!("{} {}", command, placed_str)
			};
			// Fire and forget; the hook's fate is only logged.
			let _ = thread::Builder::new()
				.name("post_command".to_string())
				.spawn(move || {
					match Command::new("/bin/sh").arg("-c").arg(&cmdline).status() {
						Ok(status) if status.success() => {}
						Ok(status) => {
							warn!("post command exited with {}", status)
						}
						Err(e) => warn!("unable to run post command: {}", e),
					}
				});
		}
	}

	/// Dispose of a file handled successfully for `ident`: archive it
	/// under the peer's archive directory (and run the hook) or delete
	/// it.
	pub fn success(&self, ident: &str, path: &Path) -> Result<()> {
		match &self.archive_dir {
			Some(base) => {
				let name = path
					.file_name()
					.ok_or_else(|| Error::Config(format!(
						"{} has no filename",
						path.display()
					)))?;
				let dir = peer_dir(base, ident)?;
				let placed = place_file(path, &dir.join(name))?;
				debug!("archived {} as {}", path.display(), placed.display());
				self.run_hook(&placed);
			}
			None => {
				std::fs::remove_file(path)?;
				debug!("removed {}", path.display());
			}
		}
		Ok(())
	}

	/// Dispose of a file that failed for `ident`: move it to the
	/// peer's error directory, or leave it and log when none is
	/// configured.
	pub fn error(&self, ident: &str, path: &Path) -> Result<()> {
		match &self.error_dir {
			Some(base) => {
				let name = path
					.file_name()
					.ok_or_else(|| Error::Config(format!(
						"{} has no filename",
						path.display()
					)))?;
				let dir = peer_dir(base, ident)?;
				let placed = place_file(path, &dir.join(name))?;
				warn!(
					"moved failed file {} to {}",
					path.display(),
					placed.display()
				);
			}
			None => {
				warn!("leaving failed file in place: {}", path.display());
			}
		}
		Ok(())
	}

	/// Notify the hook about a file placed by the receiver.
	pub fn received(&self, placed: &Path) {
		self.run_hook(placed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;

	#[test]
	fn suffix_is_six_alphanumerics() {
		let suffix = unique_suffix();
		assert_eq!(suffix.len(), 6);
		assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
	}

	#[test]
	fn place_file_avoids_collisions() {
		let dir = tempfile::tempdir().unwrap();
		let src1 = dir.path().join(".a");
		let src2 = dir.path().join(".b");
		let dst = dir.path().join("result");
		fs::write(&src1, b"one").unwrap();
		fs::write(&src2, b"two").unwrap();

		let placed1 = place_file(&src1, &dst).unwrap();
		assert_eq!(placed1, dst);
		let placed2 = place_file(&src2, &dst).unwrap();
		assert_ne!(placed2, dst);
		assert!(placed2
			.file_name()
			.unwrap()
			.to_str()
			.unwrap()
			.starts_with("result-"));
		assert_eq!(fs::read(&placed1).unwrap(), b"one");
		assert_eq!(fs::read(&placed2).unwrap(), b"two");
		assert!(!src1.exists());
		assert!(!src2.exists());
	}

	#[test]
	fn success_without_archive_deletes() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("payload");
		fs::write(&file, b"x").unwrap();
		let dispo = Dispositions::default();
		dispo.success("dest1", &file).unwrap();
		assert!(!file.exists());
	}

	#[test]
	fn success_archives_under_the_peer_directory() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("archive");
		fs::create_dir(&archive).unwrap();
		let file = dir.path().join("payload");
		fs::write(&file, b"x").unwrap();
		let dispo = Dispositions {
			archive_dir: Some(archive.clone()),
			..Dispositions::default()
		};
		dispo.validate(&[String::from("dest1")]).unwrap();
		dispo.success("dest1", &file).unwrap();
		assert!(!file.exists());
		assert!(archive.join("dest1").join("payload").exists());
	}

	#[test]
	fn same_filename_stays_apart_per_peer() {
		let dir = tempfile::tempdir().unwrap();
		let errors = dir.path().join("errors");
		fs::create_dir(&errors).unwrap();
		let dispo = Dispositions {
			error_dir: Some(errors.clone()),
			..Dispositions::default()
		};
		let idents = vec![String::from("alpha"), String::from("beta")];
		dispo.validate(&idents).unwrap();

		let file_a = dir.path().join("report.bin");
		fs::write(&file_a, b"from alpha").unwrap();
		dispo.error("alpha", &file_a).unwrap();
		let file_b = dir.path().join("report.bin");
		fs::write(&file_b, b"from beta").unwrap();
		dispo.error("beta", &file_b).unwrap();

		assert_eq!(
			fs::read(errors.join("alpha").join("report.bin")).unwrap(),
			b"from alpha"
		);
		assert_eq!(
			fs::read(errors.join("beta").join("report.bin")).unwrap(),
			b"from beta"
		);
	}

	#[test]
	fn validate_rejects_missing_directory() {
		let dispo = Dispositions {
			error_dir: Some(PathBuf::from("/nonexistent/courier-test")),
			..Dispositions::default()
		};
		assert!(dispo.validate(&[String::from("dest1")]).is_err());
	}
}
