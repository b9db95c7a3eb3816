use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::unistd;
use tracing::debug;

use crate::error::{Result, ShellError};
use crate::pidset::ProcessSet;

/// Key of the entry that feeds the current line's first stage.
pub const ORIGIN_KEY: i32 = 0;

/// A pipe that outlives the line that created it.
#[derive(Debug)]
pub struct NumberedPipe {
	countdown: i32,
	read: Option<OwnedFd>,
	write: Option<OwnedFd>,
	/// Producers that wrote into this pipe and have not been waited on.
	pub deferred: ProcessSet,
}

impl NumberedPipe {
	pub fn read_end(&self) -> Option<BorrowedFd> {
		self.read.as_ref().map(|fd| fd.as_fd())
	}

	pub fn write_end(&self) -> Option<BorrowedFd> {
		self.write.as_ref().map(|fd| fd.as_fd())
	}
}

/// Numbered pipes keyed by how many more lines they stay alive for.
#[derive(Debug, Default)]
pub struct PipeRegistry {
	entries: Vec<NumberedPipe>,
}

impl PipeRegistry {
	pub fn new() -> PipeRegistry {
		PipeRegistry { entries: Vec::new() }
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Counts every entry down by one line. Entries that run out are closed;
	/// their producers, never waited on, are returned to the caller.
	pub fn advance(&mut self) -> ProcessSet {
		let mut abandoned = ProcessSet::new();
		let mut kept = Vec::with_capacity(self.entries.len());
		for mut entry in self.entries.drain(..) {
			entry.countdown -= 1;
			if entry.countdown < ORIGIN_KEY {
				debug!(producers = entry.deferred.len(), "numbered pipe expired unread");
				abandoned.merge(&mut entry.deferred);
			} else {
				kept.push(entry);
			}
		}
		self.entries = kept;
		abandoned
	}

	pub fn find(&self, key: i32) -> Option<&NumberedPipe> {
		self.entries.iter().find(|e| e.countdown == key)
	}

	pub fn find_mut(&mut self, key: i32) -> Option<&mut NumberedPipe> {
		self.entries.iter_mut().find(|e| e.countdown == key)
	}

	pub fn insert(&mut self, key: i32) -> Result<&mut NumberedPipe> {
		let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(ShellError::ResourceExhausted)?;
		debug!(key, "numbered pipe created");
		self.entries.push(NumberedPipe {
			countdown: key,
			read: Some(read),
			write: Some(write),
			deferred: ProcessSet::new(),
		});
		let last = self.entries.len() - 1;
		Ok(&mut self.entries[last])
	}

	/// Resolves `key`, creating the pipe on first reference.
	pub fn find_or_insert(&mut self, key: i32) -> Result<&mut NumberedPipe> {
		match self.entries.iter().position(|e| e.countdown == key) {
			Some(i) => Ok(&mut self.entries[i]),
			None => self.insert(key),
		}
	}

	pub fn remove(&mut self, key: i32) -> Option<NumberedPipe> {
		self.entries.iter().position(|e| e.countdown == key).map(|i| self.entries.swap_remove(i))
	}

	/// Called in a forked child so it holds no write end except its own.
	pub fn close_all_write_ends(&mut self, except: Option<i32>) {
		for entry in self.entries.iter_mut() {
			if Some(entry.countdown) != except {
				entry.write = None;
			}
		}
	}

	pub fn iter(&self) -> std::slice::Iter<NumberedPipe> {
		self.entries.iter()
	}

	/// Every producer pid still waiting on a reader, across all entries.
	pub fn deferred_mut(&mut self) -> impl Iterator<Item = &mut ProcessSet> + '_ {
		self.entries.iter_mut().map(|e| &mut e.deferred)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nix::unistd::Pid;
	use std::fs::File;
	use std::io::{Read, Write};

	#[test]
	fn expires_after_count_plus_one_advances() {
		let mut registry = PipeRegistry::new();
		registry.insert(3).unwrap().deferred.insert(Pid::from_raw(4242));

		for key in (0 .. 3).rev() {
			assert!(registry.advance().is_empty());
			assert!(registry.find(key).is_some());
		}

		let abandoned = registry.advance();
		assert!(registry.is_empty());
		assert!(abandoned.contains(Pid::from_raw(4242)));
	}

	#[test]
	fn origin_is_resolvable_on_its_last_line() {
		let mut registry = PipeRegistry::new();
		registry.insert(1).unwrap();
		registry.advance();
		assert!(registry.find(ORIGIN_KEY).is_some());
		assert!(registry.find(1).is_none());
		assert!(registry.remove(ORIGIN_KEY).is_some());
		assert!(registry.remove(ORIGIN_KEY).is_none());
	}

	#[test]
	fn writers_with_the_same_target_share_one_entry() {
		let mut registry = PipeRegistry::new();
		registry.find_or_insert(2).unwrap();
		registry.advance();
		registry.find_or_insert(1).unwrap();
		registry.find_or_insert(1).unwrap();
		assert_eq!(registry.len(), 1);
	}

	#[test]
	fn bytes_flow_through_and_eof_follows_close() {
		let mut registry = PipeRegistry::new();
		let entry = registry.insert(1).unwrap();
		let mut writer = File::from(entry.write.take().unwrap());
		writer.write_all(b"queued\n").unwrap();
		drop(writer);

		let entry = registry.remove(1).unwrap();
		let mut reader = File::from(entry.read.unwrap());
		let mut buf = String::new();
		reader.read_to_string(&mut buf).unwrap();
		assert_eq!(buf, "queued\n");
	}

	#[test]
	fn close_all_write_ends_keeps_the_exception() {
		let mut registry = PipeRegistry::new();
		registry.insert(1).unwrap();
		registry.insert(2).unwrap();
		registry.close_all_write_ends(Some(2));
		assert!(registry.find(1).unwrap().write_end().is_none());
		assert!(registry.find(2).unwrap().write_end().is_some());
		assert!(registry.find(1).unwrap().read_end().is_some());
	}
}
