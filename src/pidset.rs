use nix::unistd::Pid;

/// Child pids that have been forked but not yet waited on.
///
/// A pid is inserted once when it is forked and removed once when it is
/// reaped, so membership is duplicate-free.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessSet {
	imp: Vec<Pid>,
}

impl ProcessSet {
	pub fn new() -> ProcessSet {
		ProcessSet { imp: Vec::new() }
	}

	pub fn len(&self) -> usize {
		self.imp.len()
	}

	pub fn is_empty(&self) -> bool {
		self.imp.is_empty()
	}

	pub fn contains(&self, pid: Pid) -> bool {
		self.imp.contains(&pid)
	}

	pub fn iter(&self) -> std::slice::Iter<Pid> {
		self.imp.iter()
	}

	pub fn capacity(&self) -> usize {
		self.imp.capacity()
	}

	/// Makes room for `additional` inserts without reallocating.
	pub fn reserve(&mut self, additional: usize) {
		self.imp.reserve(additional);
	}

	/// True if one more insert cannot reallocate.
	pub fn has_room(&self) -> bool {
		self.imp.len() < self.imp.capacity()
	}

	/// Returns false if `pid` was already tracked.
	pub fn insert(&mut self, pid: Pid) -> bool {
		if self.contains(pid) {
			return false;
		}
		self.imp.push(pid);
		true
	}

	/// Moves every member of `other` into `self`, leaving `other` empty.
	pub fn merge(&mut self, other: &mut ProcessSet) {
		for pid in other.imp.drain(..) {
			if !self.imp.contains(&pid) {
				self.imp.push(pid);
			}
		}
	}

	pub fn remove_exact(&mut self, pid: Pid) -> bool {
		match self.imp.iter().position(|&p| p == pid) {
			Some(i) => {
				self.imp.swap_remove(i);
				true
			},
			None => false,
		}
	}

	/// Removes every pid present in both sets from both sets.
	pub fn remove_intersection(&mut self, other: &mut ProcessSet) {
		if self.imp.is_empty() || other.imp.is_empty() {
			return;
		}
		self.imp.retain(|&pid| !other.remove_exact(pid));
	}

	pub fn take(&mut self) -> ProcessSet {
		std::mem::take(self)
	}
}

impl IntoIterator for ProcessSet {
	type Item = Pid;
	type IntoIter = std::vec::IntoIter<Pid>;

	fn into_iter(self) -> Self::IntoIter {
		self.imp.into_iter()
	}
}

impl<'a> IntoIterator for &'a ProcessSet {
	type Item = &'a Pid;
	type IntoIter = std::slice::Iter<'a, Pid>;

	fn into_iter(self) -> Self::IntoIter {
		self.imp.iter()
	}
}

impl FromIterator<Pid> for ProcessSet {
	fn from_iter<I: IntoIterator<Item = Pid>>(iter: I) -> ProcessSet {
		let mut set = ProcessSet::new();
		for pid in iter {
			set.insert(pid);
		}
		set
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use std::collections::BTreeSet;

	fn set(pids: &[i32]) -> ProcessSet {
		pids.iter().map(|&p| Pid::from_raw(p)).collect()
	}

	fn sorted(s: &ProcessSet) -> Vec<i32> {
		let mut v: Vec<i32> = s.iter().map(|p| p.as_raw()).collect();
		v.sort();
		v
	}

	#[test]
	fn insert_is_duplicate_free() {
		let mut s = ProcessSet::new();
		assert!(s.insert(Pid::from_raw(10)));
		assert!(!s.insert(Pid::from_raw(10)));
		assert_eq!(s.len(), 1);
	}

	#[test]
	fn merge_transfers_ownership() {
		let mut a = set(&[1, 2]);
		let mut b = set(&[3, 4]);
		a.merge(&mut b);
		assert_eq!(sorted(&a), vec![1, 2, 3, 4]);
		assert!(b.is_empty());
	}

	#[test]
	fn remove_exact_reports_presence() {
		let mut s = set(&[5, 6, 7]);
		assert!(s.remove_exact(Pid::from_raw(6)));
		assert!(!s.remove_exact(Pid::from_raw(6)));
		assert_eq!(sorted(&s), vec![5, 7]);
	}

	#[test]
	fn room_is_what_reserve_left() {
		let mut s = ProcessSet::new();
		assert!(!s.has_room());
		s.reserve(1);
		while s.has_room() {
			s.insert(Pid::from_raw(s.len() as i32 + 1));
		}
		assert_eq!(s.len(), s.capacity());
	}

	#[test]
	fn remove_intersection_strips_both_sides() {
		let mut live = set(&[100, 101, 102]);
		let mut reaped = set(&[101, 200]);
		live.remove_intersection(&mut reaped);
		assert_eq!(sorted(&live), vec![100, 102]);
		assert_eq!(sorted(&reaped), vec![200]);
	}

	proptest! {
		#[test]
		fn remove_intersection_properties(
			a in proptest::collection::btree_set(1i32..64, 0..24),
			b in proptest::collection::btree_set(1i32..64, 0..24),
		) {
			let common: BTreeSet<i32> = a.intersection(&b).cloned().collect();
			let mut sa: ProcessSet = a.iter().map(|&p| Pid::from_raw(p)).collect();
			let mut sb: ProcessSet = b.iter().map(|&p| Pid::from_raw(p)).collect();

			sa.remove_intersection(&mut sb);
			let expect_a: Vec<i32> = a.difference(&common).cloned().collect();
			let expect_b: Vec<i32> = b.difference(&common).cloned().collect();
			prop_assert_eq!(sorted(&sa), expect_a.clone());
			prop_assert_eq!(sorted(&sb), expect_b.clone());

			sa.remove_intersection(&mut sb);
			prop_assert_eq!(sorted(&sa), expect_a);
			prop_assert_eq!(sorted(&sb), expect_b);
		}

		#[test]
		fn remove_intersection_is_symmetric(
			a in proptest::collection::btree_set(1i32..64, 0..24),
			b in proptest::collection::btree_set(1i32..64, 0..24),
		) {
			let mut a1: ProcessSet = a.iter().map(|&p| Pid::from_raw(p)).collect();
			let mut b1: ProcessSet = b.iter().map(|&p| Pid::from_raw(p)).collect();
			let mut a2 = a1.clone();
			let mut b2 = b1.clone();

			a1.remove_intersection(&mut b1);
			b2.remove_intersection(&mut a2);
			prop_assert_eq!(sorted(&a1), sorted(&a2));
			prop_assert_eq!(sorted(&b1), sorted(&b2));
		}
	}
}
