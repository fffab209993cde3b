//! The cached filesystem tree: an arena of inodes keyed by stable ids.
//!
//! Parent/child edges are `(id, name -> id)` mappings; nothing holds a
//! raw back-reference. Every inode carries its own rw-lock; the arena map
//! itself is the tree-global lock and is only held for attachment and
//! lookup, never across I/O. Lock order is tree, parent, child.

use crate::error::Error;
use crate::error::Result;
use crate::inode::Inode;
use crate::util::path_components;
use crate::workqueue::WorkQueue;
use log::debug;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Arena id of the volume root.
pub const ROOT_ID: u64 = 1;

/// One arena slot: a stable id plus the locked inode.
pub struct Node {
	/// Stable arena id.
	pub id: u64,
	/// The inode, under its own rw-lock.
	pub state: RwLock<Inode>,
}

/// One step of a streaming path walk.
pub struct WalkStep {
	/// The directory being searched.
	pub parent: Arc<Node>,
	/// Name looked up under `parent`.
	pub name: String,
	/// The resolved child, if cached.
	pub child: Option<Arc<Node>>,
	/// Components still to resolve after `name`.
	pub remaining: Vec<String>,
}

/// The inode cache.
pub struct FsCache {
	nodes: RwLock<HashMap<u64, Arc<Node>>>,
	next_id: AtomicU64,
	doomed: Mutex<Vec<Arc<Node>>>,
	removal: WorkQueue,
}

impl FsCache {
	/// Creates a cache holding only the volume root.
	pub fn new(root: Inode) -> Arc<Self> {
		let mut nodes = HashMap::new();
		nodes.insert(
			ROOT_ID,
			Arc::new(Node {
				id: ROOT_ID,
				state: RwLock::new(root),
			}),
		);
		Arc::new(Self {
			nodes: RwLock::new(nodes),
			next_id: AtomicU64::new(ROOT_ID + 1),
			doomed: Mutex::new(Vec::new()),
			removal: WorkQueue::start("deferred-removal"),
		})
	}

	/// The root node.
	pub fn root(&self) -> Arc<Node> {
		self.node(ROOT_ID).expect("root is never removed")
	}

	/// Looks up a node by arena id.
	pub fn node(&self, id: u64) -> Option<Arc<Node>> {
		self.nodes.read().get(&id).cloned()
	}

	/// Walks `path` from the root, stopping at the deepest cached prefix.
	///
	/// Yields one step per component; the last step has `child == None`
	/// when the tail is not cached.
	pub fn walk(self: &Arc<Self>, path: &str) -> Vec<WalkStep> {
		let comps: Vec<String> = path_components(path)
			.into_iter()
			.map(str::to_owned)
			.collect();
		let mut steps = Vec::new();
		let mut cur = self.root();
		for (i, name) in comps.iter().enumerate() {
			let child_id = cur.state.read().children.get(name).copied();
			let child = child_id.and_then(|id| self.node(id));
			let remaining = comps[i + 1..].to_vec();
			let found = child.clone();
			steps.push(WalkStep {
				parent: Arc::clone(&cur),
				name: name.clone(),
				child,
				remaining,
			});
			match found {
				Some(node) => cur = node,
				None => break,
			}
		}
		steps
	}

	/// Resolves the cached prefix of `path`.
	///
	/// Returns the chain of nodes from the root (inclusive) and the
	/// components that are not cached.
	pub fn resolve_prefix(self: &Arc<Self>, path: &str) -> (Vec<Arc<Node>>, Vec<String>) {
		let mut chain = vec![self.root()];
		let mut remaining = Vec::new();
		for step in self.walk(path) {
			match step.child {
				Some(node) => chain.push(node),
				None => {
					remaining.push(step.name);
					remaining.extend(step.remaining);
					break;
				}
			}
		}
		(chain, remaining)
	}

	/// Resolves a full path, or `NotFound`.
	pub fn resolve(self: &Arc<Self>, path: &str) -> Result<Arc<Node>> {
		let (chain, remaining) = self.resolve_prefix(path);
		if !remaining.is_empty() {
			return Err(Error::NotFound);
		}
		Ok(chain.into_iter().last().expect("chain holds the root"))
	}

	/// Attaches a new inode under `parent`.
	///
	/// Fails with `AlreadyExists` on a name collision.
	pub fn attach(&self, parent: &Arc<Node>, inode: Inode) -> Result<Arc<Node>> {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let name = inode.name.clone();
		let node = Arc::new(Node {
			id,
			state: RwLock::new(inode),
		});

		let mut nodes = self.nodes.write();
		let mut parent_state = parent.state.write();
		if parent_state.children.contains_key(&name) {
			return Err(Error::AlreadyExists);
		}
		parent_state.children.insert(name, id);
		parent_state.num_children += 1;
		nodes.insert(id, Arc::clone(&node));
		Ok(node)
	}

	/// Attaches a chain of inodes (each the parent of the next) under
	/// `parent`, atomically.
	///
	/// The graft is built detached and attached by its root; a name
	/// collision at the attach point fails the whole graft.
	pub fn attach_graft(&self, parent: &Arc<Node>, chain: Vec<Inode>) -> Result<Vec<Arc<Node>>> {
		if chain.is_empty() {
			return Ok(Vec::new());
		}

		let mut grafted: Vec<Arc<Node>> = Vec::with_capacity(chain.len());
		for inode in chain {
			let id = self.next_id.fetch_add(1, Ordering::SeqCst);
			grafted.push(Arc::new(Node {
				id,
				state: RwLock::new(inode),
			}));
		}
		// wire the detached edges
		for pair in grafted.windows(2) {
			let child = &pair[1];
			let name = child.state.read().name.clone();
			let mut parent_state = pair[0].state.write();
			parent_state.children.insert(name, child.id);
			parent_state.num_children += 1;
		}

		let root_name = grafted[0].state.read().name.clone();
		let mut nodes = self.nodes.write();
		let mut parent_state = parent.state.write();
		if parent_state.children.contains_key(&root_name) {
			return Err(Error::AlreadyExists);
		}
		parent_state.children.insert(root_name, grafted[0].id);
		parent_state.num_children += 1;
		for node in &grafted {
			nodes.insert(node.id, Arc::clone(node));
		}
		Ok(grafted)
	}

	/// Renames a child of `parent`.
	pub fn rename_child(&self, parent: &Arc<Node>, old_name: &str, new_name: &str) -> Result<()> {
		let mut parent_state = parent.state.write();
		if parent_state.children.contains_key(new_name) {
			return Err(Error::AlreadyExists);
		}
		let id = parent_state
			.children
			.remove(old_name)
			.ok_or(Error::NotFound)?;
		parent_state.children.insert(new_name.to_owned(), id);
		drop(parent_state);

		if let Some(node) = self.node(id) {
			node.state.write().name = new_name.to_owned();
		}
		Ok(())
	}

	/// Moves a child of `old_parent` under `new_parent`, renaming it.
	///
	/// A same-parent move is a plain rename. Distinct parents are locked
	/// in ascending arena-id order.
	pub fn move_child(
		&self,
		old_parent: &Arc<Node>,
		old_name: &str,
		new_parent: &Arc<Node>,
		new_name: &str,
	) -> Result<()> {
		if old_parent.id == new_parent.id {
			return self.rename_child(old_parent, old_name, new_name);
		}

		let (first, second) = if old_parent.id < new_parent.id {
			(old_parent, new_parent)
		} else {
			(new_parent, old_parent)
		};
		let mut first_state = first.state.write();
		let mut second_state = second.state.write();
		let (old_state, new_state) = if first.id == old_parent.id {
			(&mut *first_state, &mut *second_state)
		} else {
			(&mut *second_state, &mut *first_state)
		};

		if new_state.children.contains_key(new_name) {
			return Err(Error::AlreadyExists);
		}
		let id = old_state.children.remove(old_name).ok_or(Error::NotFound)?;
		old_state.num_children = old_state.num_children.saturating_sub(1);
		new_state.children.insert(new_name.to_owned(), id);
		new_state.num_children += 1;
		let new_parent_file_id = new_state.file_id;
		drop(first_state);
		drop(second_state);

		if let Some(node) = self.node(id) {
			let mut state = node.state.write();
			state.name = new_name.to_owned();
			state.parent_id = new_parent_file_id;
		}
		Ok(())
	}

	/// Records an open handle on a node.
	pub fn open(&self, node: &Arc<Node>) {
		node.state.write().open_count += 1;
	}

	/// Releases an open handle; a deleted node with no remaining handles
	/// is reaped.
	pub fn close(self: &Arc<Self>, node: &Arc<Node>) {
		let mut state = node.state.write();
		state.open_count = state.open_count.saturating_sub(1);
		let reap = state.deleted && state.open_count == 0;
		drop(state);
		if reap {
			self.doomed.lock().retain(|n| n.id != node.id);
			debug!("reaped inode {:X} on last close", node.state.read().file_id);
		}
	}

	/// Detaches `name` under `parent` and schedules the subtree for
	/// removal once no open handles remain.
	///
	/// The name disappears immediately (a fresh create may reuse it);
	/// nodes with live handles stay readable until their last close.
	pub fn deferred_remove(self: &Arc<Self>, parent: &Arc<Node>, name: &str) -> Result<()> {
		let detached = {
			let mut nodes = self.nodes.write();
			let mut parent_state = parent.state.write();
			let id = parent_state.children.remove(name).ok_or(Error::NotFound)?;
			parent_state.num_children = parent_state.num_children.saturating_sub(1);
			drop(parent_state);

			// collect the whole subtree while the tree lock is held
			let mut subtree = vec![id];
			let mut i = 0;
			while i < subtree.len() {
				if let Some(node) = nodes.get(&subtree[i]) {
					let state = node.state.read();
					subtree.extend(state.children.values().copied());
				}
				i += 1;
			}
			let detached: Vec<Arc<Node>> = subtree.iter().filter_map(|id| nodes.remove(id)).collect();
			detached
		};

		let cache = Arc::clone(self);
		self.removal.add(move || {
			for node in detached {
				let mut state = node.state.write();
				state.deleted = true;
				let busy = state.open_count > 0;
				drop(state);
				if busy {
					cache.doomed.lock().push(node);
				}
			}
			Ok(())
		});
		Ok(())
	}

	/// Waits for queued removals to complete; test and shutdown aid.
	pub fn drain_removals(&self) {
		self.removal.add_promise(|| Ok(())).wait().ok();
	}

	/// Number of live nodes, the root included.
	pub fn len(&self) -> usize {
		self.nodes.read().len()
	}

	/// Tells whether only the root remains.
	pub fn is_empty(&self) -> bool {
		self.len() <= 1
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ms::EntryType;
	use crate::ms::MdEntry;
	use crate::util::TimeSpec;

	fn md(name: &str, entry_type: EntryType, file_id: u64) -> MdEntry {
		MdEntry {
			entry_type,
			name: name.to_owned(),
			file_id,
			version: 1,
			owner: 1,
			coordinator: 10,
			volume: 1,
			mode: 0o755,
			size: 0,
			ctime: TimeSpec::new(1, 0),
			mtime: TimeSpec::new(1, 0),
			manifest_mtime: TimeSpec::new(1, 0),
			write_nonce: 1,
			xattr_nonce: 1,
			generation: 1,
			num_children: 0,
			parent_id: 0,
			max_read_freshness: 5000,
			max_write_freshness: 0,
		}
	}

	fn cache_with_tree() -> Arc<FsCache> {
		let cache = FsCache::new(Inode::from_md_entry(&md("/", EntryType::Dir, 1)));
		let root = cache.root();
		let d = cache
			.attach(&root, Inode::from_md_entry(&md("d", EntryType::Dir, 2)))
			.unwrap();
		cache
			.attach(&d, Inode::from_md_entry(&md("f.txt", EntryType::File, 3)))
			.unwrap();
		cache
	}

	#[test]
	fn resolve_full_and_prefix() {
		let cache = cache_with_tree();
		let node = cache.resolve("/d/f.txt").unwrap();
		assert_eq!(node.state.read().file_id, 3);

		let (chain, remaining) = cache.resolve_prefix("/d/missing/deeper");
		assert_eq!(chain.len(), 2);
		assert_eq!(remaining, vec!["missing".to_owned(), "deeper".to_owned()]);

		assert!(matches!(cache.resolve("/nope"), Err(Error::NotFound)));
	}

	#[test]
	fn walk_stops_at_deepest_cached() {
		let cache = cache_with_tree();
		let steps = cache.walk("/d/f.txt/x");
		// f.txt resolves, x does not get a step past it
		assert_eq!(steps.len(), 3);
		assert!(steps[0].child.is_some());
		assert!(steps[1].child.is_some());
		assert!(steps[2].child.is_none());
		assert_eq!(steps[1].remaining, vec!["x".to_owned()]);
	}

	#[test]
	fn attach_collision() {
		let cache = cache_with_tree();
		let root = cache.root();
		let r = cache.attach(&root, Inode::from_md_entry(&md("d", EntryType::Dir, 9)));
		assert!(matches!(r, Err(Error::AlreadyExists)));
	}

	#[test]
	fn graft_attaches_atomically() {
		let cache = cache_with_tree();
		let root = cache.root();
		let chain = vec![
			Inode::from_md_entry(&md("a", EntryType::Dir, 20)),
			Inode::from_md_entry(&md("b", EntryType::Dir, 21)),
			Inode::from_md_entry(&md("c.txt", EntryType::File, 22)),
		];
		cache.attach_graft(&root, chain).unwrap();
		assert_eq!(cache.resolve("/a/b/c.txt").unwrap().state.read().file_id, 22);

		// colliding graft root fails without attaching anything
		let chain = vec![
			Inode::from_md_entry(&md("a", EntryType::Dir, 30)),
			Inode::from_md_entry(&md("z", EntryType::Dir, 31)),
		];
		assert!(matches!(
			cache.attach_graft(&root, chain),
			Err(Error::AlreadyExists)
		));
		assert!(cache.resolve("/a/z").is_err());
	}

	#[test]
	fn rename_child_in_place() {
		let cache = cache_with_tree();
		let d = cache.resolve("/d").unwrap();
		cache.rename_child(&d, "f.txt", "g.txt").unwrap();
		assert!(cache.resolve("/d/f.txt").is_err());
		let g = cache.resolve("/d/g.txt").unwrap();
		assert_eq!(g.state.read().name, "g.txt");
	}

	#[test]
	fn move_child_across_parents() {
		let cache = cache_with_tree();
		let root = cache.root();
		let e = cache
			.attach(&root, Inode::from_md_entry(&md("e", EntryType::Dir, 4)))
			.unwrap();
		let d = cache.resolve("/d").unwrap();

		cache.move_child(&d, "f.txt", &e, "g.txt").unwrap();
		assert!(cache.resolve("/d/f.txt").is_err());
		let moved = cache.resolve("/e/g.txt").unwrap();
		{
			let state = moved.state.read();
			assert_eq!(state.name, "g.txt");
			assert_eq!(state.parent_id, 4);
		}
		assert_eq!(d.state.read().num_children, 0);
		assert_eq!(e.state.read().num_children, 1);

		// a name collision under the destination fails the move
		cache
			.attach(&d, Inode::from_md_entry(&md("h.txt", EntryType::File, 5)))
			.unwrap();
		cache
			.attach(&e, Inode::from_md_entry(&md("h.txt", EntryType::File, 6)))
			.unwrap();
		assert!(matches!(
			cache.move_child(&d, "h.txt", &e, "h.txt"),
			Err(Error::AlreadyExists)
		));
		assert!(cache.resolve("/d/h.txt").is_ok());
	}

	#[test]
	fn deferred_removal_preserves_open_handles() {
		let cache = cache_with_tree();
		let f = cache.resolve("/d/f.txt").unwrap();
		cache.open(&f);

		let d = cache.resolve("/d").unwrap();
		cache.deferred_remove(&d, "f.txt").unwrap();
		cache.drain_removals();

		// name is gone, node data still readable through the handle
		assert!(cache.resolve("/d/f.txt").is_err());
		assert_eq!(f.state.read().file_id, 3);
		assert!(f.state.read().deleted);

		cache.close(&f);
	}

	#[test]
	fn subtree_removal() {
		let cache = cache_with_tree();
		let root = cache.root();
		let before = cache.len();
		cache.deferred_remove(&root, "d").unwrap();
		cache.drain_removals();
		assert_eq!(cache.len(), before - 2);
		assert!(cache.resolve("/d").is_err());
	}
}
