//! Reusable thread-state buffers and the free/in-use lists that recycle them.
//!
//! # Architecture
//!
//! A [`ThreadState`] is one archived thread's snapshot: an id, a terminate-on-restore flag
//! and a fixed-size byte buffer sized once, at creation, to the registry's total per-thread
//! footprint. States are allocated on first need and then recycled forever - never freed
//! while the process runs - cycling between two circular doubly linked lists with sentinel
//! anchor nodes: the free list (available buffers) and the in-use list (currently archived
//! threads). A state is in exactly one list at a time; the anchors are never real entries.
//!
//! The lists live in a [`ThreadStateSet`] arena indexed by [`ThreadStateId`], which keeps
//! the link manipulation in safe code while preserving constant-time unlink/relink.

use std::thread;

/// The id value meaning "no thread id assigned".
///
/// Real ids start at 1: an id of 0 cannot be told apart from an absent per-thread entry.
pub const INVALID_THREAD_ID: u32 = 0;

/// An opaque thread identity: invalid, or a concrete OS thread.
///
/// Used for the lock-owner record and the lazy-archive slot. There is no distinct
/// "self" variant; `current()` captures the calling thread's identity and
/// `is_current()` resolves a stored handle against whoever asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadHandle {
    /// No thread.
    Invalid,
    /// A concrete OS thread identity.
    Known(thread::ThreadId),
}

impl ThreadHandle {
    /// A handle denoting the calling thread.
    #[must_use]
    pub fn current() -> Self {
        ThreadHandle::Known(thread::current().id())
    }

    /// Returns `true` unless the handle is [`ThreadHandle::Invalid`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self, ThreadHandle::Invalid)
    }

    /// Returns `true` if the handle denotes the calling thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        matches!(self, ThreadHandle::Known(id) if *id == thread::current().id())
    }
}

/// One archived thread's snapshot: id, terminate flag and state buffer.
pub struct ThreadState {
    id: u32,
    terminate_on_restore: bool,
    data: Box<[u8]>,
}

impl ThreadState {
    fn new(footprint: usize) -> Self {
        ThreadState {
            id: INVALID_THREAD_ID,
            terminate_on_restore: false,
            data: vec![0; footprint].into_boxed_slice(),
        }
    }

    /// The id of the thread this state belongs to, or [`INVALID_THREAD_ID`] when free.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Stamp the owning thread's id.
    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    /// Whether interpreter execution should terminate when this state is restored.
    #[must_use]
    pub fn terminate_on_restore(&self) -> bool {
        self.terminate_on_restore
    }

    /// Set or clear the terminate-on-restore flag.
    pub fn set_terminate_on_restore(&mut self, terminate: bool) {
        self.terminate_on_restore = terminate;
    }

    /// The archived state buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the archived state buffer.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Index of a [`ThreadState`] inside a [`ThreadStateSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStateId(usize);

/// Which of the two lists to link a state into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateList {
    /// Available buffers, ready for reuse.
    Free,
    /// Buffers holding a currently archived thread.
    InUse,
}

struct Node {
    prev: usize,
    next: usize,
    /// `None` only for the two sentinel anchors
    state: Option<ThreadState>,
}

/// Arena owning every [`ThreadState`] ever allocated, plus the two circular lists.
pub struct ThreadStateSet {
    nodes: Vec<Node>,
}

const FREE_ANCHOR: usize = 0;
const IN_USE_ANCHOR: usize = 1;

impl ThreadStateSet {
    /// Create an empty set: two sentinel anchors, no states.
    #[must_use]
    pub fn new() -> Self {
        ThreadStateSet {
            nodes: vec![
                Node {
                    prev: FREE_ANCHOR,
                    next: FREE_ANCHOR,
                    state: None,
                },
                Node {
                    prev: IN_USE_ANCHOR,
                    next: IN_USE_ANCHOR,
                    state: None,
                },
            ],
        }
    }

    fn anchor(list: StateList) -> usize {
        match list {
            StateList::Free => FREE_ANCHOR,
            StateList::InUse => IN_USE_ANCHOR,
        }
    }

    /// Take the free list's head, or allocate a new state with a `footprint`-sized buffer
    /// if the free list is empty.
    ///
    /// A newly allocated state is self-linked (in no list); a reused one is still linked
    /// into the free list. Either way the caller unlinks it before use.
    pub fn get_free(&mut self, footprint: usize) -> ThreadStateId {
        let head = self.nodes[FREE_ANCHOR].next;
        if head != FREE_ANCHOR {
            return ThreadStateId(head);
        }
        let index = self.nodes.len();
        self.nodes.push(Node {
            prev: index,
            next: index,
            state: Some(ThreadState::new(footprint)),
        });
        ThreadStateId(index)
    }

    /// Remove a state from whatever list it is in. No-op for a self-linked state.
    pub fn unlink(&mut self, id: ThreadStateId) {
        let (prev, next) = (self.nodes[id.0].prev, self.nodes[id.0].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[id.0].prev = id.0;
        self.nodes[id.0].next = id.0;
    }

    /// Link a state in at the head of the given list.
    ///
    /// # Panics
    /// If the state is still linked into a list.
    pub fn link_into(&mut self, id: ThreadStateId, list: StateList) {
        contract!(
            self.nodes[id.0].next == id.0,
            "link_into on a state that is still in a list"
        );
        let anchor = Self::anchor(list);
        let head = self.nodes[anchor].next;
        self.nodes[id.0].next = head;
        self.nodes[id.0].prev = anchor;
        self.nodes[anchor].next = id.0;
        self.nodes[head].prev = id.0;
    }

    /// Borrow a state.
    ///
    /// # Panics
    /// If `id` names a sentinel anchor.
    #[must_use]
    pub fn state(&self, id: ThreadStateId) -> &ThreadState {
        self.nodes[id.0]
            .state
            .as_ref()
            .expect("sentinel anchors hold no state")
    }

    /// Mutably borrow a state.
    ///
    /// # Panics
    /// If `id` names a sentinel anchor.
    pub fn state_mut(&mut self, id: ThreadStateId) -> &mut ThreadState {
        self.nodes[id.0]
            .state
            .as_mut()
            .expect("sentinel anchors hold no state")
    }

    /// The first archived state, if any.
    #[must_use]
    pub fn first_in_use(&self) -> Option<ThreadStateId> {
        let head = self.nodes[IN_USE_ANCHOR].next;
        (head != IN_USE_ANCHOR).then_some(ThreadStateId(head))
    }

    /// The archived state after `id`, if any.
    #[must_use]
    pub fn next_in_use(&self, id: ThreadStateId) -> Option<ThreadStateId> {
        let next = self.nodes[id.0].next;
        (next != IN_USE_ANCHOR).then_some(ThreadStateId(next))
    }

    /// Number of states currently in the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.count_list(FREE_ANCHOR)
    }

    /// Number of states currently in the in-use list.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.count_list(IN_USE_ANCHOR)
    }

    fn count_list(&self, anchor: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.nodes[anchor].next;
        while cursor != anchor {
            count += 1;
            cursor = self.nodes[cursor].next;
        }
        count
    }
}

impl Default for ThreadStateSet {
    fn default() -> Self {
        Self::new()
    }
}
