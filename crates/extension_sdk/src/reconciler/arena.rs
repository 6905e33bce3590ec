//! Generational arena holding reconciled instances.
//!
//! Children form an intrusive doubly-linked list through `prev`/`next`
//! sibling ids, so inserting before a sibling and removing a child are O(1)
//! and never shift other children. The parent link is a plain id lookup, not
//! an owning pointer.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use crate::bus::{Callback, HandlerId, HandlerRegistration, MessageBus};

use super::element::Prop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    index: u32,
    generation: u32,
}

/// Callback prop bound to a stable handler id. A new render swaps the
/// callback in the cell; the id the host knows stays the same.
pub(crate) struct HandlerSlot {
    callback: Arc<RwLock<Callback>>,
    registration: Option<HandlerRegistration>,
}

impl HandlerSlot {
    pub(crate) fn new(callback: Callback) -> Self {
        Self { callback: Arc::new(RwLock::new(callback)), registration: None }
    }

    pub(crate) fn replace(&self, callback: Callback) {
        if let Ok(mut cell) = self.callback.write() {
            *cell = callback;
        }
    }

    /// Registers with the bus on first use.
    pub(crate) fn ensure_registered(&mut self, bus: &MessageBus) -> HandlerId {
        if let Some(registration) = &self.registration {
            return registration.id().clone();
        }
        let cell = self.callback.clone();
        let registration = bus.register_handler(move |incoming| {
            let callback = match cell.read() {
                Ok(cb) => cb.clone(),
                Err(_) => return,
            };
            callback(incoming);
        });
        let id = registration.id().clone();
        self.registration = Some(registration);
        id
    }

    pub(crate) fn id(&self) -> Option<&HandlerId> {
        self.registration.as_ref().map(|r| r.id())
    }

    pub(crate) fn teardown(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.unregister();
        }
    }
}

pub struct Instance {
    pub(crate) kind: String,
    pub(crate) props: BTreeMap<String, Prop>,
    pub(crate) handlers: BTreeMap<String, HandlerSlot>,
    pub(crate) props_dirty: bool,
    pub(crate) structure_dirty: bool,
    pub(crate) parent: Option<InstanceId>,
    first_child: Option<InstanceId>,
    last_child: Option<InstanceId>,
    prev_sibling: Option<InstanceId>,
    next_sibling: Option<InstanceId>,
    child_count: usize,
}

impl Instance {
    /// Fresh instances start fully dirty: nothing about them has been sent.
    pub(crate) fn new(kind: String) -> Self {
        Self {
            kind,
            props: BTreeMap::new(),
            handlers: BTreeMap::new(),
            props_dirty: true,
            structure_dirty: true,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
            child_count: 0,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn prop(&self, key: &str) -> Option<&Prop> {
        self.props.get(key)
    }

    /// Handler id for a callback prop, once a commit registered it.
    pub fn handler_id(&self, key: &str) -> Option<&HandlerId> {
        self.handlers.get(key).and_then(HandlerSlot::id)
    }

    pub fn is_props_dirty(&self) -> bool {
        self.props_dirty
    }

    pub fn is_structure_dirty(&self) -> bool {
        self.structure_dirty
    }

    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.child_count
    }
}

struct Slot {
    generation: u32,
    instance: Option<Instance>,
}

#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, instance: Instance) -> InstanceId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.instance = Some(instance);
            return InstanceId { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, instance: Some(instance) });
        InstanceId { index, generation: 0 }
    }

    /// Frees the slot. The caller detaches the instance from its siblings first.
    pub fn remove(&mut self, id: InstanceId) -> Option<Instance> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let instance = slot.instance.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(instance)
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.instance.as_ref()
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.instance.as_mut()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.get(id).is_some()
    }

    pub fn first_child(&self, id: InstanceId) -> Option<InstanceId> {
        self.get(id).and_then(|i| i.first_child)
    }

    pub fn next_sibling(&self, id: InstanceId) -> Option<InstanceId> {
        self.get(id).and_then(|i| i.next_sibling)
    }

    pub fn children(&self, id: InstanceId) -> Children<'_> {
        Children { arena: self, next: self.first_child(id) }
    }

    pub fn append_child(&mut self, parent: InstanceId, child: InstanceId) {
        let Some(last) = self.get(parent).map(|p| p.last_child) else { return };
        if let Some(c) = self.get_mut(child) {
            c.parent = Some(parent);
            c.prev_sibling = last;
            c.next_sibling = None;
        }
        match last {
            Some(last) => {
                if let Some(l) = self.get_mut(last) {
                    l.next_sibling = Some(child);
                }
            }
            None => {
                if let Some(p) = self.get_mut(parent) {
                    p.first_child = Some(child);
                }
            }
        }
        if let Some(p) = self.get_mut(parent) {
            p.last_child = Some(child);
            p.child_count += 1;
        }
    }

    pub fn insert_before(&mut self, parent: InstanceId, child: InstanceId, before: InstanceId) {
        let Some(prev) = self.get(before).map(|b| b.prev_sibling) else {
            self.append_child(parent, child);
            return;
        };
        if let Some(c) = self.get_mut(child) {
            c.parent = Some(parent);
            c.prev_sibling = prev;
            c.next_sibling = Some(before);
        }
        if let Some(b) = self.get_mut(before) {
            b.prev_sibling = Some(child);
        }
        match prev {
            Some(prev) => {
                if let Some(p) = self.get_mut(prev) {
                    p.next_sibling = Some(child);
                }
            }
            None => {
                if let Some(p) = self.get_mut(parent) {
                    p.first_child = Some(child);
                }
            }
        }
        if let Some(p) = self.get_mut(parent) {
            p.child_count += 1;
        }
    }

    /// Unlinks `child` from its parent's list; the instance stays in the arena.
    pub fn detach(&mut self, child: InstanceId) {
        let Some((parent, prev, next)) = self.get(child).map(|c| (c.parent, c.prev_sibling, c.next_sibling)) else {
            return;
        };
        match prev {
            Some(prev) => {
                if let Some(p) = self.get_mut(prev) {
                    p.next_sibling = next;
                }
            }
            None => {
                if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
                    p.first_child = next;
                }
            }
        }
        match next {
            Some(next) => {
                if let Some(n) = self.get_mut(next) {
                    n.prev_sibling = prev;
                }
            }
            None => {
                if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
                    p.last_child = prev;
                }
            }
        }
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.child_count -= 1;
        }
        if let Some(c) = self.get_mut(child) {
            c.parent = None;
            c.prev_sibling = None;
            c.next_sibling = None;
        }
    }
}

pub struct Children<'a> {
    arena: &'a Arena,
    next: Option<InstanceId>,
}

impl Iterator for Children<'_> {
    type Item = InstanceId;

    fn next(&mut self) -> Option<InstanceId> {
        let current = self.next?;
        self.next = self.arena.next_sibling(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(arena: &Arena, parent: InstanceId) -> Vec<String> {
        arena.children(parent).map(|c| arena.get(c).unwrap().kind.clone()).collect()
    }

    #[test]
    fn linked_children_keep_order() {
        let mut arena = Arena::new();
        let root = arena.insert(Instance::new("root".into()));
        let a = arena.insert(Instance::new("a".into()));
        let c = arena.insert(Instance::new("c".into()));
        let b = arena.insert(Instance::new("b".into()));
        arena.append_child(root, a);
        arena.append_child(root, c);
        arena.insert_before(root, b, c);
        assert_eq!(kinds(&arena, root), ["a", "b", "c"]);

        let z = arena.insert(Instance::new("z".into()));
        arena.insert_before(root, z, a);
        assert_eq!(kinds(&arena, root), ["z", "a", "b", "c"]);
        assert_eq!(arena.get(root).unwrap().child_count(), 4);

        arena.detach(b);
        arena.detach(z);
        arena.detach(c);
        assert_eq!(kinds(&arena, root), ["a"]);
        assert_eq!(arena.get(b).unwrap().parent(), None);
        assert_eq!(arena.get(root).unwrap().child_count(), 1);
    }

    #[test]
    fn stale_ids_do_not_resolve_after_reuse() {
        let mut arena = Arena::new();
        let first = arena.insert(Instance::new("first".into()));
        assert!(arena.remove(first).is_some());
        let second = arena.insert(Instance::new("second".into()));

        assert_ne!(first, second);
        assert!(!arena.contains(first));
        assert_eq!(arena.get(second).unwrap().kind(), "second");
        assert_eq!(arena.len(), 1);
    }
}
