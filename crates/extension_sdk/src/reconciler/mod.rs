//! Reconciles repeated declarative UI snapshots into one persistent instance
//! tree with dirty tracking.
//!
//! A pass goes Building (the extension builds an [`Element`]) → Diffing
//! ([`Container::reconcile`]) → CommitScheduled (the [`RenderLoop`] arms its
//! debounce deadline) → Committed ([`Container::commit`]) → Idle.
//!
//! Nodes are matched by type and position within their parent. A match is
//! updated in place and keeps its [`InstanceId`]; a mismatch replaces the whole
//! subtree at that position.

mod arena;
mod element;
mod render_loop;

use serde_json::{Map, Value};
use tracing::trace;

use crate::{
    bus::MessageBus,
    message::{RenderCommit, SerializedInstance},
};

pub use arena::{Arena, Children, Instance, InstanceId};
pub use element::{Element, Prop};
pub use render_loop::{spawn_render_loop, RenderHandle, RenderLoop, DEFAULT_COMMIT_INTERVAL};

use arena::HandlerSlot;

pub struct Container {
    bus: MessageBus,
    arena: Arena,
    root: Option<InstanceId>,
}

impl Container {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus, arena: Arena::new(), root: None }
    }

    pub fn root_id(&self) -> Option<InstanceId> {
        self.root
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.arena.get(id)
    }

    pub fn children(&self, id: InstanceId) -> Vec<InstanceId> {
        self.arena.children(id).collect()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.root
            .and_then(|r| self.arena.get(r))
            .map(|r| r.structure_dirty || r.props_dirty)
            .unwrap_or(false)
    }

    /// Every instance with either dirty flag set, in tree order.
    pub fn dirty_instances(&self) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut stack: Vec<InstanceId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(instance) = self.arena.get(id) else { continue };
            if instance.structure_dirty || instance.props_dirty {
                out.push(id);
            }
            let mut children = self.children(id);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    // -------------------------------------------------------------------------
    // Diffing
    // -------------------------------------------------------------------------

    pub fn reconcile(&mut self, element: Element) {
        match self.root {
            Some(root) if self.arena.get(root).map(|r| r.kind == element.kind).unwrap_or(false) => {
                self.update(root, element);
            }
            Some(root) => {
                trace!(kind = %element.kind, "root type changed, remounting");
                self.unmount(root);
                self.root = Some(self.mount(element));
            }
            None => {
                self.root = Some(self.mount(element));
            }
        }
    }

    fn mount(&mut self, element: Element) -> InstanceId {
        let Element { kind, props, children } = element;
        let mut instance = Instance::new(kind);
        for (key, prop) in props {
            match prop {
                Prop::Callback(cb) => {
                    instance.handlers.insert(key, HandlerSlot::new(cb));
                }
                value => {
                    instance.props.insert(key, value);
                }
            }
        }
        let id = self.arena.insert(instance);
        for child in children {
            let child_id = self.mount(child);
            self.arena.append_child(id, child_id);
        }
        id
    }

    fn update(&mut self, id: InstanceId, element: Element) {
        let Element { props, children, .. } = element;
        if self.apply_props(id, props) {
            self.mark_props_dirty(id);
        }
        self.reconcile_children(id, children);
    }

    /// Returns whether any serialisable prop changed. Swapping one callback
    /// for another under the same key is not a change.
    fn apply_props(&mut self, id: InstanceId, props: std::collections::BTreeMap<String, Prop>) -> bool {
        let Some(instance) = self.arena.get_mut(id) else { return false };
        let mut changed = false;

        let stale_values: Vec<String> = instance.props.keys().filter(|k| !props.contains_key(*k)).cloned().collect();
        for key in stale_values {
            instance.props.remove(&key);
            changed = true;
        }
        let stale_handlers: Vec<String> = instance
            .handlers
            .keys()
            .filter(|k| !matches!(props.get(*k), Some(Prop::Callback(_))))
            .cloned()
            .collect();
        for key in stale_handlers {
            if let Some(mut slot) = instance.handlers.remove(&key) {
                slot.teardown();
            }
            changed = true;
        }

        for (key, prop) in props {
            match prop {
                Prop::Callback(cb) => match instance.handlers.get(&key) {
                    Some(slot) => slot.replace(cb),
                    None => {
                        instance.props.remove(&key);
                        instance.handlers.insert(key, HandlerSlot::new(cb));
                        changed = true;
                    }
                },
                value => {
                    let same = instance.props.get(&key).map(|old| old.same_value(&value)).unwrap_or(false);
                    if !same {
                        instance.props.insert(key, value);
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    fn reconcile_children(&mut self, parent: InstanceId, children: Vec<Element>) {
        let mut cursor = self.arena.first_child(parent);
        let mut structure_changed = false;

        for element in children {
            match cursor {
                Some(existing) => {
                    let next = self.arena.next_sibling(existing);
                    let same_kind = self.arena.get(existing).map(|i| i.kind == element.kind).unwrap_or(false);
                    if same_kind {
                        self.update(existing, element);
                    } else {
                        let fresh = self.mount(element);
                        self.arena.insert_before(parent, fresh, existing);
                        self.unmount(existing);
                        structure_changed = true;
                    }
                    cursor = next;
                }
                None => {
                    let fresh = self.mount(element);
                    self.arena.append_child(parent, fresh);
                    structure_changed = true;
                }
            }
        }

        while let Some(existing) = cursor {
            cursor = self.arena.next_sibling(existing);
            self.unmount(existing);
            structure_changed = true;
        }

        if structure_changed {
            self.mark_structure_dirty(parent);
        }
    }

    /// Detaches `id` and destroys its subtree, unregistering every handler id
    /// it owned from the bus.
    fn unmount(&mut self, id: InstanceId) {
        self.arena.detach(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            stack.extend(self.arena.children(current));
            if let Some(mut instance) = self.arena.remove(current) {
                for slot in instance.handlers.values_mut() {
                    slot.teardown();
                }
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
    }

    fn mark_props_dirty(&mut self, id: InstanceId) {
        let parent = match self.arena.get_mut(id) {
            Some(instance) => {
                instance.props_dirty = true;
                instance.parent
            }
            None => return,
        };
        self.propagate_from(parent);
    }

    fn mark_structure_dirty(&mut self, id: InstanceId) {
        self.propagate_from(Some(id));
    }

    /// Sets `structure_dirty` from `start` up to the root, stopping at the
    /// first ancestor that is already dirty: its own ancestors are dirty too.
    fn propagate_from(&mut self, start: Option<InstanceId>) {
        let mut current = start;
        while let Some(id) = current {
            let Some(instance) = self.arena.get_mut(id) else { break };
            if instance.structure_dirty {
                break;
            }
            instance.structure_dirty = true;
            current = instance.parent;
        }
    }

    // -------------------------------------------------------------------------
    // Commit
    // -------------------------------------------------------------------------

    /// Serialises the tree if anything changed since the last commit, then
    /// clears every dirty flag. Callback props become handler ids registered
    /// on the bus.
    pub fn commit(&mut self) -> Option<RenderCommit> {
        let root = self.root?;
        if !self.is_dirty() {
            return None;
        }
        let serialized = self.serialize(root)?;
        self.clear_dirty(root);
        Some(RenderCommit { root: serialized })
    }

    fn serialize(&mut self, id: InstanceId) -> Option<SerializedInstance> {
        let bus = self.bus.clone();
        let instance = self.arena.get_mut(id)?;

        let mut props: Map<String, Value> = instance.props.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        for (key, slot) in instance.handlers.iter_mut() {
            let handler = slot.ensure_registered(&bus);
            props.insert(key.clone(), Value::String(handler.to_string()));
        }
        let kind = instance.kind.clone();

        let child_ids = self.children(id);
        let children = child_ids.into_iter().filter_map(|c| self.serialize(c)).collect();
        Some(SerializedInstance { kind, props, children })
    }

    /// Clean subtrees have clean descendants, so only dirty nodes are descended.
    fn clear_dirty(&mut self, root: InstanceId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(instance) = self.arena.get_mut(id) else { continue };
            let descend = instance.structure_dirty;
            instance.structure_dirty = false;
            instance.props_dirty = false;
            if descend {
                stack.extend(self.arena.children(id));
            }
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Some(root) = self.root {
            self.unmount(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Event;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn item(title: &str) -> Element {
        Element::new("Item").prop("title", title)
    }

    fn list(titles: &[&str]) -> Element {
        Element::new("List")
            .child(Element::new("Section").prop("title", "A").children(titles.iter().map(|t| item(t))))
            .child(Element::new("Section").prop("title", "B").child(item("other")))
    }

    fn container() -> Container {
        let (bus, _rx) = MessageBus::channel();
        Container::new(bus)
    }

    #[test]
    fn first_render_commits_whole_tree_once() {
        let mut c = container();
        c.reconcile(Element::new("Detail").prop("markdown", "# hi"));
        let commit = c.commit().expect("first commit");
        assert_eq!(
            serde_json::to_value(&commit).unwrap(),
            json!({"root": {"type": "Detail", "props": {"markdown": "# hi"}, "children": []}})
        );
        assert!(c.commit().is_none());
        assert!(c.dirty_instances().is_empty());
    }

    #[test]
    fn single_leaf_change_only_dirties_leaf_and_ancestors() {
        let mut c = container();
        c.reconcile(list(&["one", "two"]));
        c.commit();

        let root = c.root_id().unwrap();
        let sections = c.children(root);
        let leaves_a = c.children(sections[0]);
        let leaf_b = c.children(sections[1])[0];

        c.reconcile(list(&["one", "TWO"]));

        assert_eq!(c.root_id(), Some(root));
        assert_eq!(c.children(root), sections);
        assert_eq!(c.children(sections[0]), leaves_a);

        let changed = c.get(leaves_a[1]).unwrap();
        assert!(changed.is_props_dirty());
        assert!(!changed.is_structure_dirty());

        let section = c.get(sections[0]).unwrap();
        assert!(section.is_structure_dirty() && !section.is_props_dirty());
        let root_inst = c.get(root).unwrap();
        assert!(root_inst.is_structure_dirty() && !root_inst.is_props_dirty());

        let untouched = c.get(leaves_a[0]).unwrap();
        assert!(!untouched.is_props_dirty() && !untouched.is_structure_dirty());
        let sibling = c.get(sections[1]).unwrap();
        assert!(!sibling.is_props_dirty() && !sibling.is_structure_dirty());
        assert!(!c.get(leaf_b).unwrap().is_props_dirty());

        assert_eq!(c.dirty_instances(), vec![root, sections[0], leaves_a[1]]);
    }

    #[test]
    fn identical_render_stays_clean() {
        let mut c = container();
        c.reconcile(list(&["one"]));
        c.commit();
        c.reconcile(list(&["one"]));
        assert!(!c.is_dirty());
        assert!(c.commit().is_none());
    }

    #[test]
    fn type_change_replaces_subtree_in_place() {
        let mut c = container();
        c.reconcile(Element::new("List").children(vec![item("a"), item("b"), item("c")]));
        c.commit();
        let root = c.root_id().unwrap();
        let before = c.children(root);

        c.reconcile(Element::new("List").children(vec![item("a"), Element::new("Separator"), item("c")]));

        let after = c.children(root);
        assert_eq!(after.len(), 3);
        assert_eq!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert_eq!(after[2], before[2]);
        assert!(c.get(before[1]).is_none());
        assert_eq!(c.get(after[1]).unwrap().kind(), "Separator");
        assert!(c.get(root).unwrap().is_structure_dirty());
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn surplus_children_are_added_and_removed() {
        let mut c = container();
        c.reconcile(Element::new("List").children(vec![item("a")]));
        c.commit();
        let root = c.root_id().unwrap();

        c.reconcile(Element::new("List").children(vec![item("a"), item("b"), item("c")]));
        assert_eq!(c.children(root).len(), 3);
        c.commit();

        c.reconcile(Element::new("List").children(vec![item("a")]));
        assert_eq!(c.children(root).len(), 1);
        assert_eq!(c.len(), 2);
        let commit = c.commit().unwrap();
        assert_eq!(commit.root.children.len(), 1);
    }

    #[test]
    fn root_type_change_remounts() {
        let mut c = container();
        c.reconcile(Element::new("List"));
        let old = c.root_id().unwrap();
        c.commit();
        c.reconcile(Element::new("Detail"));
        assert_ne!(c.root_id(), Some(old));
        assert_eq!(c.len(), 1);
        assert_eq!(c.commit().unwrap().root.kind, "Detail");
    }

    #[tokio::test]
    async fn callbacks_become_handler_ids_and_keep_their_id() {
        let (bus, _rx) = MessageBus::channel();
        let mut c = Container::new(bus.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        c.reconcile(Element::new("Action").prop("title", "Open").on("onAction", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let commit = c.commit().unwrap();
        let handler = commit.root.props["onAction"].as_str().unwrap().to_string();
        assert!(handler.starts_with("handler:"));

        bus.dispatch(Event::new(handler.clone(), json!(null)).into());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A fresh closure on the next render swaps in behind the same id.
        let h = hits.clone();
        c.reconcile(Element::new("Action").prop("title", "Open").on("onAction", move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        }));
        assert!(!c.is_dirty());
        let root = c.root_id().unwrap();
        assert_eq!(c.get(root).unwrap().handler_id("onAction").unwrap().as_str(), handler);

        bus.dispatch(Event::new(handler.clone(), json!(null)).into());
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn pruned_instances_unregister_their_handlers() {
        let (bus, _rx) = MessageBus::channel();
        let mut c = Container::new(bus.clone());
        c.reconcile(Element::new("List").child(item("a").on("onAction", |_| {})));
        let commit = c.commit().unwrap();
        let handler = commit.root.children[0].props["onAction"].as_str().unwrap().to_string();
        assert_eq!(bus.subscription_count(&handler), 1);

        c.reconcile(Element::new("List"));
        assert_eq!(bus.subscription_count(&handler), 0);

        c.reconcile(Element::new("List").child(item("b").on("onAction", |_| {})));
        let commit = c.commit().unwrap();
        let again = commit.root.children[0].props["onAction"].as_str().unwrap().to_string();
        assert_ne!(again, handler);

        drop(c);
        assert_eq!(bus.subscription_count(&again), 0);
    }

    #[tokio::test]
    async fn removing_a_callback_prop_unregisters_it() {
        let (bus, _rx) = MessageBus::channel();
        let mut c = Container::new(bus.clone());
        c.reconcile(item("a").on("onAction", |_| {}));
        let handler = c.commit().unwrap().root.props["onAction"].as_str().unwrap().to_string();

        c.reconcile(item("a"));
        assert!(c.get(c.root_id().unwrap()).unwrap().is_props_dirty());
        assert_eq!(bus.subscription_count(&handler), 0);
        assert!(!c.commit().unwrap().root.props.contains_key("onAction"));
    }
}
