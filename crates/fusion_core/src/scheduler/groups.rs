//! Category grouping of the universe's tasks.
//!
//! Rebuilt whenever the set of worlds changes, never per tick:
//!
//! - `all`: every task, slowest hint first
//! - one [`TaskGroup`] per category combination present, each split into
//!   primary-only and worker-eligible tasks
//! - a cache of per-mask selections, filled on first use

use std::collections::HashMap;
use std::sync::Arc;

use crate::manager::serial_order;
use crate::task::{CompositeTask, SystemWorld, Task, TaskCategory};

/// Tasks sharing one exact category combination.
#[derive(Clone, Default)]
pub struct TaskGroup {
    category: TaskCategory,
    primary: Vec<Arc<dyn Task>>,
    workers: Vec<Arc<dyn Task>>,
}

impl TaskGroup {
    /// The exact combination every member has.
    #[must_use]
    pub fn category(&self) -> TaskCategory {
        self.category
    }

    /// Members that must run on the primary thread.
    #[must_use]
    pub fn primary(&self) -> &[Arc<dyn Task>] {
        &self.primary
    }

    /// Members any worker may run.
    #[must_use]
    pub fn workers(&self) -> &[Arc<dyn Task>] {
        &self.workers
    }

    /// Total members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.primary.len() + self.workers.len()
    }

    /// True when the group has no member.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pre-sorted task lists for fast per-tick selection.
#[derive(Default)]
pub struct TaskGroups {
    all: Vec<Arc<dyn Task>>,
    groups: Vec<TaskGroup>,
    selections: HashMap<TaskCategory, Arc<[Arc<dyn Task>]>>,
}

impl TaskGroups {
    /// Collects every world's tasks. With `fuse`, same-category tasks of one
    /// world that share a thread requirement become one [`CompositeTask`].
    #[must_use]
    pub fn build(worlds: &[Arc<dyn SystemWorld>], fuse: bool) -> Self {
        let plain: Vec<Arc<dyn Task>> = worlds.iter().flat_map(|w| w.tasks()).collect();

        let all = if fuse {
            let fused: Vec<Arc<dyn Task>> = worlds.iter().flat_map(|w| fuse_world(w.as_ref())).collect();
            // Fusing can merge two ends of a cross-task chain into one node
            if serial_order(&fused).is_err() && serial_order(&plain).is_ok() {
                tracing::warn!("fusing world tasks would create a dependency cycle, scheduling them unfused");
                plain
            } else {
                fused
            }
        } else {
            plain
        };

        Self::from_tasks(all)
    }

    /// Groups an explicit task list.
    #[must_use]
    pub fn from_tasks(mut all: Vec<Arc<dyn Task>>) -> Self {
        all.sort_by_key(|t| t.performance_hint());

        let mut groups: Vec<TaskGroup> = Vec::new();
        for task in &all {
            let category = task.category();
            let index = match groups.iter().position(|g| g.category == category) {
                Some(index) => index,
                None => {
                    groups.push(TaskGroup {
                        category,
                        ..TaskGroup::default()
                    });
                    groups.len() - 1
                }
            };
            let group = &mut groups[index];
            if task.is_primary_thread_only() {
                group.primary.push(Arc::clone(task));
            } else {
                group.workers.push(Arc::clone(task));
            }
        }

        tracing::debug!(tasks = all.len(), groups = groups.len(), "task groups rebuilt");

        Self {
            all,
            groups,
            selections: HashMap::new(),
        }
    }

    /// Every task, slowest hint first.
    #[must_use]
    pub fn all(&self) -> &[Arc<dyn Task>] {
        &self.all
    }

    /// One group per category combination present.
    #[must_use]
    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    /// Tasks belonging to at least one category in `mask`, slowest hint first.
    pub fn select(&mut self, mask: TaskCategory) -> Arc<[Arc<dyn Task>]> {
        if let Some(cached) = self.selections.get(&mask) {
            return Arc::clone(cached);
        }

        let mut selected: Vec<Arc<dyn Task>> = self
            .groups
            .iter()
            .filter(|g| g.category.intersects(mask))
            .flat_map(|g| g.primary.iter().chain(&g.workers).cloned())
            .collect();
        selected.sort_by_key(|t| t.performance_hint());

        let selected: Arc<[Arc<dyn Task>]> = selected.into();
        self.selections.insert(mask, Arc::clone(&selected));
        selected
    }
}

/// Buckets one world's tasks by (category, primary) in first-seen order.
fn fuse_world(world: &dyn SystemWorld) -> Vec<Arc<dyn Task>> {
    let mut buckets: Vec<((TaskCategory, bool), Vec<Arc<dyn Task>>)> = Vec::new();
    for task in world.tasks() {
        let key = (task.category(), task.is_primary_thread_only());
        match buckets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(task),
            None => buckets.push((key, vec![task])),
        }
    }

    let mut out = Vec::with_capacity(buckets.len());
    for ((category, primary), members) in buckets {
        if members.len() == 1 {
            out.extend(members);
            continue;
        }

        // Members run in sequence, so put them in their own dependency order
        let Ok(order) = serial_order(&members) else {
            out.extend(members);
            continue;
        };
        let ordered: Vec<Arc<dyn Task>> = order.into_iter().map(|i| Arc::clone(&members[i])).collect();
        let suffix = if primary { "/primary" } else { "" };
        let name = format!("{}/{category}{suffix}", world.name());
        out.push(Arc::new(CompositeTask::new(name, ordered)));
    }
    out
}
