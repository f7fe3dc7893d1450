//! Composite task: several tasks of one world fused into a single graph node.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use super::{panic_message, PerformanceHint, Task, TaskCategory, TaskResult, TickContext};

/// One or more members of a composite task failed.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct CompositeFailure(String);

/// Runs each member's `update()` in sequence.
///
/// Members must share category and thread requirement. The composite answers
/// to every member name, and depends on the union of the members'
/// dependencies (minus the members themselves), so fusing never changes which
/// tasks wait on which.
pub struct CompositeTask {
    name: String,
    category: TaskCategory,
    primary_thread_only: bool,
    hint: PerformanceHint,
    dependencies: Vec<String>,
    aliases: Vec<String>,
    members: Vec<Arc<dyn Task>>,
}

impl CompositeTask {
    /// Fuses `members` under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `members` is empty or the members disagree on category or
    /// thread requirement.
    #[must_use]
    pub fn new(name: impl Into<String>, members: Vec<Arc<dyn Task>>) -> Self {
        let first = members.first().expect("composite task needs at least one member");
        let category = first.category();
        let primary_thread_only = first.is_primary_thread_only();

        let mut hint = PerformanceHint::None;
        let mut aliases = Vec::with_capacity(members.len());
        for member in &members {
            assert_eq!(member.category(), category, "composite members must share a category");
            assert_eq!(
                member.is_primary_thread_only(),
                primary_thread_only,
                "composite members must share a thread requirement"
            );
            // Slowest member decides
            hint = hint.min(member.performance_hint());
            aliases.push(member.name().to_owned());
            aliases.extend(member.aliases().iter().cloned());
        }

        let mut dependencies: Vec<String> = Vec::new();
        for dep in members.iter().flat_map(|m| m.dependencies()) {
            if !aliases.contains(dep) && !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }

        Self {
            name: name.into(),
            category,
            primary_thread_only,
            hint,
            dependencies,
            aliases,
            members,
        }
    }

    /// Number of fused tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false; a composite has at least one member.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Task for CompositeTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> TaskCategory {
        self.category
    }

    fn is_primary_thread_only(&self) -> bool {
        self.primary_thread_only
    }

    fn performance_hint(&self) -> PerformanceHint {
        self.hint
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn aliases(&self) -> &[String] {
        &self.aliases
    }

    fn update(&self, ctx: &TickContext) -> TaskResult {
        // A failing or panicking member must not starve the ones after it.
        let mut failures = Vec::new();
        for member in &self.members {
            match panic::catch_unwind(AssertUnwindSafe(|| member.update(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(format!("{}: {err}", member.name())),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(task = member.name(), panic = %message, "fused task panicked");
                    failures.push(format!("{}: panicked: {message}", member.name()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Box::new(CompositeFailure(failures.join("; "))))
        }
    }
}

impl std::fmt::Debug for CompositeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTask")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("members", &self.aliases)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnTask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_composite_runs_members_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let make = |name: &'static str| {
            let order = Arc::clone(&order);
            FnTask::new(name, TaskCategory::SIMULATION, move |_| {
                order.lock().push(name);
                Ok(())
            })
            .shared()
        };

        let composite = CompositeTask::new("physics", vec![make("step"), make("contacts")]);
        composite.update(&TickContext::default()).unwrap();

        assert_eq!(*order.lock(), vec!["step", "contacts"]);
    }

    #[test]
    fn test_composite_merges_dependencies_and_hints() {
        let a = FnTask::new("a", TaskCategory::SIMULATION, |_| Ok(()))
            .depends_on("input")
            .with_hint(PerformanceHint::Short)
            .shared();
        let b = FnTask::new("b", TaskCategory::SIMULATION, |_| Ok(()))
            .depends_on("a")
            .depends_on("input")
            .depends_on("net")
            .with_hint(PerformanceHint::LongSerial)
            .shared();

        let composite = CompositeTask::new("world", vec![a, b]);

        assert_eq!(composite.dependencies(), ["input".to_owned(), "net".to_owned()]);
        assert_eq!(composite.aliases(), ["a".to_owned(), "b".to_owned()]);
        assert_eq!(composite.performance_hint(), PerformanceHint::LongSerial);
    }

    #[test]
    fn test_failing_member_does_not_stop_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let failing = FnTask::new("failing", TaskCategory::RENDERING, |_| Err("nope".into())).shared();
        let after = FnTask::new("after", TaskCategory::RENDERING, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .shared();

        let composite = CompositeTask::new("gfx", vec![failing, after]);
        let err = composite.update(&TickContext::default()).unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("failing: nope"));
    }

    #[test]
    fn test_panicking_member_does_not_stop_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let panics = FnTask::new("panics", TaskCategory::SIMULATION, |_| panic!("bad state")).shared();
        let after = FnTask::new("after", TaskCategory::SIMULATION, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .shared();

        let composite = CompositeTask::new("w/simulation", vec![panics, after]);
        let err = composite.update(&TickContext::default()).unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("panics: panicked: bad state"));
    }

    #[test]
    #[should_panic(expected = "share a category")]
    fn test_mixed_categories_rejected() {
        let a = FnTask::new("a", TaskCategory::SIMULATION, |_| Ok(())).shared();
        let b = FnTask::new("b", TaskCategory::RENDERING, |_| Ok(())).shared();
        let _ = CompositeTask::new("bad", vec![a, b]);
    }
}
