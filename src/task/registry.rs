use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::error::TaskError;
use super::state::{Task, TaskState};
use crate::source::SourceDescriptor;

/// Shared handle to one registry entry.
///
/// Holders of a handle keep observing the instance they were given even if
/// the key is later replaced with a new generation.
pub struct TaskHandle {
    inner: RwLock<Task>,
}

impl TaskHandle {
    fn new(task: Task) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(task),
        })
    }

    pub fn key(&self) -> String {
        self.inner.read().key.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn state(&self) -> TaskState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> Task {
        self.inner.read().clone()
    }

    pub fn touch(&self) {
        self.inner.write().last_accessed = Instant::now();
    }

    /// Compare-and-swap on the lifecycle state.
    pub fn transition(&self, from: TaskState, to: TaskState) -> Result<(), TaskError> {
        let mut task = self.inner.write();
        if task.state != from || !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                key: task.key.clone(),
                from,
                to,
                current: task.state,
            });
        }
        task.state = to;
        debug!("Task {} (gen {}) {} -> {}", task.key, task.generation, from, to);
        Ok(())
    }

    /// Records what the source reported when it was opened.
    pub fn set_source_info(&self, content_length: Option<u64>, supports_range: bool) {
        let mut task = self.inner.write();
        if content_length.is_some() {
            task.total_length = content_length;
        }
        task.supports_range = Some(supports_range);
    }

    /// Records the final content description. Only effective while fetching.
    pub fn set_content(&self, total_length: u64, piece_count: u32, digest: String) {
        let mut task = self.inner.write();
        if task.state == TaskState::Fetching {
            task.total_length = Some(total_length);
            task.piece_count = Some(piece_count);
            task.digest = Some(digest);
        }
    }
}

/// In-memory directory of tasks keyed by task key.
///
/// The map is sharded and each entry carries its own lock, so operations on
/// one task never wait on another.
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskHandle>>,
    piece_length: u64,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new(piece_length: u64) -> Self {
        Self {
            tasks: DashMap::new(),
            piece_length,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    fn new_handle(&self, key: &str, source: &SourceDescriptor) -> Arc<TaskHandle> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        TaskHandle::new(Task::new(key, generation, source.clone(), self.piece_length))
    }

    /// Returns the entry for `key`, creating it if absent or failed.
    ///
    /// Only the caller that receives `created = true` may start a fetch.
    pub fn create_or_get(&self, key: &str, source: &SourceDescriptor) -> (Arc<TaskHandle>, bool) {
        self.create_or_get_with(key, source, |_| {})
    }

    /// Like [`create_or_get`](Self::create_or_get), running `on_create`
    /// for a new entry before any other caller can observe it.
    pub fn create_or_get_with(
        &self,
        key: &str,
        source: &SourceDescriptor,
        on_create: impl FnOnce(&TaskHandle),
    ) -> (Arc<TaskHandle>, bool) {
        match self.tasks.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() != TaskState::Fail {
                    return (entry.get().clone(), false);
                }
                let handle = self.new_handle(key, source);
                debug!(
                    "Replacing failed task {} with generation {}",
                    key,
                    handle.generation()
                );
                on_create(&handle);
                entry.insert(handle.clone());
                (handle, true)
            }
            Entry::Vacant(entry) => {
                let handle = self.new_handle(key, source);
                debug!("Created task {} (gen {})", key, handle.generation());
                on_create(&handle);
                entry.insert(handle.clone());
                (handle, true)
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<TaskHandle>, TaskError> {
        self.tasks
            .get(key)
            .map(|t| t.value().clone())
            .ok_or_else(|| TaskError::UnknownTask(key.to_string()))
    }

    pub fn transition(&self, key: &str, from: TaskState, to: TaskState) -> Result<(), TaskError> {
        self.get(key)?.transition(from, to)
    }

    pub fn touch(&self, key: &str) {
        if let Some(task) = self.tasks.get(key) {
            task.touch();
        }
    }

    pub fn list(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|t| t.value().snapshot())
            .filter(|t| predicate(t))
            .collect()
    }

    /// Removes the entry if it is still `generation` and matches `predicate`.
    pub fn remove_if(
        &self,
        key: &str,
        generation: u64,
        predicate: impl Fn(&Task) -> bool,
    ) -> Option<Arc<TaskHandle>> {
        self.tasks
            .remove_if(key, |_, handle| {
                let task = handle.snapshot();
                task.generation == generation && predicate(&task)
            })
            .map(|(_, handle)| handle)
    }

    /// Inserts an already completed task, e.g. one found on disk at startup.
    ///
    /// `age` backdates the access time so restored tasks keep their relative
    /// eviction order. Existing entries are left alone.
    pub fn restore(
        &self,
        key: &str,
        source: SourceDescriptor,
        total_length: u64,
        piece_count: u32,
        digest: String,
        age: Duration,
    ) -> Option<Arc<TaskHandle>> {
        let Entry::Vacant(entry) = self.tasks.entry(key.to_string()) else {
            return None;
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut task = Task::new(key, generation, source, self.piece_length);
        let stamp = Instant::now().checked_sub(age).unwrap_or(task.created_at);
        task.state = TaskState::Success;
        task.total_length = Some(total_length);
        task.piece_count = Some(piece_count);
        task.digest = Some(digest);
        task.created_at = stamp;
        task.last_accessed = stamp;

        let handle = TaskHandle::new(task);
        entry.insert(handle.clone());
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn source() -> SourceDescriptor {
        SourceDescriptor::new("http://example.com/file")
    }

    #[test]
    fn test_create_or_get_single_flight() {
        let registry = TaskRegistry::new(1024);
        let (first, created) = registry.create_or_get("k", &source());
        assert!(created);
        assert_eq!(first.state(), TaskState::Fetching);

        let (second, created) = registry.create_or_get("k", &source());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_create_only_one_creator() {
        let registry = Arc::new(TaskRegistry::new(1024));
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.create_or_get("shared", &source()).1
                })
            })
            .collect();

        let creators = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();
        assert_eq!(creators, 1);
    }

    #[test]
    fn test_create_hook_runs_once_per_instance() {
        let registry = TaskRegistry::new(1024);
        let mut opened = Vec::new();

        let (first, _) = registry.create_or_get_with("k", &source(), |t| opened.push(t.generation()));
        registry.create_or_get_with("k", &source(), |t| opened.push(t.generation()));
        assert_eq!(opened, vec![first.generation()]);

        first.transition(TaskState::Fetching, TaskState::Fail).unwrap();
        let (second, created) =
            registry.create_or_get_with("k", &source(), |t| opened.push(t.generation()));
        assert!(created);
        assert_eq!(opened, vec![first.generation(), second.generation()]);
    }

    #[test]
    fn test_transition_is_compare_and_swap() {
        let registry = TaskRegistry::new(1024);
        registry.create_or_get("k", &source());

        registry
            .transition("k", TaskState::Fetching, TaskState::Success)
            .unwrap();
        let err = registry
            .transition("k", TaskState::Fetching, TaskState::Fail)
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                current: TaskState::Success,
                ..
            }
        ));
        assert!(registry
            .transition("k", TaskState::Success, TaskState::Fetching)
            .is_err());
        assert!(matches!(
            registry.transition("nope", TaskState::Fetching, TaskState::Fail),
            Err(TaskError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_failed_task_is_replaced() {
        let registry = TaskRegistry::new(1024);
        let (old, _) = registry.create_or_get("k", &source());
        old.transition(TaskState::Fetching, TaskState::Fail).unwrap();

        let (new, created) = registry.create_or_get("k", &source());
        assert!(created);
        assert!(new.generation() > old.generation());
        assert_eq!(new.state(), TaskState::Fetching);
        assert_eq!(old.state(), TaskState::Fail);

        // the stale handle cannot be used to remove the new instance
        assert!(registry.remove_if("k", old.generation(), |_| true).is_none());
        assert!(registry.remove_if("k", new.generation(), |_| true).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_and_touch() {
        let registry = TaskRegistry::new(1024);
        let (a, _) = registry.create_or_get("a", &source());
        registry.create_or_get("b", &source());
        a.transition(TaskState::Fetching, TaskState::Success).unwrap();

        let before = a.snapshot().last_accessed;
        std::thread::sleep(Duration::from_millis(2));
        registry.touch("a");
        assert!(a.snapshot().last_accessed > before);

        let done = registry.list(|t| t.state == TaskState::Success);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, "a");
        assert_eq!(registry.list(|_| true).len(), 2);
    }

    #[test]
    fn test_restore() {
        let registry = TaskRegistry::new(1024);
        let old = registry
            .restore("a", source(), 2500, 3, "d".into(), Duration::from_secs(60))
            .unwrap();
        let task = old.snapshot();
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.piece_count, Some(3));
        assert!(task.last_accessed.elapsed() >= Duration::from_secs(60));

        assert!(registry
            .restore("a", source(), 1, 1, "x".into(), Duration::ZERO)
            .is_none());
    }
}
