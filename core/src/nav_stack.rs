/// Navigation action stack for a shared back/menu control
///
/// Nested scopes push an override for the control and pop it when they go
/// away. `run_next` runs the next action that is not already running; the
/// control's icon follows the running action until it signals completion.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Fires when a started action is finished. A dropped sender counts as done.
pub type Completion = oneshot::Receiver<()>;

type RunFn = Arc<dyn Fn() -> Completion + Send + Sync>;

#[derive(Clone)]
pub struct NavigationAction {
    pub icon: String,
    run: RunFn,
}

impl NavigationAction {
    pub fn new<F>(icon: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Completion + Send + Sync + 'static,
    {
        Self {
            icon: icon.into(),
            run: Arc::new(run),
        }
    }
}

struct Entry {
    id: u64,
    action: NavigationAction,
}

#[derive(Default)]
struct Stack {
    entries: Vec<Entry>,
    open: HashSet<u64>,
    next_id: u64,
}

pub struct NavigationStack {
    stack: Arc<Mutex<Stack>>,
    icon: Arc<watch::Sender<Option<String>>>,
}

impl NavigationStack {
    pub fn new() -> Self {
        let (icon, _) = watch::channel(None);
        Self {
            stack: Arc::new(Mutex::new(Stack::default())),
            icon: Arc::new(icon),
        }
    }

    /// Add an override on top and show its icon
    pub fn push(&self, action: NavigationAction) {
        let mut stack = self.lock();
        let id = stack.next_id;
        stack.next_id += 1;
        self.icon.send_replace(Some(action.icon.clone()));
        stack.entries.push(Entry { id, action });
    }

    /// Remove the most recent override. The icon stays as it is.
    pub fn pop(&self) -> Option<NavigationAction> {
        let mut stack = self.lock();
        let entry = stack.entries.pop()?;
        stack.open.remove(&entry.id);
        Some(entry.action)
    }

    /// Start the next action that is not running yet. The returned task ends
    /// when the action signals completion.
    pub fn run_next(&self) -> Option<JoinHandle<()>> {
        let (id, own_icon, run) = {
            let mut stack = self.lock();
            let index = stack.entries.len().checked_sub(stack.open.len() + 1)?;
            let entry = &stack.entries[index];
            let (id, own_icon, run) = (entry.id, entry.action.icon.clone(), entry.action.run.clone());
            if index > 0 {
                let shown = stack.entries[index - 1].action.icon.clone();
                self.icon.send_replace(Some(shown));
            }
            stack.open.insert(id);
            (id, own_icon, run)
        };

        debug!("Running navigation action {} ({})", id, own_icon);
        let completion = run();
        let stack = self.stack.clone();
        let icon = self.icon.clone();
        Some(tokio::spawn(async move {
            let _ = completion.await;
            stack.lock().unwrap_or_else(|e| e.into_inner()).open.remove(&id);
            icon.send_replace(Some(own_icon));
        }))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    pub fn current_icon(&self) -> Option<String> {
        self.icon.borrow().clone()
    }

    pub fn icon_changes(&self) -> watch::Receiver<Option<String>> {
        self.icon.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Stack> {
        self.stack.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NavigationStack {
    fn default() -> Self {
        Self::new()
    }
}
