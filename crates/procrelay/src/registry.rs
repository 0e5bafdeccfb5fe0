use crate::gate::EventGate;
use procrelay_core::relay::write_line;
use procrelay_core::{BoxedWriter, ProcessId, RelayError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle of a tracked process as seen by its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Exited,
    Killed,
}

const RUNNING: u8 = 0;
const EXITED: u8 = 1;
const KILLED: u8 = 2;

/// Completion of one queued stdin write
pub type PendingWrite = oneshot::Receiver<Result<(), RelayError>>;

struct InputLine {
    text: String,
    ack: oneshot::Sender<Result<(), RelayError>>,
}

/// Everything the supervisor keeps about one running process.
///
/// Stdin is owned by a dedicated writer task fed through a queue, so writes
/// land in submission order and a slow pipe never blocks the submitter.
pub struct ProcessEntry {
    id: String,
    command: String,
    sandboxed: bool,
    pid: Option<ProcessId>,
    serial: u64,
    input: Mutex<Option<mpsc::UnboundedSender<InputLine>>>,
    state: AtomicU8,
    kill: CancellationToken,
    gate: Arc<EventGate>,
}

impl ProcessEntry {
    /// Create an entry and the input end its writer task must own.
    pub fn new(
        command: impl Into<String>,
        sandboxed: bool,
        pid: Option<ProcessId>,
        stdin: Option<BoxedWriter>,
        gate: Arc<EventGate>,
    ) -> (Self, Option<InputPump>) {
        let (input, pump) = match stdin {
            Some(stdin) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(InputPump { stdin, rx }))
            }
            None => (None, None),
        };

        let entry = Self {
            id: gate.id().to_string(),
            command: command.into(),
            sandboxed,
            pid,
            serial: 0,
            input: Mutex::new(input),
            state: AtomicU8::new(RUNNING),
            kill: CancellationToken::new(),
            gate,
        };

        (entry, pump)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn gate(&self) -> &Arc<EventGate> {
        &self.gate
    }

    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    pub fn run_state(&self) -> RunState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => RunState::Running,
            EXITED => RunState::Exited,
            _ => RunState::Killed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    pub fn mark_exited(&self) {
        // A kill in flight keeps precedence.
        let _ = self
            .state
            .compare_exchange(RUNNING, EXITED, Ordering::AcqRel, Ordering::Acquire);
        self.close_input();
    }

    /// Returns false when the process was no longer running.
    pub fn mark_killed(&self) -> bool {
        let killed = self
            .state
            .compare_exchange(RUNNING, KILLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.close_input();
        killed
    }

    /// Queue a line for the process's stdin.
    pub fn submit(&self, text: &str) -> Result<PendingWrite, RelayError> {
        if !self.is_running() {
            return Err(RelayError::NotWritable(self.id.clone()));
        }

        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = input.as_ref() else {
            return Err(RelayError::NotWritable(self.id.clone()));
        };

        let (ack, pending) = oneshot::channel();
        tx.send(InputLine {
            text: text.to_string(),
            ack,
        })
        .map_err(|_| RelayError::NotWritable(self.id.clone()))?;

        Ok(pending)
    }

    fn close_input(&self) {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Owner of a process's stdin, draining the entry's input queue
pub struct InputPump {
    stdin: BoxedWriter,
    rx: mpsc::UnboundedReceiver<InputLine>,
}

impl InputPump {
    /// Write queued lines until the queue closes or the pipe fails.
    pub async fn run(mut self) {
        while let Some(InputLine { text, ack }) = self.rx.recv().await {
            let result = write_line(&mut self.stdin, &text).await;
            let failed = result.is_err();
            let _ = ack.send(result);
            if failed {
                break;
            }
        }

        // Fail anything queued behind a broken pipe.
        self.rx.close();
        while let Ok(InputLine { ack, .. }) = self.rx.try_recv() {
            let _ = ack.send(Err(RelayError::Write("stdin is closed".to_string())));
        }
    }
}

/// Directory of tracked processes keyed by id.
///
/// Every operation is a single critical section over the map.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    next_serial: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ProcessEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `entry`, failing if its id is already tracked.
    pub fn put(&self, mut entry: ProcessEntry) -> Result<Arc<ProcessEntry>, RelayError> {
        let mut entries = self.entries();
        if entries.contains_key(&entry.id) {
            return Err(RelayError::AlreadyExists(entry.id));
        }

        entry.serial = self.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(entry);
        entries.insert(entry.id.clone(), entry.clone());
        debug!("Registered process {} (serial {})", entry.id, entry.serial);
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ProcessEntry>, RelayError> {
        self.entries()
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::process_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Remove whatever is tracked under `id`; absent ids are a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<ProcessEntry>> {
        self.entries().remove(id)
    }

    /// Remove `entry` only if it is still the one tracked under its id.
    pub fn remove_entry(&self, entry: &ProcessEntry) -> bool {
        let mut entries = self.entries();
        match entries.get(&entry.id) {
            Some(current) if current.serial == entry.serial => {
                entries.remove(&entry.id);
                debug!("Unregistered process {} (serial {})", entry.id, entry.serial);
                true
            }
            _ => false,
        }
    }

    /// Remove and return every tracked entry.
    pub fn drain(&self) -> Vec<Arc<ProcessEntry>> {
        self.entries().drain().map(|(_, entry)| entry).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procrelay_core::ChannelSink;

    fn entry(id: &str, stdin: Option<BoxedWriter>) -> (ProcessEntry, Option<InputPump>) {
        let (sink, _rx) = ChannelSink::new();
        let gate = Arc::new(EventGate::new(id, Arc::new(sink)));
        ProcessEntry::new("cat", false, Some(42), stdin, gate)
    }

    #[test]
    fn test_put_get_remove() {
        let registry = ProcessRegistry::new();
        let (e, _) = entry("a", None);
        let tracked = registry.put(e).unwrap();
        assert_eq!(tracked.id(), "a");
        assert_eq!(tracked.pid(), Some(42));
        assert!(registry.contains("a"));

        let (dup, _) = entry("a", None);
        assert!(matches!(registry.put(dup), Err(RelayError::AlreadyExists(_))));

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(matches!(registry.get("a"), Err(e) if e.is_not_found()));
    }

    #[test]
    fn test_stale_cleanup_keeps_newer_entry() {
        let registry = ProcessRegistry::new();
        let (first, _) = entry("a", None);
        let first = registry.put(first).unwrap();
        registry.remove("a");

        let (second, _) = entry("a", None);
        let second = registry.put(second).unwrap();
        assert_ne!(first.serial(), second.serial());

        assert!(!registry.remove_entry(&first));
        assert!(registry.contains("a"));
        assert!(registry.remove_entry(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain() {
        let registry = ProcessRegistry::new();
        for id in ["a", "b", "c"] {
            registry.put(entry(id, None).0).unwrap();
        }

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert_eq!(registry.drain().len(), 3);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_state_transitions() {
        let (e, _) = entry("a", None);
        assert!(e.is_running());
        assert!(e.mark_killed());
        assert!(!e.mark_killed());
        e.mark_exited();
        assert_eq!(e.run_state(), RunState::Killed);
    }

    #[tokio::test]
    async fn test_writes_arrive_in_order() {
        use tokio::io::AsyncReadExt;

        let (writer, mut reader) = tokio::io::duplex(64);
        let (e, pump) = entry("a", Some(Box::new(writer)));
        let pump = tokio::spawn(pump.unwrap().run());

        let first = e.submit("one").unwrap();
        let second = e.submit("two").unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        e.mark_exited();
        assert!(matches!(e.submit("three"), Err(RelayError::NotWritable(_))));
        pump.await.unwrap();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_write_without_stdin_is_rejected() {
        let (e, pump) = entry("a", None);
        assert!(pump.is_none());
        assert!(matches!(e.submit("x"), Err(RelayError::NotWritable(_))));
    }
}
