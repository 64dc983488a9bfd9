use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use worldspace_kernel::PackageContents;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("package not found: {0}")]
    Missing(String),
    #[error("package {package} is corrupt: {reason}")]
    Corrupt { package: String, reason: String },
}

/// A finished load, delivered on the owning thread.
#[derive(Debug)]
pub struct LoadCompletion {
    pub package: String,
    /// Request ticket; completions whose ticket no longer matches are dropped.
    pub ticket: u64,
    pub result: Result<PackageContents, LoadError>,
}

/// One-shot reply handle passed to [`PackageLoader::load_async`].
///
/// It is `Send`, so a loader may complete it from an I/O thread.
#[derive(Debug)]
pub struct LoadReply {
    package: String,
    ticket: u64,
    tx: Sender<LoadCompletion>,
}

impl LoadReply {
    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn complete(self, result: Result<PackageContents, LoadError>) {
        let completion = LoadCompletion {
            package: self.package,
            ticket: self.ticket,
            result,
        };
        if self.tx.send(completion).is_err() {
            tracing::debug!("load completion dropped: world is gone");
        }
    }
}

/// Package loading boundary.
pub trait PackageLoader {
    /// Start loading; the reply may be completed later, from any thread.
    fn load_async(&mut self, package: &str, reply: LoadReply);

    /// Load on the calling thread.
    fn load_sync(&mut self, package: &str) -> Result<PackageContents, LoadError>;

    /// Block until every outstanding async request has been completed.
    fn flush(&mut self) {}
}

/// Channel that async completions travel through back to the owning thread.
#[derive(Debug)]
pub struct LoadQueue {
    tx: Sender<LoadCompletion>,
    rx: Receiver<LoadCompletion>,
}

impl Default for LoadQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }
}

impl LoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, package: &str, ticket: u64) -> LoadReply {
        LoadReply {
            package: package.to_string(),
            ticket,
            tx: self.tx.clone(),
        }
    }

    /// Everything completed since the last drain, in completion order.
    pub fn drain(&self) -> Vec<LoadCompletion> {
        self.rx.try_iter().collect()
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    packages: HashMap<String, PackageContents>,
    corrupt: HashMap<String, String>,
    deferred: bool,
    queued: VecDeque<LoadReply>,
    requests: Vec<String>,
}

impl InMemoryState {
    fn fetch(&mut self, package: &str) -> Result<PackageContents, LoadError> {
        self.requests.push(package.to_string());
        if let Some(reason) = self.corrupt.get(package) {
            return Err(LoadError::Corrupt {
                package: package.to_string(),
                reason: reason.clone(),
            });
        }
        self.packages
            .get(package)
            .cloned()
            .ok_or_else(|| LoadError::Missing(package.to_string()))
    }
}

/// Loader backed by a package map.
///
/// Clones share state, so a test can keep a clone to release deferred
/// replies after handing the loader to a world.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    state: Rc<RefCell<InMemoryState>>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Async requests are held until [`deliver_pending`](Self::deliver_pending) or a flush.
    pub fn deferred() -> Self {
        let loader = Self::default();
        loader.state.borrow_mut().deferred = true;
        loader
    }

    pub fn insert(&self, package: impl Into<String>, contents: PackageContents) {
        self.state.borrow_mut().packages.insert(package.into(), contents);
    }

    pub fn mark_corrupt(&self, package: impl Into<String>, reason: impl Into<String>) {
        self.state
            .borrow_mut()
            .corrupt
            .insert(package.into(), reason.into());
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().queued.len()
    }

    /// Packages requested so far, sync and async, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.borrow().requests.clone()
    }

    /// Complete every held async request. Returns how many were completed.
    pub fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state.borrow_mut().queued.pop_front();
            let Some(reply) = next else { break };
            let result = self.state.borrow_mut().fetch(reply.package());
            reply.complete(result);
            delivered += 1;
        }
        delivered
    }
}

impl PackageLoader for InMemoryLoader {
    fn load_async(&mut self, package: &str, reply: LoadReply) {
        let mut state = self.state.borrow_mut();
        if state.deferred {
            state.queued.push_back(reply);
            return;
        }
        let result = state.fetch(package);
        drop(state);
        reply.complete(result);
    }

    fn load_sync(&mut self, package: &str) -> Result<PackageContents, LoadError> {
        self.state.borrow_mut().fetch(package)
    }

    fn flush(&mut self) {
        self.deliver_pending();
    }
}
